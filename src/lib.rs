use std::sync::Arc;

use config::Config;
use limiter::AdmissionEngine;

pub mod cache;
pub mod config;
pub mod error;
pub mod limiter;
pub mod middleware;
pub mod security;
pub mod utils;

pub use config::{AdmissionSettings, EscalationPolicy, RateLimitConfig};
pub use limiter::{RateLimitDecision, RateLimitInfo};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub limiter: Arc<AdmissionEngine>,
}
