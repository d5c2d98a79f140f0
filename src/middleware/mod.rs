mod client_ip;
mod rate_limit;

pub use client_ip::{UNKNOWN_IDENTITY, resolve_client_identity};
pub use rate_limit::{RateLimitGate, apply_rate_limit_headers, rate_limit};
