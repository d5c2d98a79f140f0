//! 请求准入
//!
//! - 固定窗口配额计数（按 `prefix:identity[:endpoint]` 分桶）
//! - 按身份累计违规，逐级升级为临时封禁
//! - 共享存储不可用时逐次降级到进程内存储，全部失败时放行

pub mod escalation;
pub mod service;
pub mod types;

pub use service::AdmissionEngine;
pub use types::{RateLimitDecision, RateLimitInfo};
