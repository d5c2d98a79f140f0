pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

/// 限流响应头
pub mod headers {
    pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
    pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
    pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";
    pub const RETRY_AFTER: &str = "retry-after";
    pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
    pub const X_REAL_IP: &str = "x-real-ip";
}

pub mod error_codes {
    pub const RATE_LIMIT: i32 = 1005;
    pub const BLOCKED: i32 = 1006;

    /// 拒绝响应中稳定的原因码
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
}
