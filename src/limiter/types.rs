//! 准入判定结果

use serde::Serialize;

use crate::config::RateLimitConfig;
use crate::utils::clock::millis_to_secs_ceil;

/// 判定附带的限流信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    /// 当前窗口配额
    pub limit: u32,
    /// 当前窗口已计数（含本次）
    pub current: u64,
    pub remaining: u32,
    /// 窗口结束或封禁解除时间，Unix 毫秒时间戳
    pub reset_time: i64,
    pub is_blocked: bool,
}

impl RateLimitInfo {
    /// 重置时间，Unix 秒
    pub fn reset_time_secs(&self) -> i64 {
        millis_to_secs_ceil(self.reset_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub info: RateLimitInfo,
    /// 拒绝时建议的重试间隔（秒）
    pub retry_after: Option<u64>,
    /// 所有后端都失败后按放行策略通过
    pub failed_open: bool,
}

impl RateLimitDecision {
    /// 根据窗口计数得出的判定
    pub fn counted(config: &RateLimitConfig, count: u64, reset_time: i64, now: i64) -> Self {
        let limit = config.max_requests;
        let allowed = count <= u64::from(limit);
        let remaining = u32::try_from(u64::from(limit).saturating_sub(count)).unwrap_or(0);

        Self {
            allowed,
            info: RateLimitInfo {
                limit,
                current: count,
                remaining,
                reset_time,
                is_blocked: false,
            },
            retry_after: (!allowed).then(|| retry_after_secs(reset_time, now)),
            failed_open: false,
        }
    }

    /// 身份处于封禁中，不做配额计数
    pub fn blocked(config: &RateLimitConfig, blocked_until: i64, now: i64) -> Self {
        Self {
            allowed: false,
            info: RateLimitInfo {
                limit: config.max_requests,
                current: 0,
                remaining: 0,
                reset_time: blocked_until,
                is_blocked: true,
            },
            retry_after: Some(retry_after_secs(blocked_until, now)),
            failed_open: false,
        }
    }

    /// 引擎无法完成判定时放行，避免限流故障演变成整站故障
    pub fn fail_open(config: &RateLimitConfig, now: i64) -> Self {
        Self {
            failed_open: true,
            ..Self::unmetered(config, now)
        }
    }

    /// 限流关闭时的判定
    pub fn unmetered(config: &RateLimitConfig, now: i64) -> Self {
        Self {
            allowed: true,
            info: RateLimitInfo {
                limit: config.max_requests,
                current: 0,
                remaining: config.max_requests,
                reset_time: now.saturating_add(config.window_ms()),
                is_blocked: false,
            },
            retry_after: None,
            failed_open: false,
        }
    }
}

/// 距 `until` 的秒数，至少 1 秒
pub fn retry_after_secs(until: i64, now: i64) -> u64 {
    u64::try_from(millis_to_secs_ceil(until.saturating_sub(now)))
        .unwrap_or(0)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(max: u32) -> RateLimitConfig {
        RateLimitConfig::new(Duration::from_secs(60), max, "auth", "too many")
    }

    #[test]
    fn counted_allows_up_to_limit() {
        let at_limit = RateLimitDecision::counted(&config(5), 5, 60_000, 0);
        assert!(at_limit.allowed);
        assert_eq!(at_limit.info.remaining, 0);
        assert_eq!(at_limit.retry_after, None);

        let over = RateLimitDecision::counted(&config(5), 6, 60_000, 10_500);
        assert!(!over.allowed);
        assert_eq!(over.info.current, 6);
        assert_eq!(over.info.remaining, 0);
        assert_eq!(over.retry_after, Some(50));
    }

    #[test]
    fn blocked_reports_block_deadline() {
        let decision = RateLimitDecision::blocked(&config(5), 300_000, 0);
        assert!(!decision.allowed);
        assert!(decision.info.is_blocked);
        assert_eq!(decision.info.reset_time, 300_000);
        assert_eq!(decision.retry_after, Some(300));
    }

    #[test]
    fn fail_open_is_flagged() {
        let decision = RateLimitDecision::fail_open(&config(5), 1_000);
        assert!(decision.allowed);
        assert!(decision.failed_open);
        assert_eq!(decision.info.reset_time, 61_000);
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        assert_eq!(retry_after_secs(1_000, 1_000), 1);
        assert_eq!(retry_after_secs(0, 5_000), 1);
        assert_eq!(retry_after_secs(2_001, 0), 3);
    }
}
