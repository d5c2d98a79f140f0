use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 一次窗口计数的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// 本窗口内的请求数（含本次）
    pub count: u64,
    /// 距窗口结束的剩余时间，后端无法给出时为 None
    pub reset_in: Option<Duration>,
}

/// 封禁记录缓存数据模型
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CachedBlock {
    pub identity: String,
    pub blocked_until: i64, // Unix 毫秒时间戳
    pub violations: u64,
}

impl CachedBlock {
    pub fn new(identity: &str, blocked_until: i64, violations: u64) -> Self {
        Self {
            identity: identity.to_string(),
            blocked_until,
            violations,
        }
    }

    pub fn is_active(&self, now_millis: i64) -> bool {
        now_millis < self.blocked_until
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
