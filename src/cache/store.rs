//! 限流存储后端抽象
//!
//! 共享存储（Redis）与进程内存储实现同一套原子计数接口，
//! 准入引擎只依赖这个 trait，不关心具体后端。

use std::time::Duration;

use async_trait::async_trait;

use super::models::{CachedBlock, WindowCount};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("value stored at {key} is not an integer")]
    NotAnInteger { key: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// 后端名称，用于日志
    fn name(&self) -> &'static str;

    /// 就绪探针，返回 false 时引擎不会选用该后端
    fn is_healthy(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// 写入值，`ttl` 为 None 表示不过期
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// 原子自增并返回新值，不存在时从 0 开始
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// 设置过期时间，键不存在时返回 false
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// 剩余存活时间，键不存在或没有过期时间时返回 None
    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// 固定窗口计数：自增，首次计数时以 `window` 作为窗口长度。
    /// 自增与设置过期必须在一步内完成。
    async fn increment_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError>;

    /// 自增并刷新过期时间，一步完成
    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// 写入封禁，已有封禁更长时保留原封禁。返回生效的解封时间。
    ///
    /// 比较与写入必须原子完成，并发违规不能把封禁缩短。
    async fn extend_block(
        &self,
        key: &str,
        block: &CachedBlock,
        ttl: Duration,
    ) -> Result<i64, StoreError>;

    /// 清理过期条目，返回清理数量；自带 TTL 的后端无需实现
    async fn sweep(&self) -> usize {
        0
    }
}
