//! Redis 限流存储
//!
//! 多实例部署时共享限流状态。只有连接类错误（IO、断连、拒绝连接、超时）
//! 会把健康标记置为 false，单个键上的服务端错误不影响其他键。
//! 任意一次成功调用或健康探测会恢复它，所以生产环境应通过
//! [`RedisStore::connect_monitored`] 连接，或自行调用 [`RedisStore::spawn_health_probe`]。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use redis::{RedisError, RedisResult, Script};
use redis::aio::ConnectionManager;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::models::{CachedBlock, WindowCount};
use crate::cache::store::{RateLimitStore, StoreError};
use crate::utils::clock::duration_millis;

// 计数与补设过期时间在同一个脚本里执行
static INCREMENT_WINDOW: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
",
    )
});

// 只有新封禁更晚结束时才覆盖
static EXTEND_BLOCK: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local current = redis.call('GET', KEYS[1])
if current then
  local ok, block = pcall(cjson.decode, current)
  if ok and type(block) == 'table' then
    local until_ms = tonumber(block['blocked_until'])
    if until_ms and until_ms >= tonumber(ARGV[2]) then
      return until_ms
    end
  end
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[3])
return tonumber(ARGV[2])
",
    )
});

pub struct RedisStore {
    connection: ConnectionManager,
    healthy: AtomicBool,
}

impl RedisStore {
    /// 连接 Redis 并执行一次 PING
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| {
            warn!("Failed to create Redis client for rate limiting: {}", e);
            StoreError::Redis(e)
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            warn!("Failed to connect to Redis for rate limiting: {}", e);
            StoreError::Redis(e)
        })?;

        let store = Self {
            connection,
            healthy: AtomicBool::new(false),
        };
        store.ping().await?;
        info!("Connected to Redis for rate limiting");

        Ok(store)
    }

    /// 连接并启动健康探测
    pub async fn connect_monitored(url: &str, every: Duration) -> Result<Arc<Self>, StoreError> {
        let store = Arc::new(Self::connect(url).await?);
        Arc::clone(&store).spawn_health_probe(every);
        Ok(store)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let result = redis::cmd("PING").query_async::<String>(&mut conn).await;
        self.track(result).map(|_| ())
    }

    /// 定期 PING，用于故障恢复后重新启用共享存储
    pub fn spawn_health_probe(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        let every = every.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let was_healthy = self.is_healthy();
                match self.ping().await {
                    Ok(()) if !was_healthy => info!("Redis rate limit store recovered"),
                    Ok(()) => debug!("Redis rate limit store healthy"),
                    Err(e) if was_healthy => warn!("Redis rate limit store unhealthy: {}", e),
                    Err(_) => {}
                }
            }
        })
    }

    fn track<T>(&self, result: RedisResult<T>) -> Result<T, StoreError> {
        match result {
            Ok(value) => {
                self.healthy.store(true, Ordering::Relaxed);
                Ok(value)
            }
            Err(e) => {
                if is_connection_failure(&e) {
                    self.healthy.store(false, Ordering::Relaxed);
                }
                Err(StoreError::Redis(e))
            }
        }
    }
}

/// 连接层面的故障；WRONGTYPE 之类的服务端回复说明连接仍然可用
fn is_connection_failure(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

fn positive_millis(ttl: Duration) -> i64 {
    duration_millis(ttl).max(1)
}

#[async_trait]
impl RateLimitStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        let result = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await;
        self.track(result)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(positive_millis(ttl));
        }
        let result = cmd.query_async::<()>(&mut conn).await;
        self.track(result)
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        let result = redis::cmd("INCR")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await;
        self.track(result)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let result = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(positive_millis(ttl))
            .query_async::<i64>(&mut conn)
            .await;
        self.track(result).map(|applied| applied == 1)
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.connection.clone();
        let result = redis::cmd("PTTL")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await;
        // -2 键不存在，-1 没有过期时间
        self.track(result)
            .map(|ttl| u64::try_from(ttl).ok().map(Duration::from_millis))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let result = redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await;
        self.track(result).map(|_| ())
    }

    async fn increment_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let mut conn = self.connection.clone();
        let result = INCREMENT_WINDOW
            .key(key)
            .arg(positive_millis(window))
            .invoke_async::<(i64, i64)>(&mut conn)
            .await;
        let (count, ttl) = self.track(result)?;

        Ok(WindowCount {
            count: u64::try_from(count).unwrap_or(0),
            reset_in: Some(
                u64::try_from(ttl)
                    .map(Duration::from_millis)
                    .unwrap_or(window),
            ),
        })
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        let result = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(positive_millis(ttl))
            .ignore()
            .query_async::<(i64,)>(&mut conn)
            .await;
        self.track(result).map(|(count,)| count)
    }

    async fn extend_block(
        &self,
        key: &str,
        block: &CachedBlock,
        ttl: Duration,
    ) -> Result<i64, StoreError> {
        let payload = block.encode()?;
        let mut conn = self.connection.clone();
        let result = EXTEND_BLOCK
            .key(key)
            .arg(payload)
            .arg(block.blocked_until)
            .arg(positive_millis(ttl))
            .invoke_async::<i64>(&mut conn)
            .await;
        self.track(result)
    }
}
