//! 准入引擎
//!
//! 每次调用独立选择后端：共享存储健康时优先使用，出错或超时则本次调用
//! 退回进程内存储。两个后端都失败时按放行策略处理。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

use crate::cache::keys::{block_key, quota_key, violation_key};
use crate::cache::{CachedBlock, LocalStore, RateLimitStore, StoreError};
use crate::config::{AdmissionSettings, RateLimitConfig};
use crate::error::AdmissionError;
use crate::security::{SecurityEvent, SecurityEventKind, SecuritySink, Severity, TracingSecuritySink};
use crate::utils::clock::{Clock, SystemClock, duration_millis};

use super::types::{RateLimitDecision, retry_after_secs};

pub struct AdmissionEngine {
    settings: AdmissionSettings,
    local: Arc<dyn RateLimitStore>,
    shared: RwLock<Option<Arc<dyn RateLimitStore>>>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn SecuritySink>,
}

impl AdmissionEngine {
    /// 仅使用进程内存储的引擎
    pub fn new(settings: AdmissionSettings) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let local = Arc::new(LocalStore::with_clock(Arc::clone(&clock)));
        Self::with_parts(settings, local, clock)
    }

    /// 显式注入本地后端与时钟（测试用）
    pub fn with_parts(
        settings: AdmissionSettings,
        local: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            local,
            shared: RwLock::new(None),
            clock,
            sink: Arc::new(TracingSecuritySink),
        }
    }

    pub fn with_shared_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.shared = RwLock::new(Some(store));
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn SecuritySink>) -> Self {
        self.sink = sink;
        self
    }

    /// 运行期接入共享存储
    ///
    /// 引擎只读取健康标记，标记的恢复由存储自身负责（见 `RedisStore::connect_monitored`）。
    pub async fn attach_shared_store(&self, store: Arc<dyn RateLimitStore>) {
        info!(backend = store.name(), "Attached shared rate limit store");
        *self.shared.write().await = Some(store);
    }

    pub async fn detach_shared_store(&self) {
        if self.shared.write().await.take().is_some() {
            info!("Detached shared rate limit store");
        }
    }

    pub fn settings(&self) -> &AdmissionSettings {
        &self.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// 检查并计数。从不返回错误：内部故障时放行并打上 `failed_open`。
    pub async fn check_rate_limit(
        &self,
        identity: &str,
        config: &RateLimitConfig,
        endpoint: Option<&str>,
    ) -> RateLimitDecision {
        if !self.settings.enabled {
            return RateLimitDecision::unmetered(config, self.now_millis());
        }

        match self.evaluate(identity, config, endpoint).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(
                    identity = %identity,
                    prefix = %config.key_prefix,
                    error = %e,
                    "Rate limit evaluation failed on every backend, allowing request"
                );
                RateLimitDecision::fail_open(config, self.now_millis())
            }
        }
    }

    async fn evaluate(
        &self,
        identity: &str,
        config: &RateLimitConfig,
        endpoint: Option<&str>,
    ) -> Result<RateLimitDecision, AdmissionError> {
        if let Some(blocked_until) = self.read_block(identity).await? {
            debug!(identity = %identity, blocked_until, "Request rejected by active block");
            return Ok(RateLimitDecision::blocked(
                config,
                blocked_until,
                self.now_millis(),
            ));
        }

        let key = quota_key(&config.key_prefix, identity, endpoint);
        let window = config.window;
        let counted = self
            .dispatch("increment_window", |store| {
                let key = key.clone();
                async move { store.increment_window(&key, window).await }
            })
            .await?;

        let now = self.now_millis();
        let reset_time = match counted.reset_in {
            Some(ttl) => now.saturating_add(duration_millis(ttl)),
            None => now.saturating_add(config.window_ms()),
        };
        let decision = RateLimitDecision::counted(config, counted.count, reset_time, now);

        debug!(
            key = %key,
            count = counted.count,
            limit = config.max_requests,
            allowed = decision.allowed,
            "Rate limit checked"
        );

        if !decision.allowed {
            // 违规记录失败不改变本次拒绝
            if let Err(e) = self.record_violation(identity, config).await {
                warn!(identity = %identity, error = %e, "Failed to record rate limit violation");
            }
        }

        Ok(decision)
    }

    /// 查看当前窗口状态，不计数
    pub async fn peek_rate_limit(
        &self,
        identity: &str,
        config: &RateLimitConfig,
        endpoint: Option<&str>,
    ) -> RateLimitDecision {
        let now = self.now_millis();
        if !self.settings.enabled {
            return RateLimitDecision::unmetered(config, now);
        }

        if let Ok(Some(blocked_until)) = self.read_block(identity).await {
            return RateLimitDecision::blocked(config, blocked_until, now);
        }

        let key = quota_key(&config.key_prefix, identity, endpoint);
        let state = self
            .dispatch("peek", |store| {
                let key = key.clone();
                async move {
                    let count = store.get(&key).await?;
                    let ttl = store.time_to_live(&key).await?;
                    Ok((count, ttl))
                }
            })
            .await;

        match state {
            Ok((count, ttl)) => {
                let count = count.and_then(|raw| raw.parse::<u64>().ok()).unwrap_or(0);
                let reset_time = match ttl {
                    Some(ttl) => now.saturating_add(duration_millis(ttl)),
                    None => now.saturating_add(config.window_ms()),
                };
                let mut decision = RateLimitDecision::counted(config, count, reset_time, now);
                // 下一次请求是否还能通过
                decision.allowed = count < u64::from(config.max_requests);
                if !decision.allowed {
                    decision.retry_after = Some(retry_after_secs(reset_time, now));
                }
                decision
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to peek rate limit state");
                RateLimitDecision::fail_open(config, now)
            }
        }
    }

    /// 身份当前是否被封禁，返回解封时间（Unix 毫秒）
    pub async fn is_blocked(&self, identity: &str) -> Option<i64> {
        match self.read_block(identity).await {
            Ok(until) => until,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Failed to read block state");
                None
            }
        }
    }

    pub(super) async fn read_block(&self, identity: &str) -> Result<Option<i64>, AdmissionError> {
        let key = block_key(identity);
        let raw = self
            .dispatch("read_block", |store| {
                let key = key.clone();
                async move { store.get(&key).await }
            })
            .await?;

        let now = self.now_millis();
        Ok(raw.and_then(|raw| match CachedBlock::decode(&raw) {
            Ok(block) => block.is_active(now).then_some(block.blocked_until),
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring unreadable block entry");
                None
            }
        }))
    }

    /// 管理操作：封禁身份 `duration`，覆盖已有封禁
    pub async fn block_identity(
        &self,
        identity: &str,
        duration: Duration,
    ) -> Result<i64, AdmissionError> {
        let blocked_until = self.now_millis().saturating_add(duration_millis(duration));
        let key = block_key(identity);
        let payload = CachedBlock::new(identity, blocked_until, 0)
            .encode()
            .map_err(|e| AdmissionError::Store {
                backend: "codec",
                op: "block_identity",
                source: StoreError::Serialization(e),
            })?;

        self.dispatch("block_identity", |store| {
            let key = key.clone();
            let payload = payload.clone();
            async move { store.set(&key, &payload, Some(duration)).await }
        })
        .await?;

        info!(identity = %identity, blocked_until, "Identity blocked by administrator");
        self.notify(SecurityEvent::new(
            SecurityEventKind::IdentityBlocked,
            Severity::High,
            format!("identity {} blocked manually", identity),
            serde_json::json!({
                "identity": identity,
                "blocked_until": blocked_until,
                "manual": true,
            }),
        ));

        Ok(blocked_until)
    }

    /// 管理操作：解除封禁并清空违规计数
    pub async fn unblock_identity(&self, identity: &str) -> Result<(), AdmissionError> {
        self.delete_everywhere("unblock_identity", &block_key(identity))
            .await?;
        self.delete_everywhere("unblock_identity", &violation_key(identity))
            .await?;

        info!(identity = %identity, "Identity unblocked");
        self.notify(SecurityEvent::new(
            SecurityEventKind::IdentityUnblocked,
            Severity::Low,
            format!("identity {} unblocked", identity),
            serde_json::json!({ "identity": identity }),
        ));
        Ok(())
    }

    /// 管理操作：清零某个限流桶的计数
    pub async fn reset(
        &self,
        key_prefix: &str,
        identity: &str,
        endpoint: Option<&str>,
    ) -> Result<(), AdmissionError> {
        let key = quota_key(key_prefix, identity, endpoint);
        self.delete_everywhere("reset", &key).await?;
        info!(key = %key, "Rate limit counter reset");
        Ok(())
    }

    /// 启动本地存储的定期清扫任务
    pub fn start_sweep_task(&self) -> JoinHandle<()> {
        let local = Arc::clone(&self.local);
        let period = self.settings.sweep_interval.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // 第一次 tick 立即返回
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = local.sweep().await;
                debug!(removed, "Rate limiter cleanup completed");
            }
        })
    }

    pub(super) fn notify(&self, event: SecurityEvent) {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(e) = sink.record_security_event(event).await {
                warn!(error = %e, "Failed to record security event");
            }
        });
    }

    async fn healthy_shared(&self) -> Option<Arc<dyn RateLimitStore>> {
        let slot = self.shared.read().await;
        slot.as_ref().filter(|store| store.is_healthy()).cloned()
    }

    /// 在选定后端上执行一次操作
    ///
    /// 共享存储健康时先试共享存储（带超时），失败则本次退回本地存储。
    pub(super) async fn dispatch<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, AdmissionError>
    where
        F: Fn(Arc<dyn RateLimitStore>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if let Some(shared) = self.healthy_shared().await {
            let backend = shared.name();
            match timeout(self.settings.backend_timeout, call(shared)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => warn!(
                    op,
                    backend,
                    error = %e,
                    "Shared rate limit store failed, falling back to local store"
                ),
                Err(_) => warn!(
                    op,
                    backend,
                    timeout_ms = duration_millis(self.settings.backend_timeout),
                    "Shared rate limit store timed out, falling back to local store"
                ),
            }
        }

        let local = Arc::clone(&self.local);
        let backend = local.name();
        call(local)
            .await
            .map_err(|source| AdmissionError::Store { backend, op, source })
    }

    /// 删除本地与共享存储中的同一个键，后端切换后两边都可能留有状态
    async fn delete_everywhere(&self, op: &'static str, key: &str) -> Result<(), AdmissionError> {
        if let Some(shared) = self.healthy_shared().await {
            let backend = shared.name();
            match timeout(self.settings.backend_timeout, shared.delete(key)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(op, backend, key, error = %e, "Failed to delete from shared store"),
                Err(_) => warn!(op, backend, key, "Timed out deleting from shared store"),
            }
        }

        let backend = self.local.name();
        self.local
            .delete(key)
            .await
            .map_err(|source| AdmissionError::Store { backend, op, source })
    }
}
