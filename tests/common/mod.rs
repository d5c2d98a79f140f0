//! 集成测试共用的夹具
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use admission::cache::{CachedBlock, LocalStore, RateLimitStore, StoreError, WindowCount};
use admission::config::{AdmissionSettings, RateLimitConfig};
use admission::limiter::AdmissionEngine;
use admission::security::{SecurityEvent, SecurityEventKind, SecuritySink, SinkError};
use admission::utils::{Clock, ManualClock};
use async_trait::async_trait;

pub const START_MS: i64 = 1_700_000_000_000;

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(START_MS))
}

pub fn per_minute(max_requests: u32) -> RateLimitConfig {
    RateLimitConfig::new(Duration::from_secs(60), max_requests, "auth", "too many requests")
}

pub fn settings() -> AdmissionSettings {
    AdmissionSettings {
        backend_timeout: Duration::from_millis(50),
        ..AdmissionSettings::default()
    }
}

/// 使用手动时钟与可检查的本地存储构建引擎
pub fn local_engine(clock: &Arc<ManualClock>) -> (Arc<LocalStore>, AdmissionEngine) {
    let local = Arc::new(LocalStore::with_clock(clock.clone()));
    let engine = AdmissionEngine::with_parts(settings(), local.clone(), clock.clone());
    (local, engine)
}

/// 可注入故障、健康状态和延迟的存储
pub struct FlakyStore {
    inner: LocalStore,
    failing: AtomicBool,
    healthy: AtomicBool,
    stall: Mutex<Option<Duration>>,
    block_stall: Mutex<Option<(u64, Duration)>>,
    calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: LocalStore::with_clock(clock),
            failing: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            stall: Mutex::new(None),
            block_stall: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(clock: Arc<dyn Clock>) -> Self {
        let store = Self::new(clock);
        store.set_failing(true);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn stall_for(&self, delay: Duration) {
        *self.stall.lock().unwrap() = Some(delay);
    }

    /// 仅延迟第 `violations` 次违规对应的封禁写入
    pub fn stall_block_for(&self, violations: u64, delay: Duration) {
        *self.block_stall.lock().unwrap() = Some((violations, delay));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &LocalStore {
        &self.inner
    }

    async fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stall = *self.stall.lock().unwrap();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.enter().await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.enter().await?;
        self.inner.set(key, value, ttl).await
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        self.enter().await?;
        self.inner.increment(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.enter().await?;
        self.inner.expire(key, ttl).await
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.enter().await?;
        self.inner.time_to_live(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.enter().await?;
        self.inner.delete(key).await
    }

    async fn increment_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        self.enter().await?;
        self.inner.increment_window(key, window).await
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        self.enter().await?;
        self.inner.increment_with_ttl(key, ttl).await
    }

    async fn extend_block(
        &self,
        key: &str,
        block: &CachedBlock,
        ttl: Duration,
    ) -> Result<i64, StoreError> {
        self.enter().await?;
        let stall = *self.block_stall.lock().unwrap();
        if let Some((violations, delay)) = stall {
            if block.violations == violations {
                tokio::time::sleep(delay).await;
            }
        }
        self.inner.extend_block(key, block, ttl).await
    }
}

/// 记录所有事件的审计接收端
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SecurityEvent>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        sink
    }

    pub fn kinds(&self) -> Vec<SecurityEventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    /// 事件由后台任务投递，轮询直到收到 `n` 条
    pub async fn wait_for(&self, n: usize) -> Vec<SecurityEventKind> {
        for _ in 0..100 {
            if self.events.lock().unwrap().len() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.kinds()
    }
}

#[async_trait]
impl SecuritySink for RecordingSink {
    async fn record_security_event(&self, event: SecurityEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SinkError("audit log offline".into()));
        }
        Ok(())
    }
}
