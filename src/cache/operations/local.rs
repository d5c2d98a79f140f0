//! 进程内限流存储
//!
//! 共享存储不可用时的降级后端。条目按键加锁（DashMap 分片锁），
//! 过期条目在读取时惰性删除，并由后台任务定期清扫。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::cache::models::{CachedBlock, WindowCount};
use crate::cache::store::{RateLimitStore, StoreError};
use crate::utils::clock::{Clock, SystemClock, duration_millis};

#[derive(Debug, Clone, PartialEq)]
enum LocalValue {
    Counter(i64),
    Text(String),
}

#[derive(Debug, Clone)]
struct LocalEntry {
    value: LocalValue,
    /// Unix 毫秒时间戳，None 表示不过期
    expires_at: Option<i64>,
}

impl LocalEntry {
    fn counter(count: i64, expires_at: Option<i64>) -> Self {
        Self {
            value: LocalValue::Counter(count),
            expires_at,
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }

    fn render(&self) -> String {
        match &self.value {
            LocalValue::Counter(n) => n.to_string(),
            LocalValue::Text(s) => s.clone(),
        }
    }

    fn remaining(&self, now: i64) -> Option<Duration> {
        self.expires_at
            .map(|at| Duration::from_millis(u64::try_from(at - now).unwrap_or(0)))
    }

    fn increment(&mut self, key: &str) -> Result<i64, StoreError> {
        let current = match &self.value {
            LocalValue::Counter(n) => *n,
            LocalValue::Text(s) => s.trim().parse::<i64>().map_err(|_| StoreError::NotAnInteger {
                key: key.to_string(),
            })?,
        };
        let next = current.checked_add(1).ok_or_else(|| StoreError::NotAnInteger {
            key: key.to_string(),
        })?;
        self.value = LocalValue::Counter(next);
        Ok(next)
    }
}

pub struct LocalStore {
    entries: DashMap<String, LocalEntry>,
    clock: Arc<dyn Clock>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// 当前条目数（含尚未清扫的过期条目）
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    fn evict_expired(&self, key: &str, now: i64) {
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.now();
        self.evict_expired(key, now);
        Ok(self.entries.get(key).map(|entry| entry.render()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| self.now().saturating_add(duration_millis(ttl)));
        self.entries.insert(
            key.to_string(),
            LocalEntry {
                value: LocalValue::Text(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(LocalEntry::counter(1, None));
                    return Ok(1);
                }
                occupied.get_mut().increment(key)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LocalEntry::counter(1, None));
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.now();
        self.evict_expired(key, now);
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(now.saturating_add(duration_millis(ttl)));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = self.now();
        self.evict_expired(key, now);
        Ok(self.entries.get(key).and_then(|entry| entry.remaining(now)))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn increment_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let now = self.now();
        let fresh_until = now.saturating_add(duration_millis(window));

        // 读-改-写在同一个条目锁内完成
        let (count, expires_at) = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                let entry = occupied.get_mut();
                let count = entry.increment(key)?;
                let expires_at = *entry.expires_at.get_or_insert(fresh_until);
                (count, expires_at)
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(LocalEntry::counter(1, Some(fresh_until)));
                (1, fresh_until)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LocalEntry::counter(1, Some(fresh_until)));
                (1, fresh_until)
            }
        };

        Ok(WindowCount {
            count: u64::try_from(count).unwrap_or(0),
            reset_in: Some(Duration::from_millis(
                u64::try_from(expires_at - now).unwrap_or(0),
            )),
        })
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let now = self.now();
        let expires_at = Some(now.saturating_add(duration_millis(ttl)));

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                let entry = occupied.get_mut();
                let count = entry.increment(key)?;
                entry.expires_at = expires_at;
                Ok(count)
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(LocalEntry::counter(1, expires_at));
                Ok(1)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LocalEntry::counter(1, expires_at));
                Ok(1)
            }
        }
    }

    async fn extend_block(
        &self,
        key: &str,
        block: &CachedBlock,
        ttl: Duration,
    ) -> Result<i64, StoreError> {
        let now = self.now();
        let fresh = LocalEntry {
            value: LocalValue::Text(block.encode()?),
            expires_at: Some(now.saturating_add(duration_millis(ttl))),
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = match &occupied.get().value {
                    LocalValue::Text(raw) if !occupied.get().is_expired(now) => {
                        CachedBlock::decode(raw).ok()
                    }
                    _ => None,
                };
                if let Some(existing) = existing {
                    if existing.blocked_until >= block.blocked_until {
                        return Ok(existing.blocked_until);
                    }
                }
                occupied.insert(fresh);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
            }
        }
        Ok(block.blocked_until)
    }

    async fn sweep(&self) -> usize {
        let now = self.now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        debug!(removed, remaining = self.entries.len(), "Swept local rate limit store");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    fn store_at(start: i64) -> (Arc<ManualClock>, LocalStore) {
        let clock = Arc::new(ManualClock::new(start));
        let store = LocalStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn window_counts_then_resets_exactly_at_deadline() {
        let (clock, store) = store_at(0);
        let window = Duration::from_secs(60);

        let first = store.increment_window("auth:ip1", window).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.reset_in, Some(window));

        clock.advance(Duration::from_millis(59_999));
        let second = store.increment_window("auth:ip1", window).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.reset_in, Some(Duration::from_millis(1)));

        clock.advance(Duration::from_millis(1));
        let third = store.increment_window("auth:ip1", window).await.unwrap();
        assert_eq!(third.count, 1);
        assert_eq!(third.reset_in, Some(window));
    }

    #[tokio::test]
    async fn get_evicts_expired_entries() {
        let (clock, store) = store_at(1_000);
        store
            .set("block:ip1", "payload", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(store.get("block:ip1").await.unwrap().as_deref(), Some("payload"));

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("block:ip1").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn increment_keeps_existing_expiry() {
        let (clock, store) = store_at(0);
        assert_eq!(store.increment("violations:ip1").await.unwrap(), 1);
        assert_eq!(store.time_to_live("violations:ip1").await.unwrap(), None);

        assert!(store.expire("violations:ip1", Duration::from_secs(10)).await.unwrap());
        clock.advance(Duration::from_secs(4));
        assert_eq!(store.increment("violations:ip1").await.unwrap(), 2);
        assert_eq!(
            store.time_to_live("violations:ip1").await.unwrap(),
            Some(Duration::from_secs(6))
        );

        clock.advance(Duration::from_secs(6));
        assert_eq!(store.increment("violations:ip1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn increment_parses_text_values() {
        let (_, store) = store_at(0);
        store.set("n", "41", None).await.unwrap();
        assert_eq!(store.increment("n").await.unwrap(), 42);

        store.set("s", "abc", None).await.unwrap();
        assert!(matches!(
            store.increment("s").await,
            Err(StoreError::NotAnInteger { .. })
        ));
    }

    #[tokio::test]
    async fn expire_on_missing_key_returns_false() {
        let (_, store) = store_at(0);
        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());
        store.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let (clock, store) = store_at(0);
        store
            .increment_window("a", Duration::from_secs(1))
            .await
            .unwrap();
        store
            .increment_window("b", Duration::from_secs(10))
            .await
            .unwrap();
        store.set("c", "forever", None).await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.sweep().await, 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn increment_with_ttl_refreshes_expiry_each_time() {
        let (clock, store) = store_at(0);
        let day = Duration::from_secs(86_400);

        assert_eq!(store.increment_with_ttl("violations:ip1", day).await.unwrap(), 1);
        clock.advance(Duration::from_secs(3_600));
        assert_eq!(store.increment_with_ttl("violations:ip1", day).await.unwrap(), 2);
        assert_eq!(
            store.time_to_live("violations:ip1").await.unwrap(),
            Some(day)
        );

        clock.advance(day);
        assert_eq!(store.increment_with_ttl("violations:ip1", day).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn extend_block_never_shortens() {
        let (clock, store) = store_at(0);
        let long = CachedBlock::new("ip1", 600_000, 4);
        let short = CachedBlock::new("ip1", 300_000, 3);

        let until = store
            .extend_block("block:ip1", &long, Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(until, 600_000);

        let kept = store
            .extend_block("block:ip1", &short, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(kept, 600_000);
        let stored = store.get("block:ip1").await.unwrap().unwrap();
        assert_eq!(CachedBlock::decode(&stored).unwrap(), long);

        // 已过期的封禁不再参与比较
        clock.advance(Duration::from_secs(600));
        let renewed = CachedBlock::new("ip1", 900_000, 5);
        let until = store
            .extend_block("block:ip1", &renewed, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(until, 900_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_block_extensions_keep_the_longest() {
        let store = Arc::new(LocalStore::new());
        let now = chrono::Utc::now().timestamp_millis();

        let handles: Vec<_> = (1..=50_i64)
            .map(|minutes| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let block = CachedBlock::new("ip1", now + minutes * 60_000, 3);
                    store
                        .extend_block("block:ip1", &block, Duration::from_secs(3_600))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = store.get("block:ip1").await.unwrap().unwrap();
        assert_eq!(
            CachedBlock::decode(&stored).unwrap().blocked_until,
            now + 50 * 60_000
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_window_increments_are_not_lost() {
        let store = Arc::new(LocalStore::new());
        let mut handles = Vec::new();
        for _ in 0..200 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .increment_window("hot", Duration::from_secs(60))
                    .await
                    .unwrap()
                    .count
            }));
        }

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=200).collect::<Vec<u64>>());
    }
}
