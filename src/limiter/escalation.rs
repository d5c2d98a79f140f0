//! 违规记录与封禁升级
//!
//! 违规按身份累计（不区分限流桶），计数有独立的衰减窗口，
//! 每次违规都会刷新。达到阈值后写入封禁，时长随违规次数翻倍，有上限。

use std::time::Duration;

use tracing::warn;

use crate::cache::keys::{block_key, violation_key};
use crate::cache::CachedBlock;
use crate::config::RateLimitConfig;
use crate::error::AdmissionError;
use crate::security::{SecurityEvent, SecurityEventKind, Severity};
use crate::utils::clock::duration_millis;

use super::service::AdmissionEngine;

impl AdmissionEngine {
    /// 记录一次违规，必要时升级为封禁。返回累计违规次数。
    pub(super) async fn record_violation(
        &self,
        identity: &str,
        config: &RateLimitConfig,
    ) -> Result<u64, AdmissionError> {
        let key = violation_key(identity);
        let policy = &self.settings().escalation;
        let decay = policy.violation_window;

        let violations = self
            .dispatch("record_violation", |store| {
                let key = key.clone();
                async move { store.increment_with_ttl(&key, decay).await }
            })
            .await?;
        let violations = u64::try_from(violations).unwrap_or(0);

        warn!(
            identity = %identity,
            prefix = %config.key_prefix,
            violations,
            "Rate limit exceeded"
        );
        let severity = if violations >= u64::from(policy.threshold) {
            Severity::Medium
        } else {
            Severity::Low
        };
        self.notify(SecurityEvent::new(
            SecurityEventKind::RateLimitExceeded,
            severity,
            format!(
                "identity {} exceeded {} limit of {} requests",
                identity, config.key_prefix, config.max_requests
            ),
            serde_json::json!({
                "identity": identity,
                "prefix": config.key_prefix,
                "limit": config.max_requests,
                "window_ms": config.window_ms(),
                "violations": violations,
            }),
        ));

        if let Some(duration) = policy.block_duration(violations) {
            self.apply_block(identity, duration, violations).await?;
        }

        Ok(violations)
    }

    /// 写入封禁；已有更长的封禁时保留原封禁，比较与写入由存储原子完成
    async fn apply_block(
        &self,
        identity: &str,
        duration: Duration,
        violations: u64,
    ) -> Result<i64, AdmissionError> {
        let blocked_until = self
            .now_millis()
            .saturating_add(duration_millis(duration));
        let key = block_key(identity);
        let block = CachedBlock::new(identity, blocked_until, violations);

        let effective = self
            .dispatch("apply_block", |store| {
                let key = key.clone();
                let block = block.clone();
                async move { store.extend_block(&key, &block, duration).await }
            })
            .await?;

        if effective == blocked_until {
            warn!(
                identity = %identity,
                violations,
                block_secs = duration.as_secs(),
                "Identity blocked after repeated rate limit violations"
            );
            self.notify(SecurityEvent::new(
                SecurityEventKind::IdentityBlocked,
                Severity::High,
                format!(
                    "identity {} blocked for {}s after {} violations",
                    identity,
                    duration.as_secs(),
                    violations
                ),
                serde_json::json!({
                    "identity": identity,
                    "violations": violations,
                    "blocked_until": blocked_until,
                    "manual": false,
                }),
            ));
        }

        Ok(effective)
    }

    /// 当前累计违规次数
    pub async fn violation_count(&self, identity: &str) -> u64 {
        let key = violation_key(identity);
        let raw = self
            .dispatch("violation_count", |store| {
                let key = key.clone();
                async move { store.get(&key).await }
            })
            .await;

        match raw {
            Ok(raw) => raw.and_then(|raw| raw.parse().ok()).unwrap_or(0),
            Err(e) => {
                warn!(identity = %identity, error = %e, "Failed to read violation count");
                0
            }
        }
    }
}
