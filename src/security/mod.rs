//! 安全事件上报
//!
//! 违规与封禁事件以“发出即忘”的方式交给审计接收端，
//! 上报失败只记录日志，不影响准入判定。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    RateLimitExceeded,
    IdentityBlocked,
    IdentityUnblocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub kind: SecurityEventKind,
    pub severity: Severity,
    pub description: String,
    pub metadata: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(
        kind: SecurityEventKind,
        severity: Severity,
        description: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            description: description.into(),
            metadata,
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("security sink failed: {0}")]
pub struct SinkError(pub String);

/// 审计接收端
#[async_trait]
pub trait SecuritySink: Send + Sync {
    async fn record_security_event(&self, event: SecurityEvent) -> Result<(), SinkError>;
}

/// 默认接收端：写入 tracing 日志
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSecuritySink;

#[async_trait]
impl SecuritySink for TracingSecuritySink {
    async fn record_security_event(&self, event: SecurityEvent) -> Result<(), SinkError> {
        match event.severity {
            Severity::Low => info!(
                kind = ?event.kind,
                metadata = %event.metadata,
                "security event: {}",
                event.description
            ),
            Severity::Medium | Severity::High => warn!(
                kind = ?event.kind,
                severity = ?event.severity,
                metadata = %event.metadata,
                "security event: {}",
                event.description
            ),
        }
        Ok(())
    }
}
