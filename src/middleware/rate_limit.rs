use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::FutureExt;

use crate::{
    config::RateLimitConfig,
    error::AppError,
    limiter::{AdmissionEngine, RateLimitDecision},
    middleware::client_ip::resolve_client_identity,
    utils::headers,
};

/// 请求入口的限流闸门，每个路由组一份配置
#[derive(Clone)]
pub struct RateLimitGate {
    engine: Arc<AdmissionEngine>,
    config: Arc<RateLimitConfig>,
    per_endpoint: bool,
}

impl RateLimitGate {
    pub fn new(engine: Arc<AdmissionEngine>, config: RateLimitConfig) -> Self {
        Self {
            engine,
            config: Arc::new(config),
            per_endpoint: false,
        }
    }

    /// 按请求路径分桶，而不是整个路由组共用一个计数
    pub fn per_endpoint(mut self) -> Self {
        self.per_endpoint = true;
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub async fn check_rate_limit(self: Arc<Self>, req: Request<Body>, next: Next) -> Response {
        // 从连接信息获取原始IP
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip());
        let identity = resolve_client_identity(req.headers(), peer);
        let endpoint = self.per_endpoint.then(|| req.uri().path().to_string());

        let checked = AssertUnwindSafe(self.engine.check_rate_limit(
            &identity,
            &self.config,
            endpoint.as_deref(),
        ))
        .catch_unwind()
        .await;

        // 限流自身出问题时放行
        let decision = match checked {
            Ok(decision) => decision,
            Err(_) => {
                tracing::error!(identity = %identity, "Rate limit check panicked, allowing request");
                return next.run(req).await;
            }
        };

        if decision.allowed {
            let mut response = next.run(req).await;
            apply_rate_limit_headers(response.headers_mut(), &decision);
            return response;
        }

        let retry_after = decision.retry_after.unwrap_or(1);
        tracing::debug!(
            identity = %identity,
            prefix = %self.config.key_prefix,
            blocked = decision.info.is_blocked,
            retry_after,
            "Request rejected by rate limiter"
        );

        let rejection = if decision.info.is_blocked {
            AppError::Blocked { retry_after }
        } else {
            AppError::RateLimited {
                message: self.config.message.clone(),
                retry_after,
            }
        };

        let mut response = rejection.into_response();
        apply_rate_limit_headers(response.headers_mut(), &decision);
        response
    }
}

/// 写入标准限流响应头
pub fn apply_rate_limit_headers(map: &mut HeaderMap, decision: &RateLimitDecision) {
    map.insert(
        headers::RATE_LIMIT_LIMIT,
        HeaderValue::from(decision.info.limit),
    );
    map.insert(
        headers::RATE_LIMIT_REMAINING,
        HeaderValue::from(decision.info.remaining),
    );
    map.insert(
        headers::RATE_LIMIT_RESET,
        HeaderValue::from(decision.info.reset_time_secs()),
    );
    if let Some(retry_after) = decision.retry_after {
        map.insert(headers::RETRY_AFTER, HeaderValue::from(retry_after));
    }
}

pub async fn rate_limit(
    State(gate): State<Arc<RateLimitGate>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    gate.check_rate_limit(req, next).await
}
