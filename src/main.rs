use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use admission::{
    AppState, RateLimitConfig,
    cache::RedisStore,
    config::Config,
    limiter::AdmissionEngine,
    middleware::{RateLimitGate, rate_limit},
};
use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置
    let config = Config::from_env().expect("Failed to load configuration");

    let limiter = Arc::new(AdmissionEngine::new(config.admission.clone()));

    // 设置 Redis 共享存储，连接失败时只用本地存储
    match &config.redis_url {
        Some(url) => match RedisStore::connect_monitored(url, config.health_check_interval()).await {
            Ok(store) => limiter.attach_shared_store(store).await,
            Err(e) => {
                tracing::warn!("Redis unavailable, rate limiting with local store only: {}", e)
            }
        },
        None => tracing::info!("REDIS_URL not set, rate limiting with local store only"),
    }
    limiter.start_sweep_task();

    // 设置应用状态
    let state = AppState {
        config: config.clone(),
        limiter: Arc::clone(&limiter),
    };

    let gate = |preset: RateLimitConfig| Arc::new(RateLimitGate::new(Arc::clone(&limiter), preset));

    let auth_routes = Router::new()
        .route("/auth/login", post(accepted))
        .route("/auth/register", post(accepted))
        .layer(axum::middleware::from_fn_with_state(
            gate(RateLimitConfig::auth()),
            rate_limit,
        ));

    let upload_routes = Router::new()
        .route("/files", post(accepted))
        .layer(axum::middleware::from_fn_with_state(
            gate(RateLimitConfig::upload()),
            rate_limit,
        ));

    let general_routes = Router::new()
        .route("/ping", get(ping))
        .route("/admin/blocks/{identity}", get(block_status));

    // 全局限流套在所有路由外层，分组限流在内层
    let router = Router::new()
        .merge(auth_routes)
        .merge(upload_routes)
        .merge(general_routes)
        .layer(axum::middleware::from_fn_with_state(
            gate(config.default_rate_limit()),
            rate_limit,
        ))
        .layer(TraceLayer::new_for_http());

    #[cfg(debug_assertions)]
    let router = {
        tracing::debug!("Adding CORS layer for development mode");
        router.layer(CorsLayer::permissive())
    };

    let app = router.with_state(state.clone());

    // 启动服务器
    let addr = SocketAddr::new(
        state.config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        state.config.server_port,
    );
    tracing::info!("Server listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to start server");
}

async fn ping() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn accepted() -> Json<Value> {
    Json(json!({ "accepted": true }))
}

async fn block_status(State(state): State<AppState>, Path(identity): Path<String>) -> Json<Value> {
    let blocked_until = state.limiter.is_blocked(&identity).await;
    let violations = state.limiter.violation_count(&identity).await;
    Json(json!({
        "identity": identity,
        "blocked_until": blocked_until,
        "violations": violations,
    }))
}
