use axum::{
    extract::ConnectInfo,
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use axum_prometheus::PrometheusMetricLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use table_gateway::config::Config;
use table_gateway::state::GatewayState;
use table_gateway::{handlers, websocket};

/// Middleware that restricts access to the metrics endpoint to loopback
/// connections only.
async fn require_loopback(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match connect_info {
        Some(ConnectInfo(addr)) if addr.ip().is_loopback() => next.run(req).await,
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing — JSON in production, human-readable in dev.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "table_gateway=info,tower_http=info".parse().unwrap());

    if std::env::var("APP_ENV").as_deref() == Ok("production") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("🚀 Table Gateway starting...");

    let config = Config::from_env();
    let addr = config.server_addr();
    info!("📝 Configuration loaded");

    let state = GatewayState::with_defaults(config);

    // Lifecycle loops: heartbeat, stale detection, periodic cleanup.
    let background = state.supervisor.start();
    info!("💓 Lifecycle supervisor running");

    // Prometheus metrics layer
    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    // ── Rate limiting ─────────────────────────────────────────────────────
    // Per-IP governor on the HTTP surface; burst-tolerant so reconnect storms
    // from one NAT do not starve the upgrade endpoint. Per-principal chat
    // buckets live in the dispatch path, not here.
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .finish()
            .expect("Invalid governor configuration"),
    );

    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(move || async move { metric_handle.render() })
                .route_layer(middleware::from_fn(require_loopback)),
        )
        // WebSocket gateway
        .route("/ws", get(websocket::websocket_handler))
        // ── Global per-IP rate limit (10 req/s, burst 20) ─────────────────
        .layer(GovernorLayer {
            config: governor_conf,
        })
        // ── Security response headers ─────────────────────────────────────
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        // ── Prometheus + request tracing ──────────────────────────────────
        .layer(prometheus_layer)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    info!("🎧 Gateway listening on ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    // `into_make_service_with_connect_info` populates `ConnectInfo<SocketAddr>`
    // in request extensions, needed by:
    //  - GovernorLayer's PeerIpKeyExtractor (per-IP rate limiting)
    //  - require_loopback middleware on /metrics
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("🛑 Shutdown signal received");
    });

    if let Err(e) = server.await {
        tracing::error!(error = ?e, "Server failed");
    }

    // Drain the gateway: close all sockets, cancel timers, await pending
    // operations, stop the supervisor loops.
    state.pool.shutdown().await;
    for task in background {
        task.abort();
    }
    info!("👋 Gateway stopped");
}
