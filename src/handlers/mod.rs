use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::state::GatewayState;

pub async fn health_check(State(state): State<GatewayState>) -> (StatusCode, Json<Value>) {
    let connections = state.registry.connection_count().await;
    let rate_buckets = state.limiter.bucket_count().await;

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "table-gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "connections": connections,
            "rateBuckets": rate_buckets,
            "pool": state.pool.snapshot(),
        })),
    )
}
