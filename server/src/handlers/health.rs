//! Liveness check

use aether_core::ApiResponse;
use axum::Json;
use serde_json::{json, Value};

pub async fn health_check() -> Json<ApiResponse<Value>> {
    Json(ApiResponse::ok(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}
