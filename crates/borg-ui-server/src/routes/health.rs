use axum::Json;
use serde_json::{json, Value};

/// GET /health: liveness for container orchestrators.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "borg-web-ui" }))
}

/// GET /api: name and version of the running service.
pub async fn api_info() -> Json<Value> {
    Json(json!({
        "name": "Borg Web UI API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "docs": "/api/docs",
    }))
}
