use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{Value, json};

use crate::db;
use crate::{BUILD_TIME, GIT_HASH, VERSION};

/// Liveness plus a database ping
pub async fn health() -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match db::get_conn().await {
        Ok(_) => Ok(Json(json!({ "status": "ok" }))),
        Err(e) => {
            tracing::error!("Health check failed: {}", e);
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded" })),
            ))
        }
    }
}

pub async fn version() -> Json<Value> {
    Json(json!({
        "version": VERSION,
        "git_hash": GIT_HASH,
        "build_time": BUILD_TIME,
    }))
}
