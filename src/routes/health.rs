//! Health check endpoint

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let now = Utc::now().with_timezone(&state.collector.config.timezone);
    Json(HealthResponse {
        status: "healthy",
        timestamp: now.to_rfc3339(),
    })
}
