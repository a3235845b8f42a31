//! Manual trigger endpoints
//!
//! Both endpoints acknowledge with 202 and hand the work to a background
//! task; the collector's tick lock keeps concurrent triggers from
//! double-applying deltas.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Serialize)]
pub struct TriggerResponse {
    pub message: &'static str,
}

pub async fn trigger_full_sync(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<TriggerResponse>) {
    tracing::info!("Manual trigger received for full sync");
    let collector = state.collector.clone();
    tokio::spawn(async move {
        collector.run_exclusive().await;
    });
    (
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            message: "Full data collection process triggered.",
        }),
    )
}

pub async fn trigger_credential_sync(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<TriggerResponse>) {
    tracing::info!("Manual trigger received for credential stats sync");
    let collector = state.collector.clone();
    tokio::spawn(async move {
        if let Err(e) = collector.sync_credentials().await {
            tracing::error!("Credential stats sync failed: {}", e);
        }
    });
    (
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            message: "Credential stats sync triggered.",
        }),
    )
}
