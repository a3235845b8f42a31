//! HTTP surface of the collector
//!
//! Everything lives under /api/collector. Triggers return 202 and run in
//! the background; the health check is the only synchronous endpoint.

pub mod health;
pub mod trigger;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/trigger", post(trigger::trigger_full_sync))
        .route(
            "/credential-stats/sync",
            post(trigger::trigger_credential_sync),
        )
}
