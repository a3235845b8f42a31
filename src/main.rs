//! Turnstile - usage telemetry collector for CLIProxy
//!
//! Polls the CLIProxy management API on an interval, turns its cumulative
//! counters into restart-safe daily increments with imputed costs, and
//! stores the results in Supabase for the dashboard:
//! - usage snapshots and per-model rows (write-once)
//! - per-day stats with a self-healing model/endpoint breakdown
//! - per-credential and per-API-key summaries
//! - rate-limit window status per configured limit
//!
//! A small HTTP surface under /api/collector allows manual triggers.

mod collector;
mod config;
mod credentials;
mod delta;
mod error;
mod pricing;
mod proxy;
mod ratelimit;
mod routes;
mod store;

use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::collector::Collector;
use crate::config::Config;

/// Shared application state
pub struct AppState {
    pub collector: Arc<Collector>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "turnstile=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    tracing::info!(
        "Starting CLIProxy usage collector (proxy: {}, interval: {}s)",
        config.cliproxy_url,
        config.interval_secs
    );

    let collector = Arc::new(Collector::new(config.clone())?);

    // Background sync on the configured interval
    let scheduled = collector.clone();
    tokio::spawn(async move {
        scheduled.run_scheduler().await;
    });

    let state = Arc::new(AppState { collector });

    let app = Router::new()
        .nest("/api/collector", routes::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.trigger_port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Collector API listening on {} under /api/collector", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
