//! Collection orchestrator
//!
//! Owns the shared clients and drives one tick end to end: fetch the usage
//! document, reconcile the snapshot delta, refresh credential stats, then
//! recompute rate-limit windows.
//!
//! Exactly one tick runs at a time. Two overlapping ticks would read the
//! same previous snapshot, insert two new ones, and double-apply the delta,
//! so triggers arriving mid-tick coalesce into a single follow-up run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::credentials;
use crate::delta;
use crate::error::Result;
use crate::pricing::PricingResolver;
use crate::proxy::{ProxyClient, UsageResponse};
use crate::ratelimit::RateLimitEngine;
use crate::store::Store;

pub struct Collector {
    pub config: Arc<Config>,
    store: Store,
    proxy: ProxyClient,
    pricing: PricingResolver,
    tick_lock: Mutex<()>,
    tick_pending: AtomicBool,
}

impl Collector {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            store: Store::new(
                http.clone(),
                &config.supabase_url,
                &config.supabase_secret_key,
            ),
            proxy: ProxyClient::new(
                http.clone(),
                config.cliproxy_url.clone(),
                config.cliproxy_management_key.clone(),
            ),
            pricing: PricingResolver::new(http),
            config,
            tick_lock: Mutex::new(()),
            tick_pending: AtomicBool::new(false),
        })
    }

    /// Background schedule: first tick shortly after startup, then every
    /// configured interval.
    pub async fn run_scheduler(&self) {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        loop {
            interval.tick().await;
            self.run_exclusive().await;
        }
    }

    /// Run one tick under the tick lock. If a tick is already in flight,
    /// record the request and let the running tick execute exactly one
    /// follow-up when it finishes.
    pub async fn run_exclusive(&self) {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            tracing::info!("Tick already in flight; coalescing trigger");
            self.tick_pending.store(true, Ordering::SeqCst);
            return;
        };
        loop {
            if let Err(e) = self.tick().await {
                tracing::error!("Tick failed: {}", e);
            }
            if !self.tick_pending.swap(false, Ordering::SeqCst) {
                break;
            }
            tracing::info!("Running coalesced follow-up tick");
        }
    }

    /// One end-to-end collection pass
    async fn tick(&self) -> Result<()> {
        tracing::info!("Fetching usage data...");
        let raw = match self.proxy.fetch_usage().await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("No data received from CLIProxy ({}); skipping tick", e);
                return Ok(());
            }
        };
        if raw.get("usage").is_none() {
            tracing::warn!("Usage document has no usage section; skipping tick");
            return Ok(());
        }
        let parsed: UsageResponse = serde_json::from_value(raw.clone())?;

        let prices = self.pricing.table().await;
        let today = Utc::now().with_timezone(&self.config.timezone).date_naive();
        delta::record_snapshot(&self.store, &prices, today, raw, &parsed.usage).await?;

        // Credential attribution degrades gracefully without the catalog
        let auth_files = match self.proxy.fetch_auth_files().await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(
                    "Could not fetch auth files ({}), proceeding without credential mapping",
                    e
                );
                Vec::new()
            }
        };
        let summary = credentials::summarize(&parsed.usage, &auth_files);
        credentials::store_summary(&self.store, &summary).await?;

        RateLimitEngine::new(&self.store, self.config.timezone)
            .sync()
            .await?;

        Ok(())
    }

    /// Standalone credential aggregation, used by the dedicated trigger
    pub async fn sync_credentials(&self) -> Result<()> {
        let raw = match self.proxy.fetch_usage().await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("No usage data ({}); credential stats not refreshed", e);
                return Ok(());
            }
        };
        let parsed: UsageResponse = serde_json::from_value(raw)?;
        let auth_files = match self.proxy.fetch_auth_files().await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(
                    "Could not fetch auth files ({}), proceeding without credential mapping",
                    e
                );
                Vec::new()
            }
        };
        let summary = credentials::summarize(&parsed.usage, &auth_files);
        credentials::store_summary(&self.store, &summary).await
    }
}
