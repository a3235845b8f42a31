//! Configuration for the collector
//!
//! All secrets are injected via environment variables at runtime.
//! The Supabase service key and the CLIProxy management key never appear in
//! source or logs.

use chrono::FixedOffset;

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct Config {
    /// Supabase project URL (required)
    pub supabase_url: String,

    /// Supabase service-role key (required)
    pub supabase_secret_key: String,

    /// Base URL of the CLIProxy instance to poll (default: http://localhost:8317)
    pub cliproxy_url: String,

    /// Management API key for CLIProxy. Optional; without it the usage
    /// endpoint is called unauthenticated.
    pub cliproxy_management_key: Option<String>,

    /// Seconds between scheduled collection ticks (default: 300)
    pub interval_secs: u64,

    /// Port for the manual-trigger HTTP surface (default: 5001)
    pub trigger_port: u16,

    /// Timezone all day boundaries and windows are computed in.
    /// Derived from TIMEZONE_OFFSET_HOURS (default: UTC+7).
    pub timezone: FixedOffset,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let supabase_url = std::env::var("SUPABASE_URL")
            .map_err(|_| Error::Configuration("SUPABASE_URL is required".to_string()))?;
        let supabase_secret_key = std::env::var("SUPABASE_SECRET_KEY")
            .map_err(|_| Error::Configuration("SUPABASE_SECRET_KEY is required".to_string()))?;

        let offset_hours: i32 = std::env::var("TIMEZONE_OFFSET_HOURS")
            .unwrap_or_else(|_| "7".to_string())
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid TIMEZONE_OFFSET_HOURS: {e}")))?;
        let timezone = FixedOffset::east_opt(offset_hours * 3600)
            .ok_or_else(|| Error::Configuration("TIMEZONE_OFFSET_HOURS out of range".to_string()))?;

        Ok(Self {
            supabase_url,
            supabase_secret_key,
            cliproxy_url: std::env::var("CLIPROXY_URL")
                .unwrap_or_else(|_| "http://localhost:8317".to_string()),
            cliproxy_management_key: std::env::var("CLIPROXY_MANAGEMENT_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            interval_secs: std::env::var("COLLECTOR_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .map_err(|e| {
                    Error::Configuration(format!("Invalid COLLECTOR_INTERVAL_SECONDS: {e}"))
                })?,
            trigger_port: std::env::var("COLLECTOR_TRIGGER_PORT")
                .unwrap_or_else(|_| "5001".to_string())
                .parse()
                .map_err(|e| {
                    Error::Configuration(format!("Invalid COLLECTOR_TRIGGER_PORT: {e}"))
                })?,
            timezone,
        })
    }
}
