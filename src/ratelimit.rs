//! Rate limit window bookkeeping
//!
//! For each configured limit this module determines the effective window
//! (daily / weekly / rolling, optionally overridden by a manual reset
//! anchor), measures usage inside it from the cumulative model_usage rows,
//! and upserts a status row the dashboard renders.
//!
//! The subtle part is the baseline: cumulative counters only yield window
//! usage relative to a snapshot taken at the window boundary. When the
//! collector was down across that boundary, the nearest snapshots can be
//! hours apart; a linear interpolation at the boundary avoids booking the
//! whole idle gap into the new window.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::{ModelUsageRow, Store};

/// Gap between baseline and first inner snapshot beyond which the window
/// boundary is considered to fall inside missing data (seconds)
const GAP_THRESHOLD_SECS: i64 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStrategy {
    Daily,
    Weekly,
    Rolling,
}

impl FromStr for ResetStrategy {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "rolling" => Ok(Self::Rolling),
            _ => Err(()),
        }
    }
}

/// One row of `rate_limit_configs`. Kept stringly-typed where the table is;
/// validation happens per config so one bad row cannot stall the rest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub id: i64,
    #[serde(default, deserialize_with = "crate::store::null_to_zero")]
    pub model_pattern: String,
    #[serde(default, deserialize_with = "crate::store::null_to_zero")]
    pub window_minutes: i64,
    #[serde(default, deserialize_with = "crate::store::null_to_zero")]
    pub reset_strategy: String,
    #[serde(default)]
    pub token_limit: Option<i64>,
    #[serde(default)]
    pub request_limit: Option<i64>,
    #[serde(default)]
    pub reset_anchor_timestamp: Option<String>,
}

/// Upsert payload for `rate_limit_status`, keyed by `config_id`
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub config_id: i64,
    pub last_updated: DateTime<FixedOffset>,
    pub window_start: DateTime<FixedOffset>,
    pub next_reset: DateTime<FixedOffset>,
    pub used_tokens: i64,
    pub used_requests: i64,
    pub status_label: String,
    pub percentage: i64,
    pub remaining_tokens: i64,
    pub remaining_requests: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowUsage {
    pub total_tokens: i64,
    pub request_count: i64,
}

/// Per-model cumulative counters at one snapshot time
type SnapshotMap = HashMap<String, WindowUsage>;

fn start_of_day(dt: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let midnight = dt.date_naive().and_time(NaiveTime::MIN);
    match dt.timezone().from_local_datetime(&midnight) {
        chrono::LocalResult::Single(d) => d,
        // fixed offsets have no gaps or folds
        _ => dt,
    }
}

/// Natural window for a strategy, before any anchor override.
/// Returns (window_start, next_reset).
pub fn natural_window(
    now: DateTime<FixedOffset>,
    strategy: ResetStrategy,
    window_minutes: i64,
) -> (DateTime<FixedOffset>, DateTime<FixedOffset>) {
    match strategy {
        ResetStrategy::Daily => {
            let start = start_of_day(now);
            (start, start + Duration::days(1))
        }
        ResetStrategy::Weekly => {
            // Calendar week, reset on Monday 00:00
            let today = start_of_day(now);
            let start = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
            (start, start + Duration::weeks(1))
        }
        ResetStrategy::Rolling => (
            now - Duration::minutes(window_minutes),
            // display convention only; the window slides continuously
            now + Duration::minutes(1),
        ),
    }
}

/// Apply the manual reset anchor: it wins only while it is newer than the
/// natural start, and expires silently once the natural window passes it.
pub fn effective_window_start(
    natural_start: DateTime<FixedOffset>,
    anchor: Option<DateTime<FixedOffset>>,
) -> DateTime<FixedOffset> {
    match anchor {
        Some(anchor) if anchor > natural_start => anchor,
        _ => natural_start,
    }
}

/// Parse a store timestamp. RFC 3339 first (PostgREST's format, `Z`
/// accepted), then a bare local datetime in the app timezone.
pub fn parse_timestamp(raw: &str, tz: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&tz));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| tz.from_local_datetime(&naive).single())
}

/// Linear interpolation of per-model counters between two snapshot maps
pub fn interpolate_snapshot_map(
    baseline: &SnapshotMap,
    first_inner: &SnapshotMap,
    ratio: f64,
) -> SnapshotMap {
    let mut result = SnapshotMap::new();
    for model in baseline.keys().chain(first_inner.keys()) {
        if result.contains_key(model) {
            continue;
        }
        let base = baseline.get(model).copied().unwrap_or_default();
        let inner = first_inner.get(model).copied().unwrap_or(base);
        let tokens =
            base.total_tokens as f64 + ratio * (inner.total_tokens - base.total_tokens) as f64;
        let requests =
            base.request_count as f64 + ratio * (inner.request_count - base.request_count) as f64;
        result.insert(
            model.clone(),
            WindowUsage {
                total_tokens: tokens.round() as i64,
                request_count: requests.round() as i64,
            },
        );
    }
    result
}

/// Window usage as the per-model difference between the latest snapshot and
/// a baseline, floored at zero. Models absent from the baseline count in
/// full.
pub fn delta_between(current: &SnapshotMap, baseline: &SnapshotMap) -> WindowUsage {
    let mut usage = WindowUsage::default();
    for (model, cur) in current {
        let base = baseline.get(model).copied().unwrap_or_default();
        usage.total_tokens += (cur.total_tokens - base.total_tokens).max(0);
        usage.request_count += (cur.request_count - base.request_count).max(0);
    }
    usage
}

fn format_thousands(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::new();
    if n < 0 {
        out.push('-');
    }
    let first_group = digits.len() % 3;
    let mut rest = digits.as_str();
    if first_group > 0 {
        out.push_str(&digits[..first_group]);
        rest = &digits[first_group..];
        if !rest.is_empty() {
            out.push(',');
        }
    }
    let mut chunks = rest.as_bytes().chunks(3).peekable();
    while let Some(chunk) = chunks.next() {
        // chunks of a str split on a 3-byte boundary of ASCII digits
        let _ = write!(out, "{}", std::str::from_utf8(chunk).unwrap_or(""));
        if chunks.peek().is_some() {
            out.push(',');
        }
    }
    out
}

/// Build the status row for one config from its measured window usage
pub fn build_status(
    config: &RateLimitConfig,
    usage: WindowUsage,
    window_start: DateTime<FixedOffset>,
    next_reset: DateTime<FixedOffset>,
    now: DateTime<FixedOffset>,
) -> RateLimitStatus {
    let used_tokens = usage.total_tokens;
    let used_requests = usage.request_count;

    let mut remaining_tokens = 0;
    let mut remaining_requests = 0;
    let label;
    let mut percentage = 100;

    // Token limit takes priority for the displayed status
    if let Some(limit) = config.token_limit.filter(|l| *l > 0) {
        remaining_tokens = (limit - used_tokens).max(0);
        percentage = remaining_tokens * 100 / limit;
        label = format!(
            "{}/{} Tokens",
            format_thousands(used_tokens),
            format_thousands(limit)
        );
    } else if let Some(limit) = config.request_limit.filter(|l| *l > 0) {
        remaining_requests = (limit - used_requests).max(0);
        percentage = remaining_requests * 100 / limit;
        label = format!(
            "{}/{} Requests",
            format_thousands(used_requests),
            format_thousands(limit)
        );
    } else {
        // informational only
        label = format!(
            "Used: {}T / {}R",
            format_thousands(used_tokens),
            format_thousands(used_requests)
        );
    }

    RateLimitStatus {
        config_id: config.id,
        last_updated: now,
        window_start,
        next_reset,
        used_tokens,
        used_requests,
        status_label: label,
        percentage: percentage.clamp(0, 100),
        remaining_tokens,
        remaining_requests,
    }
}

/// Computes and persists the window status of every rate limit config
pub struct RateLimitEngine<'a> {
    store: &'a Store,
    tz: FixedOffset,
}

impl<'a> RateLimitEngine<'a> {
    pub fn new(store: &'a Store, tz: FixedOffset) -> Self {
        Self { store, tz }
    }

    /// Process all configs. Per-config failures are logged and skipped so
    /// one broken pattern cannot stall the rest.
    pub async fn sync(&self) -> Result<()> {
        let configs: Vec<RateLimitConfig> = self
            .store
            .select("rate_limit_configs", &[("select", "*".to_string())])
            .await?;
        if configs.is_empty() {
            tracing::info!("No rate limit configurations found");
            return Ok(());
        }

        for config in &configs {
            if let Err(e) = self.process(config).await {
                tracing::error!(
                    "Failed to process rate limit config {} ('{}'): {}",
                    config.id,
                    config.model_pattern,
                    e
                );
            }
        }
        Ok(())
    }

    async fn process(&self, config: &RateLimitConfig) -> Result<()> {
        if config.id == 0
            || config.model_pattern.is_empty()
            || config.window_minutes == 0
            || config.reset_strategy.is_empty()
        {
            tracing::warn!("Skipping incomplete rate limit config {}", config.id);
            return Ok(());
        }
        let Ok(strategy) = config.reset_strategy.parse::<ResetStrategy>() else {
            tracing::warn!(
                "Unsupported reset strategy '{}' for config {}",
                config.reset_strategy,
                config.id
            );
            return Ok(());
        };

        let now = Utc::now().with_timezone(&self.tz);
        let (natural_start, next_reset) = natural_window(now, strategy, config.window_minutes);

        let anchor = config.reset_anchor_timestamp.as_deref().and_then(|raw| {
            let parsed = parse_timestamp(raw, self.tz);
            if parsed.is_none() {
                tracing::error!("Could not parse reset_anchor_timestamp: '{}'", raw);
            }
            parsed
        });
        let window_start = effective_window_start(natural_start, anchor);

        let usage = self.usage_in_window(&config.model_pattern, window_start).await?;

        let status = build_status(config, usage, window_start, next_reset, now);
        tracing::info!(
            "Rate limit {} ('{}'): {} ({}%)",
            config.id,
            config.model_pattern,
            status.status_label,
            status.percentage
        );
        self.store
            .upsert("rate_limit_status", "config_id", &status)
            .await
    }

    /// Usage for a model pattern since `since`, robust to data gaps that
    /// cross the window boundary.
    async fn usage_in_window(&self, pattern: &str, since: DateTime<FixedOffset>) -> Result<WindowUsage> {
        let Some(latest) = self.store.latest_model_usage(pattern).await? else {
            return Ok(WindowUsage::default());
        };
        let Some(latest_at) = latest.created_at.clone() else {
            return Ok(WindowUsage::default());
        };
        let Some(latest_dt) = parse_timestamp(&latest_at, self.tz) else {
            return Ok(WindowUsage::default());
        };
        // No activity since the window opened
        if latest_dt < since {
            return Ok(WindowUsage::default());
        }

        let since_iso = since.to_rfc3339();
        let first_inner = self.store.first_model_usage_since(pattern, &since_iso).await?;
        let baseline = self.store.last_model_usage_before(pattern, &since_iso).await?;

        let current = self.snapshot_map(pattern, &latest_at).await?;

        let baseline_at = baseline.and_then(|row| row.created_at);
        let Some(baseline_at) = baseline_at else {
            // Nothing before the window: use the first inner snapshot as
            // the baseline. Under-counts rather than over-counts.
            let Some(first_at) = first_inner.and_then(|row| row.created_at) else {
                return Ok(WindowUsage::default());
            };
            let base = self.snapshot_map(pattern, &first_at).await?;
            return Ok(delta_between(&current, &base));
        };

        if let Some(first_at) = first_inner.and_then(|row| row.created_at) {
            let base_dt = parse_timestamp(&baseline_at, self.tz);
            let first_dt = parse_timestamp(&first_at, self.tz);
            if let (Some(base_dt), Some(first_dt)) = (base_dt, first_dt) {
                let gap_secs = (first_dt - base_dt).num_seconds();
                if gap_secs > GAP_THRESHOLD_SECS {
                    tracing::info!(
                        "Data gap of {}s crosses window boundary; interpolating baseline",
                        gap_secs
                    );
                    let span = if gap_secs > 0 { gap_secs } else { 1 };
                    let ratio =
                        ((since - base_dt).num_seconds() as f64 / span as f64).clamp(0.0, 1.0);
                    let base_map = self.snapshot_map(pattern, &baseline_at).await?;
                    let first_map = self.snapshot_map(pattern, &first_at).await?;
                    let synthetic = interpolate_snapshot_map(&base_map, &first_map, ratio);
                    return Ok(delta_between(&current, &synthetic));
                }
            }
        }

        let base = self.snapshot_map(pattern, &baseline_at).await?;
        Ok(delta_between(&current, &base))
    }

    /// Aggregate matching rows at one snapshot time into a per-model map
    async fn snapshot_map(&self, pattern: &str, created_at: &str) -> Result<SnapshotMap> {
        let rows: Vec<ModelUsageRow> = self.store.model_usage_at(pattern, created_at).await?;
        let mut map = SnapshotMap::new();
        for row in rows {
            let entry = map.entry(row.model_name).or_default();
            entry.total_tokens += row.total_tokens;
            entry.request_count += row.request_count;
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<FixedOffset> {
        tz().with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_weekly_resets_to_monday() {
        // Wednesday
        let now = at(2023, 10, 25, 10, 0);
        let (start, next) = natural_window(now, ResetStrategy::Weekly, 0);
        assert_eq!(start, at(2023, 10, 23, 0, 0));
        assert_eq!(next, at(2023, 10, 30, 0, 0));
    }

    #[test]
    fn test_weekly_on_monday_resets_to_today() {
        let now = at(2023, 10, 23, 10, 0);
        let (start, _) = natural_window(now, ResetStrategy::Weekly, 0);
        assert_eq!(start, at(2023, 10, 23, 0, 0));
    }

    #[test]
    fn test_daily_window() {
        let now = at(2023, 10, 25, 10, 0);
        let (start, next) = natural_window(now, ResetStrategy::Daily, 0);
        assert_eq!(start, at(2023, 10, 25, 0, 0));
        assert_eq!(next, at(2023, 10, 26, 0, 0));
    }

    #[test]
    fn test_rolling_window() {
        let now = at(2023, 10, 25, 10, 0);
        let (start, next) = natural_window(now, ResetStrategy::Rolling, 120);
        assert_eq!(start, at(2023, 10, 25, 8, 0));
        assert_eq!(next, at(2023, 10, 25, 10, 1));
    }

    #[test]
    fn test_anchor_overrides_when_newer() {
        let natural = at(2023, 10, 23, 0, 0);
        let anchor = at(2023, 10, 24, 12, 0);
        assert_eq!(effective_window_start(natural, Some(anchor)), anchor);
    }

    #[test]
    fn test_expired_anchor_is_ignored() {
        // now = Wed 2023-10-25, natural weekly start = Mon 2023-10-23 00:00
        let now = at(2023, 10, 25, 10, 0);
        let (natural, _) = natural_window(now, ResetStrategy::Weekly, 0);
        let anchor = at(2023, 10, 22, 12, 0);
        assert_eq!(effective_window_start(natural, Some(anchor)), natural);
    }

    #[test]
    fn test_parse_timestamp_accepts_z_and_naive() {
        let tz = tz();
        assert_eq!(
            parse_timestamp("2023-10-24T12:00:00Z", tz),
            Some(at(2023, 10, 24, 12, 0))
        );
        assert_eq!(
            parse_timestamp("2023-10-24T12:00:00", tz),
            Some(at(2023, 10, 24, 12, 0))
        );
        assert_eq!(
            parse_timestamp("2023-10-24T12:00:00.123456+00:00", tz).map(start_of_day),
            Some(at(2023, 10, 24, 0, 0))
        );
        assert!(parse_timestamp("not-a-timestamp", tz).is_none());
    }

    fn map(entries: &[(&str, i64, i64)]) -> SnapshotMap {
        entries
            .iter()
            .map(|(model, tokens, requests)| {
                (
                    (*model).to_string(),
                    WindowUsage {
                        total_tokens: *tokens,
                        request_count: *requests,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_gap_interpolation() {
        // baseline Sat 23:00 @ 1000 tokens, first inner Mon 03:00 @ 5000,
        // window opens Mon 00:00: the boundary sits 25h into a 28h gap
        let base_dt = at(2023, 10, 21, 23, 0);
        let first_dt = at(2023, 10, 23, 3, 0);
        let since = at(2023, 10, 23, 0, 0);

        let gap = (first_dt - base_dt).num_seconds();
        let ratio = ((since - base_dt).num_seconds() as f64 / gap as f64).clamp(0.0, 1.0);
        let synthetic = interpolate_snapshot_map(
            &map(&[("gemini-2.5-pro", 1000, 10)]),
            &map(&[("gemini-2.5-pro", 5000, 50)]),
            ratio,
        );

        // 1000 + 25/28 * 4000
        assert_eq!(synthetic["gemini-2.5-pro"].total_tokens, 4571);
        let usage = delta_between(&map(&[("gemini-2.5-pro", 6000, 60)]), &synthetic);
        assert_eq!(usage.total_tokens, 1429);
    }

    #[test]
    fn test_delta_floors_at_zero_and_counts_new_models() {
        let current = map(&[("a", 500, 5), ("b", 300, 3)]);
        let baseline = map(&[("a", 800, 2)]);
        let usage = delta_between(&current, &baseline);
        // a's token drop floors at 0, its request growth counts; b is new
        assert_eq!(usage.total_tokens, 300);
        assert_eq!(usage.request_count, 6);
    }

    #[test]
    fn test_interpolation_clamps_and_rounds() {
        let synthetic = interpolate_snapshot_map(
            &map(&[("m", 100, 1)]),
            &map(&[("m", 200, 2)]),
            1.0,
        );
        assert_eq!(synthetic["m"].total_tokens, 200);
        // model missing from the inner snapshot keeps its baseline value
        let synthetic = interpolate_snapshot_map(&map(&[("m", 100, 1)]), &map(&[]), 0.5);
        assert_eq!(synthetic["m"].total_tokens, 100);
    }

    #[test]
    fn test_format_thousands() {
        assert_eq!(format_thousands(0), "0");
        assert_eq!(format_thousands(999), "999");
        assert_eq!(format_thousands(1_000), "1,000");
        assert_eq!(format_thousands(4_572), "4,572");
        assert_eq!(format_thousands(100_000), "100,000");
        assert_eq!(format_thousands(1_234_567), "1,234,567");
    }

    fn config(token_limit: Option<i64>, request_limit: Option<i64>) -> RateLimitConfig {
        RateLimitConfig {
            id: 7,
            model_pattern: "gemini".to_string(),
            window_minutes: 1440,
            reset_strategy: "daily".to_string(),
            token_limit,
            request_limit,
            reset_anchor_timestamp: None,
        }
    }

    #[test]
    fn test_status_with_token_limit() {
        let usage = WindowUsage {
            total_tokens: 4_572,
            request_count: 12,
        };
        let now = at(2023, 10, 25, 10, 0);
        let status = build_status(
            &config(Some(100_000), None),
            usage,
            at(2023, 10, 25, 0, 0),
            at(2023, 10, 26, 0, 0),
            now,
        );
        assert_eq!(status.status_label, "4,572/100,000 Tokens");
        assert_eq!(status.remaining_tokens, 95_428);
        assert_eq!(status.percentage, 95);
    }

    #[test]
    fn test_status_with_request_limit() {
        let usage = WindowUsage {
            total_tokens: 4_572,
            request_count: 80,
        };
        let now = at(2023, 10, 25, 10, 0);
        let status = build_status(
            &config(None, Some(100)),
            usage,
            at(2023, 10, 25, 0, 0),
            at(2023, 10, 26, 0, 0),
            now,
        );
        assert_eq!(status.status_label, "80/100 Requests");
        assert_eq!(status.remaining_requests, 20);
        assert_eq!(status.percentage, 20);
    }

    #[test]
    fn test_status_informational() {
        let usage = WindowUsage {
            total_tokens: 1_500,
            request_count: 3,
        };
        let now = at(2023, 10, 25, 10, 0);
        let status = build_status(
            &config(None, None),
            usage,
            at(2023, 10, 25, 0, 0),
            at(2023, 10, 26, 0, 0),
            now,
        );
        assert_eq!(status.status_label, "Used: 1,500T / 3R");
        assert_eq!(status.percentage, 100);
    }

    #[test]
    fn test_status_overuse_clamps_to_zero() {
        let usage = WindowUsage {
            total_tokens: 150_000,
            request_count: 12,
        };
        let now = at(2023, 10, 25, 10, 0);
        let status = build_status(
            &config(Some(100_000), None),
            usage,
            at(2023, 10, 25, 0, 0),
            at(2023, 10, 26, 0, 0),
            now,
        );
        assert_eq!(status.remaining_tokens, 0);
        assert_eq!(status.percentage, 0);
    }
}
