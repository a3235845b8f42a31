//! Snapshot delta reconciliation
//!
//! CLIProxy reports counters that are cumulative since proxy start. This
//! module turns each new snapshot into a per-day increment that survives
//! three failure modes of cumulative sources:
//!
//! - **Restarts**: counters drop to zero mid-day. A negative delta means
//!   the current cumulative value IS the increment.
//! - **False starts**: a credential with historical usage becomes visible
//!   for the first time and its entire past shows up as one delta. Filtered
//!   by the $10 / $0.10 heuristic and removed from the global increment.
//! - **Partial writes**: a crash between the model rows and the daily
//!   upsert. The day's totals are always recomputed from its own breakdown
//!   (self-healing), so the next tick repairs the difference.
//!
//! Write ordering per tick: snapshot insert, model rows, cost backfill,
//! daily upsert. The daily row is the only mutable output and it is
//! upserted by `stat_date` in one request.

use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::Result;
use crate::pricing::{self, PriceTable};
use crate::proxy::UsageDoc;
use crate::store::{
    Breakdown, DailyStat, EndpointBucket, EndpointModelBucket, ModelBucket, ModelUsageRow,
    NewSnapshot, SnapshotRow, Store,
};

/// Per-key delta above this cost is suspect
const FALSE_START_COST_USD: &str = "10";
/// ...and a delta within this distance of the full cumulative confirms it
const FALSE_START_TOLERANCE_USD: &str = "0.1";

/// Global cumulative counters of one usage document
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub requests: i64,
    pub success: i64,
    pub failure: i64,
    pub tokens: i64,
}

impl Counters {
    pub fn of(usage: &UsageDoc) -> Self {
        Self {
            requests: usage.total_requests,
            success: usage.success_count,
            failure: usage.failure_count,
            tokens: usage.total_tokens,
        }
    }
}

/// Increment to apply to today's stats
#[derive(Debug, Clone, Default)]
pub struct TickDelta {
    pub requests: i64,
    pub success: i64,
    pub failure: i64,
    pub tokens: i64,
    pub cost: Decimal,
    pub breakdown: Breakdown,
}

/// Flatten the usage document into per-(model, endpoint) rows and the total
/// imputed cost of the snapshot. Input/output tokens come from summing the
/// details; request and token totals from the model-level counters.
pub fn model_rows(usage: &UsageDoc, prices: &PriceTable) -> (Vec<ModelUsageRow>, Decimal) {
    let mut rows = Vec::new();
    let mut total_cost = Decimal::ZERO;

    for (api_endpoint, api_data) in &usage.apis {
        for (model_name, model_data) in &api_data.models {
            let input_tokens: i64 = model_data.details.iter().map(|d| d.tokens.input_tokens).sum();
            let output_tokens: i64 =
                model_data.details.iter().map(|d| d.tokens.output_tokens).sum();
            let cost = pricing::cost(input_tokens, output_tokens, prices.resolve(model_name));
            total_cost += cost;
            rows.push(ModelUsageRow {
                snapshot_id: None,
                model_name: model_name.clone(),
                api_endpoint: api_endpoint.clone(),
                request_count: model_data.total_requests,
                input_tokens,
                output_tokens,
                total_tokens: model_data.total_tokens,
                estimated_cost_usd: cost,
                created_at: None,
            });
        }
    }

    (rows, total_cost)
}

fn endpoint_or_unknown(endpoint: &str) -> &str {
    if endpoint.is_empty() {
        "unknown"
    } else {
        endpoint
    }
}

fn row_map(rows: &[ModelUsageRow]) -> HashMap<(String, String), &ModelUsageRow> {
    rows.iter()
        .map(|r| {
            (
                (
                    r.model_name.clone(),
                    endpoint_or_unknown(&r.api_endpoint).to_string(),
                ),
                r,
            )
        })
        .collect()
}

fn add_to_breakdown(
    breakdown: &mut Breakdown,
    model: &str,
    endpoint: &str,
    requests: i64,
    tokens: i64,
    cost: Decimal,
    input_tokens: i64,
    output_tokens: i64,
) {
    let bucket = breakdown.models.entry(model.to_string()).or_default();
    bucket.requests += requests;
    bucket.tokens += tokens;
    bucket.cost += cost;
    bucket.input_tokens += input_tokens;
    bucket.output_tokens += output_tokens;

    let ep = breakdown.endpoints.entry(endpoint.to_string()).or_default();
    ep.requests += requests;
    ep.tokens += tokens;
    ep.cost += cost;

    let nested = ep.models.entry(model.to_string()).or_default();
    nested.requests += requests;
    nested.tokens += tokens;
    nested.cost += cost;
}

/// Compute the increment a new snapshot contributes to today's stats.
///
/// `total_cost` is the imputed cost of the current snapshot alone;
/// `cumulative_cost` is the running total after it.
pub fn reconcile(
    prev: Option<&SnapshotRow>,
    prev_rows: &[ModelUsageRow],
    current: &Counters,
    curr_rows: &[ModelUsageRow],
    total_cost: Decimal,
    cumulative_cost: Decimal,
) -> TickDelta {
    let mut delta = TickDelta::default();

    match prev {
        Some(prev) => {
            delta.requests = current.requests - prev.total_requests;
            delta.success = current.success - prev.success_count;
            delta.failure = current.failure - prev.failure_count;
            delta.tokens = current.tokens - prev.total_tokens;
            delta.cost = cumulative_cost - prev.cumulative_cost_usd;

            if delta.requests < 0 || delta.tokens < 0 {
                tracing::warn!(
                    "Restart detected: prev requests {}, current requests {}",
                    prev.total_requests,
                    current.requests
                );
                delta.requests = current.requests;
                delta.success = current.success;
                delta.failure = current.failure;
                delta.tokens = current.tokens;
                // Our cumulative cost is monotonic, so the cost of this
                // snapshot alone is the increment.
                delta.cost = total_cost;
            }
        }
        None => {
            // First snapshot ever: everything the proxy has seen counts.
            delta.requests = current.requests;
            delta.success = current.success;
            delta.failure = current.failure;
            delta.tokens = current.tokens;
            delta.cost = total_cost;
        }
    }

    if prev.is_some() {
        let false_start_cost: Decimal = FALSE_START_COST_USD.parse().expect("valid threshold");
        let tolerance: Decimal = FALSE_START_TOLERANCE_USD.parse().expect("valid threshold");

        let prev_map = row_map(prev_rows);
        let curr_map = row_map(curr_rows);
        let mut keys: Vec<&(String, String)> = prev_map.keys().chain(curr_map.keys()).collect();
        keys.sort();
        keys.dedup();

        for key in keys {
            let empty = ModelUsageRow::default();
            let p = prev_map.get(key).copied().unwrap_or(&empty);
            let c = curr_map.get(key).copied().unwrap_or(&empty);

            let mut d_req = c.request_count - p.request_count;
            let mut d_tok = c.total_tokens - p.total_tokens;
            let mut d_cost = c.estimated_cost_usd - p.estimated_cost_usd;
            let mut d_in = c.input_tokens - p.input_tokens;
            let mut d_out = c.output_tokens - p.output_tokens;

            // Per-key restart detection
            if d_req < 0 || d_tok < 0 {
                d_req = c.request_count;
                d_tok = c.total_tokens;
                d_cost = c.estimated_cost_usd;
                d_in = c.input_tokens;
                d_out = c.output_tokens;
            }

            // False start: a key appears with its entire history as one
            // delta. Drop it from the breakdown and the global increment.
            if d_cost > false_start_cost && (d_cost - c.estimated_cost_usd).abs() < tolerance {
                tracing::warn!(
                    "Skipping false start: ${:.2} for {}|{}",
                    d_cost,
                    key.0,
                    key.1
                );
                delta.requests -= d_req;
                delta.tokens -= d_tok;
                delta.cost -= d_cost;
                // success/failure stay as-is; we cannot attribute them to a
                // single key, and overcounting them beats a cost spike.
                continue;
            }

            if d_req > 0 || d_cost > Decimal::ZERO {
                add_to_breakdown(&mut delta.breakdown, &key.0, &key.1, d_req, d_tok, d_cost, d_in, d_out);
            }
        }

        // Consistency override: the breakdown is the source of truth for
        // the global increment. If filtering dropped a meaningful share of
        // requests, scale success/failure proportionally.
        let (safe_requests, safe_tokens, safe_cost) = delta.breakdown.model_totals();
        if delta.requests > 0 {
            let ratio = (safe_requests as f64 / delta.requests as f64).clamp(0.0, 1.0);
            if ratio < 0.99 {
                tracing::warn!(
                    "Adjusting success/failure for breakdown mismatch (ratio {:.4})",
                    ratio
                );
                delta.success = (delta.success as f64 * ratio) as i64;
                delta.failure = (delta.failure as f64 * ratio) as i64;
            }
        }
        delta.requests = safe_requests;
        delta.tokens = safe_tokens;
        delta.cost = safe_cost;
    } else {
        // No previous rows to diff against: the current rows are the delta.
        for row in curr_rows {
            if row.request_count > 0 || row.estimated_cost_usd > Decimal::ZERO {
                add_to_breakdown(
                    &mut delta.breakdown,
                    &row.model_name,
                    endpoint_or_unknown(&row.api_endpoint),
                    row.request_count,
                    row.total_tokens,
                    row.estimated_cost_usd,
                    row.input_tokens,
                    row.output_tokens,
                );
            }
        }
    }

    delta
}

fn merge_breakdown(into: &mut Breakdown, delta: &Breakdown) {
    for (model, d) in &delta.models {
        let bucket = into
            .models
            .entry(model.clone())
            .or_insert_with(ModelBucket::default);
        bucket.requests += d.requests;
        bucket.tokens += d.tokens;
        bucket.cost += d.cost;
        bucket.input_tokens += d.input_tokens;
        bucket.output_tokens += d.output_tokens;
    }

    for (endpoint, d) in &delta.endpoints {
        let bucket = into
            .endpoints
            .entry(endpoint.clone())
            .or_insert_with(EndpointBucket::default);
        bucket.requests += d.requests;
        bucket.tokens += d.tokens;
        bucket.cost += d.cost;
        for (model, m) in &d.models {
            let nested = bucket
                .models
                .entry(model.clone())
                .or_insert_with(EndpointModelBucket::default);
            nested.requests += m.requests;
            nested.tokens += m.tokens;
            nested.cost += m.cost;
        }
    }
}

/// Merge a tick's delta into the day's stats and self-heal the totals so
/// they always equal the sum of the breakdown's model buckets. Success and
/// failure have no per-model source, so they accumulate by delta.
pub fn apply_to_daily(existing: Option<DailyStat>, date: NaiveDate, delta: &TickDelta) -> DailyStat {
    let mut stat = existing.unwrap_or_else(|| DailyStat::empty(date));
    stat.stat_date = date;

    merge_breakdown(&mut stat.breakdown, &delta.breakdown);

    let (requests, tokens, cost) = stat.breakdown.model_totals();
    stat.total_requests = if requests > 0 {
        requests
    } else {
        stat.total_requests + delta.requests
    };
    stat.total_tokens = if tokens > 0 {
        tokens
    } else {
        stat.total_tokens + delta.tokens
    };
    stat.estimated_cost_usd = if cost > Decimal::ZERO {
        cost
    } else {
        stat.estimated_cost_usd + delta.cost
    };
    stat.success_count += delta.success;
    stat.failure_count += delta.failure;

    stat
}

/// One full delta pass: persist the snapshot and its model rows, compute
/// the increment against the previous snapshot, and upsert today's stats.
pub async fn record_snapshot(
    store: &Store,
    prices: &PriceTable,
    today: NaiveDate,
    raw: Value,
    usage: &UsageDoc,
) -> Result<()> {
    let (mut rows, total_cost) = model_rows(usage, prices);
    let current = Counters::of(usage);

    let last = store.latest_snapshots(1).await?;
    let last_cost_total = last
        .first()
        .map(|s| s.cumulative_cost_usd)
        .unwrap_or_default();

    let snapshot_id = store
        .insert_snapshot(&NewSnapshot {
            raw_data: raw,
            total_requests: current.requests,
            success_count: current.success,
            failure_count: current.failure,
            total_tokens: current.tokens,
            cumulative_cost_usd: last_cost_total,
        })
        .await?;

    for row in &mut rows {
        row.snapshot_id = Some(snapshot_id);
    }
    if !rows.is_empty() {
        store.insert_model_usage(&rows).await?;
    }

    let cumulative_cost = last_cost_total + total_cost;
    store.set_snapshot_cost(snapshot_id, cumulative_cost).await?;

    // The row just inserted is the newest; the one before it is prev.
    let recent = store.latest_snapshots(2).await?;
    let prev = recent.get(1);
    let prev_rows = match prev {
        Some(p) => store.model_usage_for_snapshot(p.id).await?,
        None => Vec::new(),
    };

    let delta = reconcile(prev, &prev_rows, &current, &rows, total_cost, cumulative_cost);

    let existing = store.daily_stat(today).await?;
    let stat = apply_to_daily(existing, today, &delta);
    store.upsert_daily_stat(&stat).await?;

    tracing::info!(
        "Stored snapshot {}. Incremental: {} requests. Daily total: {}",
        snapshot_id,
        delta.requests,
        stat.total_requests
    );
    Ok(())
}
