//! Supabase datastore client
//!
//! Thin PostgREST wrapper plus the typed table contracts the dashboard
//! reads. Natural keys (`daily_stats.stat_date`, `rate_limit_status.config_id`,
//! `credential_usage_summary.id`) are enforced through PostgREST upserts
//! (`resolution=merge-duplicates`), never through read-then-write.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

pub struct Store {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl Store {
    pub fn new(http: reqwest::Client, supabase_url: &str, secret_key: &str) -> Self {
        Self {
            http,
            base_url: format!("{}/rest/v1", supabase_url.trim_end_matches('/')),
            secret_key: secret_key.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.base_url, table))
            .header("apikey", &self.secret_key)
            .bearer_auth(&self.secret_key)
    }

    async fn checked(table: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Store(format!("{table}: {status}: {body}")));
        }
        Ok(resp)
    }

    pub(crate) async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let resp = self
            .request(reqwest::Method::GET, table)
            .query(query)
            .send()
            .await?;
        Ok(Self::checked(table, resp).await?.json().await?)
    }

    pub(crate) async fn insert<B: Serialize + ?Sized>(&self, table: &str, body: &B) -> Result<()> {
        let resp = self
            .request(reqwest::Method::POST, table)
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await?;
        Self::checked(table, resp).await?;
        Ok(())
    }

    pub(crate) async fn insert_returning<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        table: &str,
        body: &B,
    ) -> Result<Vec<R>> {
        let resp = self
            .request(reqwest::Method::POST, table)
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;
        Ok(Self::checked(table, resp).await?.json().await?)
    }

    pub(crate) async fn update<B: Serialize + ?Sized>(
        &self,
        table: &str,
        filter: &[(&str, String)],
        patch: &B,
    ) -> Result<()> {
        let resp = self
            .request(reqwest::Method::PATCH, table)
            .query(filter)
            .header("Prefer", "return=minimal")
            .json(patch)
            .send()
            .await?;
        Self::checked(table, resp).await?;
        Ok(())
    }

    pub(crate) async fn upsert<B: Serialize + ?Sized>(
        &self,
        table: &str,
        on_conflict: &str,
        row: &B,
    ) -> Result<()> {
        let resp = self
            .request(reqwest::Method::POST, table)
            .query(&[("on_conflict", on_conflict.to_string())])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(row)
            .send()
            .await?;
        Self::checked(table, resp).await?;
        Ok(())
    }
}

/// Nullable columns read as their zero value, the same way a missing field does
pub(crate) fn null_to_zero<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// usage_snapshots
// ---------------------------------------------------------------------------

/// Insert payload for a snapshot. `cumulative_cost_usd` starts as the
/// previous running total and is backfilled once the per-model costs are in.
#[derive(Debug, Serialize)]
pub struct NewSnapshot {
    pub raw_data: Value,
    pub total_requests: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub total_tokens: i64,
    pub cumulative_cost_usd: Decimal,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotRow {
    pub id: i64,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub total_requests: i64,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub success_count: i64,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub failure_count: i64,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub total_tokens: i64,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub cumulative_cost_usd: Decimal,
}

#[derive(Debug, Deserialize)]
struct InsertedRow {
    id: i64,
}

const SNAPSHOT_COLUMNS: &str =
    "id,total_requests,success_count,failure_count,total_tokens,cumulative_cost_usd";

impl Store {
    /// Most recent snapshots, newest first
    pub async fn latest_snapshots(&self, limit: usize) -> Result<Vec<SnapshotRow>> {
        self.select(
            "usage_snapshots",
            &[
                ("select", SNAPSHOT_COLUMNS.to_string()),
                ("order", "collected_at.desc".to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    pub async fn insert_snapshot(&self, snapshot: &NewSnapshot) -> Result<i64> {
        let rows: Vec<InsertedRow> = self
            .insert_returning("usage_snapshots", &[snapshot])
            .await?;
        rows.first()
            .map(|r| r.id)
            .ok_or_else(|| Error::Store("usage_snapshots insert returned no row".to_string()))
    }

    pub async fn set_snapshot_cost(&self, id: i64, cumulative_cost_usd: Decimal) -> Result<()> {
        self.update(
            "usage_snapshots",
            &[("id", format!("eq.{id}"))],
            &json!({ "cumulative_cost_usd": cumulative_cost_usd }),
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// model_usage
// ---------------------------------------------------------------------------

/// One row per (snapshot, model, endpoint). Counters are cumulative, like
/// the snapshot they belong to; `created_at` is assigned by the store and
/// kept as the raw string so equality queries cannot drift on formatting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsageRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<i64>,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub api_endpoint: String,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub request_count: i64,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub input_tokens: i64,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub output_tokens: i64,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub total_tokens: i64,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub estimated_cost_usd: Decimal,
    #[serde(default, skip_serializing)]
    pub created_at: Option<String>,
}

const WINDOW_COLUMNS: &str = "created_at,model_name,total_tokens,request_count";

impl Store {
    pub async fn insert_model_usage(&self, rows: &[ModelUsageRow]) -> Result<()> {
        self.insert("model_usage", rows).await
    }

    pub async fn model_usage_for_snapshot(&self, snapshot_id: i64) -> Result<Vec<ModelUsageRow>> {
        self.select(
            "model_usage",
            &[
                ("select", "*".to_string()),
                ("snapshot_id", format!("eq.{snapshot_id}")),
            ],
        )
        .await
    }

    /// Most recent row whose model name matches the pattern
    pub async fn latest_model_usage(&self, pattern: &str) -> Result<Option<ModelUsageRow>> {
        let rows = self
            .select(
                "model_usage",
                &[
                    ("select", WINDOW_COLUMNS.to_string()),
                    ("model_name", format!("ilike.*{pattern}*")),
                    ("order", "created_at.desc".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Earliest matching row at or after `since`
    pub async fn first_model_usage_since(
        &self,
        pattern: &str,
        since: &str,
    ) -> Result<Option<ModelUsageRow>> {
        let rows = self
            .select(
                "model_usage",
                &[
                    ("select", WINDOW_COLUMNS.to_string()),
                    ("model_name", format!("ilike.*{pattern}*")),
                    ("created_at", format!("gte.{since}")),
                    ("order", "created_at.asc".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Latest matching row strictly before `before`
    pub async fn last_model_usage_before(
        &self,
        pattern: &str,
        before: &str,
    ) -> Result<Option<ModelUsageRow>> {
        let rows = self
            .select(
                "model_usage",
                &[
                    ("select", WINDOW_COLUMNS.to_string()),
                    ("model_name", format!("ilike.*{pattern}*")),
                    ("created_at", format!("lt.{before}")),
                    ("order", "created_at.desc".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    /// All matching rows taken at one exact `created_at`
    pub async fn model_usage_at(
        &self,
        pattern: &str,
        created_at: &str,
    ) -> Result<Vec<ModelUsageRow>> {
        self.select(
            "model_usage",
            &[
                ("select", WINDOW_COLUMNS.to_string()),
                ("model_name", format!("ilike.*{pattern}*")),
                ("created_at", format!("eq.{created_at}")),
            ],
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// daily_stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelBucket {
    #[serde(default)]
    pub requests: i64,
    #[serde(default)]
    pub tokens: i64,
    #[serde(default)]
    pub cost: Decimal,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointModelBucket {
    #[serde(default)]
    pub requests: i64,
    #[serde(default)]
    pub tokens: i64,
    #[serde(default)]
    pub cost: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointBucket {
    #[serde(default)]
    pub requests: i64,
    #[serde(default)]
    pub tokens: i64,
    #[serde(default)]
    pub cost: Decimal,
    #[serde(default)]
    pub models: BTreeMap<String, EndpointModelBucket>,
}

/// Per-day decomposition by model and by endpoint. The model map is the
/// authoritative source for the day's totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Breakdown {
    #[serde(default)]
    pub models: BTreeMap<String, ModelBucket>,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointBucket>,
}

impl Breakdown {
    /// Sum of (requests, tokens, cost) over the model map
    pub fn model_totals(&self) -> (i64, i64, Decimal) {
        self.models.values().fold(
            (0, 0, Decimal::ZERO),
            |(requests, tokens, cost), bucket| {
                (
                    requests + bucket.requests,
                    tokens + bucket.tokens,
                    cost + bucket.cost,
                )
            },
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStat {
    pub stat_date: NaiveDate,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub total_requests: i64,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub success_count: i64,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub failure_count: i64,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub total_tokens: i64,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub estimated_cost_usd: Decimal,
    #[serde(default, deserialize_with = "null_to_zero")]
    pub breakdown: Breakdown,
}

impl DailyStat {
    pub fn empty(stat_date: NaiveDate) -> Self {
        Self {
            stat_date,
            total_requests: 0,
            success_count: 0,
            failure_count: 0,
            total_tokens: 0,
            estimated_cost_usd: Decimal::ZERO,
            breakdown: Breakdown::default(),
        }
    }
}

impl Store {
    pub async fn daily_stat(&self, date: NaiveDate) -> Result<Option<DailyStat>> {
        let rows = self
            .select(
                "daily_stats",
                &[
                    ("select", "*".to_string()),
                    ("stat_date", format!("eq.{date}")),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    pub async fn upsert_daily_stat(&self, stat: &DailyStat) -> Result<()> {
        self.upsert("daily_stats", "stat_date", stat).await
    }
}
