//! CLIProxy management API client
//!
//! Two endpoints: the cumulative usage document (Bearer auth) and the
//! auth-file catalog (X-Management-Key). Counters in the usage document are
//! cumulative since proxy start and reset when the proxy restarts; the
//! delta engine is responsible for making sense of that.
//!
//! Non-200 responses, transport failures, and undecodable bodies all
//! surface as `Error::Upstream`; the orchestrator decides whether a tick
//! can proceed without the document.
//!
//! The ingress structs are deliberately permissive: every field defaults,
//! unknown fields are ignored. The proxy's JSON shape drifts between
//! versions and a missing counter must read as zero, never as a parse error.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Top-level response of `/v0/management/usage`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageResponse {
    #[serde(default)]
    pub usage: UsageDoc,
}

/// Cumulative usage counters plus the per-API-key model map
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageDoc {
    #[serde(default)]
    pub total_requests: i64,
    #[serde(default)]
    pub success_count: i64,
    #[serde(default)]
    pub failure_count: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub apis: HashMap<String, ApiUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiUsage {
    #[serde(default)]
    pub models: HashMap<String, ModelUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelUsage {
    #[serde(default)]
    pub total_requests: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub details: Vec<UsageDetail>,
}

/// One entry per request handled since proxy start
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageDetail {
    #[serde(default)]
    pub auth_index: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub tokens: TokenCounts,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenCounts {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub reasoning_tokens: i64,
    #[serde(default)]
    pub cached_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

/// One credential from `/v0/management/auth-files`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthFile {
    #[serde(default)]
    pub auth_index: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub account_type: String,
}

#[derive(Debug, Default, Deserialize)]
struct AuthFileList {
    #[serde(default)]
    files: Vec<AuthFile>,
}

/// Client for the CLIProxy management API
pub struct ProxyClient {
    http: reqwest::Client,
    base_url: String,
    management_key: Option<String>,
}

impl ProxyClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        management_key: Option<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            management_key,
        }
    }

    /// Fetch the raw usage document. The caller decides whether the tick
    /// can proceed without it.
    pub async fn fetch_usage(&self) -> Result<Value> {
        let url = format!("{}/v0/management/usage", self.base_url);
        let mut request = self.http.get(&url);
        if let Some(key) = &self.management_key {
            request = request.bearer_auth(key);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("failed to fetch usage data: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "usage API returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| Error::Upstream(format!("failed to decode usage response: {e}")))
    }

    /// Fetch the credential catalog. On failure the tick proceeds with an
    /// empty catalog and inferred attribution.
    pub async fn fetch_auth_files(&self) -> Result<Vec<AuthFile>> {
        let url = format!("{}/v0/management/auth-files", self.base_url);
        let resp = self
            .http
            .get(&url)
            .header(
                "X-Management-Key",
                self.management_key.as_deref().unwrap_or(""),
            )
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("failed to fetch auth files: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "auth files API returned {}",
                resp.status()
            )));
        }
        let list: AuthFileList = resp
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("failed to decode auth files response: {e}")))?;
        Ok(list.files)
    }
}
