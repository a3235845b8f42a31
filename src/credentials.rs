//! Per-credential and per-API-key usage aggregation
//!
//! Walks the usage document's details array (one entry per proxied request)
//! and attributes each request to a credential and an API key. Credential
//! identity is weak: `auth_index` when the proxy reports one, the `source`
//! string otherwise, and a heuristic guess at provider/email when the
//! source matches nothing in the auth-file catalog.
//!
//! The result is a single summary row replaced wholesale every sync.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::proxy::{AuthFile, UsageDoc};
use crate::store::Store;

/// Resolved identity of one credential
#[derive(Debug, Clone, Serialize)]
pub struct CredentialInfo {
    pub provider: String,
    pub email: String,
    pub name: String,
    pub label: String,
    pub status: String,
    pub account_type: String,
    pub auth_index: String,
}

impl From<&AuthFile> for CredentialInfo {
    fn from(file: &AuthFile) -> Self {
        Self {
            provider: file.provider.clone(),
            email: file.email.clone(),
            name: file.name.clone(),
            label: file.label.clone(),
            status: if file.status.is_empty() {
                "unknown".to_string()
            } else {
                file.status.clone()
            },
            account_type: file.account_type.clone(),
            auth_index: file.auth_index.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CredentialModelStat {
    pub requests: i64,
    pub success: i64,
    pub failure: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub reasoning_tokens: i64,
    pub cached_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialStat {
    pub auth_index: String,
    pub source: String,
    pub provider: String,
    pub email: String,
    pub label: String,
    pub status: String,
    pub account_type: String,
    pub total_requests: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub success_rate: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub reasoning_tokens: i64,
    pub cached_tokens: i64,
    pub total_tokens: i64,
    pub models: BTreeMap<String, CredentialModelStat>,
    pub api_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiKeyModelStat {
    pub requests: i64,
    pub tokens: i64,
    pub success: i64,
    pub failure: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyStat {
    pub api_key_name: String,
    pub total_requests: i64,
    pub total_tokens: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub success_rate: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub models: BTreeMap<String, ApiKeyModelStat>,
    pub credentials_used: Vec<String>,
}

/// The single `credential_usage_summary` row (id = 1)
#[derive(Debug, Serialize)]
pub struct CredentialSummary {
    pub id: i64,
    pub credentials: Vec<CredentialStat>,
    pub api_keys: Vec<ApiKeyStat>,
    pub total_credentials: usize,
    pub total_api_keys: usize,
    pub synced_at: DateTime<Utc>,
}

fn truncated(source: &str) -> String {
    let head: String = source.chars().take(20).collect();
    format!("{head}...")
}

/// Guess provider and email from the raw source string when the catalog
/// has no match.
fn infer_credential(auth_index: &str, source: &str) -> CredentialInfo {
    let mut provider = "unknown".to_string();
    let mut email = if !source.is_empty() {
        source.to_string()
    } else if !auth_index.is_empty() {
        auth_index.to_string()
    } else {
        "unknown".to_string()
    };

    if !source.is_empty() {
        let s = source.to_lowercase();
        if s.starts_with("aizasy") || s.contains("googleapis") {
            provider = "gemini-api-key".to_string();
            email = truncated(source);
        } else if s.ends_with(".json") {
            // provider-email filename, with `_` standing in for `.`
            let stem = s.trim_end_matches(".json");
            if let Some((p, e)) = stem.split_once('-') {
                provider = p.to_string();
                email = e.replace('_', ".");
            }
        } else if source.contains('@') {
            provider = "oauth".to_string();
            email = source.to_string();
        } else if source.contains('=') || source.len() > 40 {
            provider = "api-key".to_string();
            email = truncated(source);
        }
    }

    CredentialInfo {
        provider,
        label: email.clone(),
        email,
        name: source.to_string(),
        status: "active".to_string(),
        account_type: "inferred".to_string(),
        auth_index: auth_index.to_string(),
    }
}

fn resolve_credential<'a>(
    auth_index: &str,
    source: &str,
    by_auth_index: &'a HashMap<&str, &AuthFile>,
    by_name: &'a HashMap<&str, &AuthFile>,
) -> CredentialInfo {
    if !auth_index.is_empty() {
        if let Some(file) = by_auth_index.get(auth_index) {
            return CredentialInfo::from(*file);
        }
    }
    if !source.is_empty() {
        if let Some(file) = by_name.get(source) {
            return CredentialInfo::from(*file);
        }
    }
    infer_credential(auth_index, source)
}

#[derive(Default)]
struct CredentialAccumulator {
    info: Option<CredentialInfo>,
    total_requests: i64,
    success_count: i64,
    failure_count: i64,
    input_tokens: i64,
    output_tokens: i64,
    reasoning_tokens: i64,
    cached_tokens: i64,
    total_tokens: i64,
    models: BTreeMap<String, CredentialModelStat>,
    api_keys: BTreeSet<String>,
}

#[derive(Default)]
struct ApiKeyAccumulator {
    total_requests: i64,
    total_tokens: i64,
    success_count: i64,
    failure_count: i64,
    input_tokens: i64,
    output_tokens: i64,
    models: BTreeMap<String, ApiKeyModelStat>,
    credentials_used: BTreeSet<String>,
}

fn success_rate(success: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    (success as f64 / total as f64 * 1000.0).round() / 10.0
}

/// Aggregate the usage document into per-credential and per-API-key stats,
/// both sorted by total requests descending.
pub fn aggregate(
    usage: &UsageDoc,
    auth_files: &[AuthFile],
) -> (Vec<CredentialStat>, Vec<ApiKeyStat>) {
    let mut by_auth_index: HashMap<&str, &AuthFile> = HashMap::new();
    let mut by_name: HashMap<&str, &AuthFile> = HashMap::new();
    for file in auth_files {
        if !file.auth_index.is_empty() {
            by_auth_index.insert(file.auth_index.as_str(), file);
        }
        if !file.name.is_empty() {
            by_name.insert(file.name.as_str(), file);
        }
    }

    let mut credentials: HashMap<String, CredentialAccumulator> = HashMap::new();
    let mut api_keys: HashMap<String, ApiKeyAccumulator> = HashMap::new();

    for (api_key_name, api_data) in &usage.apis {
        let ak = api_keys.entry(api_key_name.clone()).or_default();

        for (model_name, model_data) in &api_data.models {
            for detail in &model_data.details {
                let cred_key = if !detail.auth_index.is_empty() {
                    detail.auth_index.clone()
                } else if !detail.source.is_empty() {
                    detail.source.clone()
                } else {
                    "unknown".to_string()
                };

                let cred = credentials.entry(cred_key.clone()).or_default();
                if cred.info.is_none() {
                    cred.info = Some(resolve_credential(
                        &detail.auth_index,
                        &detail.source,
                        &by_auth_index,
                        &by_name,
                    ));
                }

                let tokens = &detail.tokens;
                cred.total_requests += 1;
                if detail.failed {
                    cred.failure_count += 1;
                } else {
                    cred.success_count += 1;
                }
                cred.input_tokens += tokens.input_tokens;
                cred.output_tokens += tokens.output_tokens;
                cred.reasoning_tokens += tokens.reasoning_tokens;
                cred.cached_tokens += tokens.cached_tokens;
                cred.total_tokens += tokens.total_tokens;
                cred.api_keys.insert(api_key_name.clone());

                let m = cred.models.entry(model_name.clone()).or_default();
                m.requests += 1;
                m.success += i64::from(!detail.failed);
                m.failure += i64::from(detail.failed);
                m.input_tokens += tokens.input_tokens;
                m.output_tokens += tokens.output_tokens;
                m.reasoning_tokens += tokens.reasoning_tokens;
                m.cached_tokens += tokens.cached_tokens;
                m.total_tokens += tokens.total_tokens;

                ak.total_requests += 1;
                ak.total_tokens += tokens.total_tokens;
                ak.input_tokens += tokens.input_tokens;
                ak.output_tokens += tokens.output_tokens;
                if detail.failed {
                    ak.failure_count += 1;
                } else {
                    ak.success_count += 1;
                }
                ak.credentials_used.insert(cred_key);

                let akm = ak.models.entry(model_name.clone()).or_default();
                akm.requests += 1;
                akm.tokens += tokens.total_tokens;
                akm.success += i64::from(!detail.failed);
                akm.failure += i64::from(detail.failed);
            }
        }
    }

    let mut credential_stats: Vec<CredentialStat> = credentials
        .into_iter()
        .map(|(cred_key, acc)| {
            let info = acc
                .info
                .unwrap_or_else(|| infer_credential(&cred_key, ""));
            CredentialStat {
                auth_index: info.auth_index,
                source: info.name,
                provider: info.provider,
                email: info.email,
                label: info.label,
                status: info.status,
                account_type: info.account_type,
                total_requests: acc.total_requests,
                success_count: acc.success_count,
                failure_count: acc.failure_count,
                success_rate: success_rate(acc.success_count, acc.total_requests),
                input_tokens: acc.input_tokens,
                output_tokens: acc.output_tokens,
                reasoning_tokens: acc.reasoning_tokens,
                cached_tokens: acc.cached_tokens,
                total_tokens: acc.total_tokens,
                models: acc.models,
                api_keys: acc.api_keys.into_iter().collect(),
            }
        })
        .collect();
    credential_stats.sort_by(|a, b| b.total_requests.cmp(&a.total_requests));

    let mut api_key_stats: Vec<ApiKeyStat> = api_keys
        .into_iter()
        .map(|(name, acc)| ApiKeyStat {
            api_key_name: name,
            total_requests: acc.total_requests,
            total_tokens: acc.total_tokens,
            success_count: acc.success_count,
            failure_count: acc.failure_count,
            success_rate: success_rate(acc.success_count, acc.total_requests),
            input_tokens: acc.input_tokens,
            output_tokens: acc.output_tokens,
            models: acc.models,
            credentials_used: acc.credentials_used.into_iter().collect(),
        })
        .collect();
    api_key_stats.sort_by(|a, b| b.total_requests.cmp(&a.total_requests));

    (credential_stats, api_key_stats)
}

/// Aggregate and wrap into the single summary row
pub fn summarize(usage: &UsageDoc, auth_files: &[AuthFile]) -> CredentialSummary {
    let (credentials, api_keys) = aggregate(usage, auth_files);
    CredentialSummary {
        id: 1,
        total_credentials: credentials.len(),
        total_api_keys: api_keys.len(),
        credentials,
        api_keys,
        synced_at: Utc::now(),
    }
}

/// Replace the summary row atomically
pub async fn store_summary(store: &Store, summary: &CredentialSummary) -> Result<()> {
    store
        .upsert("credential_usage_summary", "id", summary)
        .await?;
    tracing::info!(
        "Credential stats synced: {} credentials, {} API keys",
        summary.total_credentials,
        summary.total_api_keys
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{ApiUsage, ModelUsage, TokenCounts, UsageDetail};

    fn detail(auth_index: &str, source: &str, failed: bool, tokens: i64) -> UsageDetail {
        UsageDetail {
            auth_index: auth_index.to_string(),
            source: source.to_string(),
            failed,
            tokens: TokenCounts {
                input_tokens: tokens / 2,
                output_tokens: tokens / 2,
                total_tokens: tokens,
                ..TokenCounts::default()
            },
        }
    }

    fn doc(apis: Vec<(&str, Vec<(&str, Vec<UsageDetail>)>)>) -> UsageDoc {
        let mut usage = UsageDoc::default();
        for (api_key, models) in apis {
            let mut api = ApiUsage::default();
            for (model, details) in models {
                api.models.insert(
                    model.to_string(),
                    ModelUsage {
                        total_requests: details.len() as i64,
                        total_tokens: details.iter().map(|d| d.tokens.total_tokens).sum(),
                        details,
                    },
                );
            }
            usage.apis.insert(api_key.to_string(), api);
        }
        usage
    }

    #[test]
    fn test_infer_gemini_api_key() {
        let info = infer_credential("", "AIzaSyA1234567890abcdefghij");
        assert_eq!(info.provider, "gemini-api-key");
        assert_eq!(info.email, "AIzaSyA1234567890abc...");
        assert_eq!(info.account_type, "inferred");
    }

    #[test]
    fn test_infer_json_filename() {
        let info = infer_credential("", "codex-alice_example_com.json");
        assert_eq!(info.provider, "codex");
        assert_eq!(info.email, "alice.example.com");
    }

    #[test]
    fn test_infer_json_filename_without_dash() {
        let info = infer_credential("", "credentials.json");
        assert_eq!(info.provider, "unknown");
    }

    #[test]
    fn test_infer_oauth_email() {
        let info = infer_credential("", "alice@example.com");
        assert_eq!(info.provider, "oauth");
        assert_eq!(info.email, "alice@example.com");
    }

    #[test]
    fn test_infer_opaque_api_key() {
        let long = "sk-0123456789012345678901234567890123456789012345";
        let info = infer_credential("", long);
        assert_eq!(info.provider, "api-key");
        assert_eq!(info.email, "sk-01234567890123456...");
    }

    #[test]
    fn test_infer_unknown() {
        let info = infer_credential("", "mystery");
        assert_eq!(info.provider, "unknown");
        assert_eq!(info.email, "mystery");
    }

    fn auth_file(auth_index: &str, name: &str, email: &str) -> AuthFile {
        AuthFile {
            auth_index: auth_index.to_string(),
            provider: "gemini".to_string(),
            email: email.to_string(),
            name: name.to_string(),
            label: email.to_string(),
            status: "active".to_string(),
            account_type: "oauth".to_string(),
        }
    }

    #[test]
    fn test_catalog_match_by_auth_index_then_name() {
        let files = vec![
            auth_file("3", "alice.json", "alice@example.com"),
            auth_file("", "bob.json", "bob@example.com"),
        ];
        let usage = doc(vec![(
            "key-1",
            vec![(
                "gemini-2.5-flash",
                vec![
                    detail("3", "ignored.json", false, 100),
                    detail("", "bob.json", false, 100),
                ],
            )],
        )]);

        let (creds, _) = aggregate(&usage, &files);
        assert_eq!(creds.len(), 2);
        let alice = creds.iter().find(|c| c.email == "alice@example.com").unwrap();
        assert_eq!(alice.provider, "gemini");
        let bob = creds.iter().find(|c| c.email == "bob@example.com").unwrap();
        assert_eq!(bob.source, "bob.json");
    }

    #[test]
    fn test_aggregation_counts_and_sorting() {
        let usage = doc(vec![
            (
                "key-a",
                vec![(
                    "gemini-2.5-flash",
                    vec![
                        detail("1", "a.json", false, 100),
                        detail("1", "a.json", true, 50),
                        detail("1", "a.json", false, 100),
                    ],
                )],
            ),
            (
                "key-b",
                vec![("gpt-4o", vec![detail("2", "b.json", false, 200)])],
            ),
        ]);

        let (creds, keys) = aggregate(&usage, &[]);

        assert_eq!(creds.len(), 2);
        // sorted by total_requests descending
        assert_eq!(creds[0].total_requests, 3);
        assert_eq!(creds[0].success_count, 2);
        assert_eq!(creds[0].failure_count, 1);
        assert_eq!(creds[0].success_rate, 66.7);
        assert_eq!(creds[0].total_tokens, 250);
        assert_eq!(creds[0].api_keys, vec!["key-a".to_string()]);
        let model = creds[0].models.get("gemini-2.5-flash").unwrap();
        assert_eq!(model.requests, 3);
        assert_eq!(model.failure, 1);

        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].api_key_name, "key-a");
        assert_eq!(keys[0].total_requests, 3);
        assert_eq!(keys[0].credentials_used, vec!["1".to_string()]);
        assert_eq!(keys[1].total_tokens, 200);
    }

    #[test]
    fn test_missing_identity_falls_back_to_unknown() {
        let usage = doc(vec![(
            "key-a",
            vec![("gpt-4o", vec![detail("", "", false, 10)])],
        )]);
        let (creds, keys) = aggregate(&usage, &[]);
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].email, "unknown");
        assert_eq!(keys[0].credentials_used, vec!["unknown".to_string()]);
    }

    #[test]
    fn test_summary_row_shape() {
        let usage = doc(vec![(
            "key-a",
            vec![("gpt-4o", vec![detail("1", "a.json", false, 10)])],
        )]);
        let summary = summarize(&usage, &[]);
        assert_eq!(summary.id, 1);
        assert_eq!(summary.total_credentials, 1);
        assert_eq!(summary.total_api_keys, 1);
    }
}
