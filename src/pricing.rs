//! Model pricing - built-in table with a remote overlay
//!
//! The built-in table is the source of last resort and always usable.
//! A remote price list (llm-prices.com) is layered on top when reachable,
//! cached for one hour. Lookup falls back from exact match to substring
//! match to the `_default` entry, so unknown models still get a cost.
//!
//! The table is an insertion-ordered map: the substring fallback scans
//! entries in a fixed order (built-in literal order, remote additions
//! after), so a name matching several patterns always resolves to the
//! same price. `"custom-gpt-4o-variant"` contains both `gpt-4o` and
//! `gpt-4`; first match wins.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::RwLock;

pub const LLM_PRICES_URL: &str = "https://www.llm-prices.com/current-v1.json";

/// How long a fetched remote price list stays valid
const REMOTE_TTL: Duration = Duration::from_secs(3600);

/// USD per 1M tokens, input and output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPrice {
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
}

/// Built-in pricing (USD per 1M tokens) - updated Dec 2024
const BUILTIN_PRICES: &[(&str, &str, &str)] = &[
    ("gpt-4o", "2.50", "10.00"),
    ("gpt-4o-mini", "0.15", "0.60"),
    ("gpt-4-turbo", "10.00", "30.00"),
    ("gpt-4", "30.00", "60.00"),
    ("gpt-3.5-turbo", "0.50", "1.50"),
    ("o1", "15.00", "60.00"),
    ("o1-mini", "3.00", "12.00"),
    ("o1-preview", "15.00", "60.00"),
    ("o3", "15.00", "60.00"),
    ("o3-mini", "1.10", "4.40"),
    ("claude-sonnet-4", "3.00", "15.00"),
    ("claude-4-sonnet", "3.00", "15.00"),
    ("claude-opus-4", "15.00", "75.00"),
    ("claude-4-opus", "15.00", "75.00"),
    ("claude-3-5-sonnet", "3.00", "15.00"),
    ("claude-3.5-sonnet", "3.00", "15.00"),
    ("claude-3-5-haiku", "0.80", "4.00"),
    ("claude-3.5-haiku", "0.80", "4.00"),
    ("claude-3-sonnet", "3.00", "15.00"),
    ("claude-3-opus", "15.00", "75.00"),
    ("claude-3-haiku", "0.25", "1.25"),
    ("claude-sonnet", "3.00", "15.00"),
    ("claude-opus", "15.00", "75.00"),
    ("claude-haiku", "0.80", "4.00"),
    ("gemini-2.5-pro", "1.25", "10.00"),
    ("gemini-2.5-flash", "0.075", "0.30"),
    ("gemini-2.5-flash-preview", "0.075", "0.30"),
    ("gemini-2.0-flash", "0.10", "0.40"),
    ("gemini-2.0-flash-lite", "0.075", "0.30"),
    ("gemini-2.0-flash-exp", "0.10", "0.40"),
    ("gemini-1.5-pro", "1.25", "5.00"),
    ("gemini-1.5-flash", "0.075", "0.30"),
    ("_default", "0.15", "0.60"),
];

static BUILTIN: OnceLock<IndexMap<String, ModelPrice>> = OnceLock::new();

fn builtin_table() -> &'static IndexMap<String, ModelPrice> {
    BUILTIN.get_or_init(|| {
        BUILTIN_PRICES
            .iter()
            .map(|(name, input, output)| {
                let price = ModelPrice {
                    input_per_million: input.parse().expect("valid price literal"),
                    output_per_million: output.parse().expect("valid price literal"),
                };
                ((*name).to_string(), price)
            })
            .collect()
    })
}

/// A merged price table ready for lookups. Remote entries shadow built-in
/// entries of the same id (keeping their position); new remote ids append
/// after the built-in entries.
#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: IndexMap<String, ModelPrice>,
}

impl PriceTable {
    /// Built-in prices only (what every lookup degrades to offline)
    pub fn builtin() -> Self {
        Self {
            prices: builtin_table().clone(),
        }
    }

    fn with_overlay(remote: &IndexMap<String, ModelPrice>) -> Self {
        let mut prices = builtin_table().clone();
        for (id, price) in remote {
            prices.insert(id.clone(), price.clone());
        }
        Self { prices }
    }

    /// Resolve the price for a model name.
    ///
    /// Exact lowercase match first, then substring match in either direction
    /// against every non-default entry in table order (first match wins),
    /// then `_default`.
    pub fn resolve(&self, model_name: &str) -> &ModelPrice {
        let lower = model_name.to_lowercase();
        if let Some(price) = self.prices.get(&lower) {
            return price;
        }
        for (pattern, price) in &self.prices {
            if pattern != "_default" && (lower.contains(pattern.as_str()) || pattern.contains(&lower))
            {
                return price;
            }
        }
        self.prices
            .get("_default")
            .expect("_default entry present in every price table")
    }
}

/// Estimated cost in USD for a token count at the given price
pub fn cost(input_tokens: i64, output_tokens: i64, price: &ModelPrice) -> Decimal {
    let million = Decimal::from(1_000_000_u64);
    Decimal::from(input_tokens) * price.input_per_million / million
        + Decimal::from(output_tokens) * price.output_per_million / million
}

#[derive(Debug, Deserialize)]
struct RemotePriceList {
    #[serde(default)]
    prices: Vec<RemotePrice>,
}

#[derive(Debug, Deserialize)]
struct RemotePrice {
    id: Option<String>,
    input: Option<f64>,
    output: Option<f64>,
}

#[derive(Default)]
struct RemoteCache {
    prices: IndexMap<String, ModelPrice>,
    fetched_at: Option<Instant>,
}

/// Resolver holding the process-wide remote pricing cache
pub struct PricingResolver {
    http: reqwest::Client,
    prices_url: String,
    cache: RwLock<RemoteCache>,
}

impl PricingResolver {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_url(http, LLM_PRICES_URL)
    }

    pub fn with_url(http: reqwest::Client, prices_url: impl Into<String>) -> Self {
        Self {
            http,
            prices_url: prices_url.into(),
            cache: RwLock::new(RemoteCache::default()),
        }
    }

    /// Current merged price table. Refreshes the remote overlay when the
    /// cache is stale; any fetch failure degrades to the built-in table.
    pub async fn table(&self) -> PriceTable {
        {
            let cache = self.cache.read().await;
            if let Some(at) = cache.fetched_at {
                if at.elapsed() < REMOTE_TTL && !cache.prices.is_empty() {
                    return PriceTable::with_overlay(&cache.prices);
                }
            }
        }

        match self.fetch_remote().await {
            Ok(remote) if !remote.is_empty() => {
                let mut cache = self.cache.write().await;
                cache.prices = remote;
                cache.fetched_at = Some(Instant::now());
                PriceTable::with_overlay(&cache.prices)
            }
            Ok(_) => PriceTable::builtin(),
            Err(e) => {
                tracing::warn!("Could not fetch remote pricing: {}", e);
                PriceTable::builtin()
            }
        }
    }

    async fn fetch_remote(&self) -> crate::error::Result<IndexMap<String, ModelPrice>> {
        tracing::info!("Fetching latest pricing from {}", self.prices_url);
        let list: RemotePriceList = self
            .http
            .get(&self.prices_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut prices = IndexMap::new();
        for item in list.prices {
            let (Some(id), Some(input), Some(output)) = (item.id, item.input, item.output) else {
                continue;
            };
            let (Some(input), Some(output)) =
                (Decimal::from_f64(input), Decimal::from_f64(output))
            else {
                continue;
            };
            prices.insert(
                id.to_lowercase(),
                ModelPrice {
                    input_per_million: input,
                    output_per_million: output,
                },
            );
        }
        Ok(prices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_exact_match() {
        let table = PriceTable::builtin();
        let price = table.resolve("gpt-4o");
        assert_eq!(price.input_per_million, dec("2.50"));
        assert_eq!(price.output_per_million, dec("10.00"));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let table = PriceTable::builtin();
        assert_eq!(table.resolve("GPT-4o").input_per_million, dec("2.50"));
    }

    #[test]
    fn test_substring_match() {
        let table = PriceTable::builtin();
        // "models/gemini-2.5-flash" is not an exact key but contains one
        let price = table.resolve("models/gemini-2.5-flash");
        assert_eq!(price.input_per_million, dec("0.075"));
        assert_eq!(price.output_per_million, dec("0.30"));
    }

    #[test]
    fn test_substring_collision_resolves_in_table_order() {
        let table = PriceTable::builtin();
        // matches both "gpt-4o" and "gpt-4"; the earlier entry wins, every run
        let price = table.resolve("custom-gpt-4o-variant");
        assert_eq!(price.input_per_million, dec("2.50"));
        assert_eq!(price.output_per_million, dec("10.00"));
    }

    #[test]
    fn test_default_fallback() {
        let table = PriceTable::builtin();
        let price = table.resolve("totally-unknown-model");
        assert_eq!(price.input_per_million, dec("0.15"));
        assert_eq!(price.output_per_million, dec("0.60"));
    }

    #[test]
    fn test_cost_calculation() {
        let table = PriceTable::builtin();
        let price = table.resolve("gemini-2.5-flash");
        // 40k input + 10k output at 0.075/0.30 per 1M
        assert_eq!(cost(40_000, 10_000, price), dec("0.006"));
    }

    #[test]
    fn test_remote_overlay_shadows_builtin() {
        let mut remote = IndexMap::new();
        remote.insert(
            "gpt-4o".to_string(),
            ModelPrice {
                input_per_million: dec("1.00"),
                output_per_million: dec("2.00"),
            },
        );
        let table = PriceTable::with_overlay(&remote);
        assert_eq!(table.resolve("gpt-4o").input_per_million, dec("1.00"));
        // untouched entries still come from the built-in table
        assert_eq!(table.resolve("o3-mini").input_per_million, dec("1.10"));
    }

    #[tokio::test]
    async fn test_unreachable_remote_degrades_to_builtin() {
        let resolver =
            PricingResolver::with_url(reqwest::Client::new(), "http://127.0.0.1:9/current-v1.json");
        let table = resolver.table().await;
        assert_eq!(table.resolve("gpt-4o").input_per_million, dec("2.50"));
    }
}
