//! Gamma API market discovery: active markets and their CLOB token ids.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

const GAMMA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GammaMarket {
    #[serde(default, deserialize_with = "super::parser::de_lenient_string")]
    pub id: String,
    #[serde(
        rename = "conditionId",
        default,
        deserialize_with = "super::parser::de_lenient_string"
    )]
    pub condition_id: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default, deserialize_with = "super::parser::de_lenient_string")]
    pub slug: String,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub closed: Option<bool>,
    #[serde(default, deserialize_with = "de_string_f64_opt")]
    pub volume: Option<f64>,
    #[serde(default, deserialize_with = "de_string_f64_opt")]
    pub liquidity: Option<f64>,
    #[serde(rename = "clobTokenIds", default, deserialize_with = "de_string_vec")]
    pub clob_token_ids: Vec<String>,
}

impl GammaMarket {
    /// Key trades carry in their `market` field; older rows only have `id`.
    pub fn market_key(&self) -> &str {
        if self.condition_id.is_empty() {
            &self.id
        } else {
            &self.condition_id
        }
    }
}

/// Result of the bootstrap discovery call.
#[derive(Debug, Clone, Default)]
pub struct MarketDiscovery {
    pub markets: Vec<GammaMarket>,
    pub asset_ids: Vec<String>,
}

fn de_string_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Array(arr) => Ok(arr
            .into_iter()
            .filter_map(|x| match x {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()),
        // Gamma often returns JSON arrays as a string (e.g. "[\"123\",\"456\"]").
        // A malformed list leaves the market without tokens rather than
        // failing the whole page.
        Value::String(s) => Ok(serde_json::from_str::<Vec<String>>(&s).unwrap_or_default()),
        _ => Ok(Vec::new()),
    }
}

fn de_string_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => Ok(s.parse::<f64>().ok()),
        _ => Ok(None),
    }
}

/// `GET {base}/markets?active=true&closed=false&limit={limit}`
pub async fn fetch_active_markets(
    http: &reqwest::Client,
    base_url: &str,
    limit: usize,
) -> Result<Vec<GammaMarket>> {
    let url = format!("{}/markets", base_url.trim_end_matches('/'));
    let limit = limit.to_string();

    let response = http
        .get(&url)
        .timeout(GAMMA_TIMEOUT)
        .query(&[
            ("active", "true"),
            ("closed", "false"),
            ("limit", limit.as_str()),
        ])
        .send()
        .await
        .context("gamma markets request failed")?
        .error_for_status()
        .context("gamma markets status")?;

    let body = response.text().await.context("gamma markets text")?;
    debug!(body_len = body.len(), "gamma API response received");

    serde_json::from_str(&body)
        .map_err(|e| {
            warn!(
                error = %e,
                body_preview = %body.chars().take(500).collect::<String>(),
                "gamma JSON parse failed"
            );
            e
        })
        .context("gamma markets json parse")
}

/// Token ids across `markets`, de-duplicated in first-seen order.
pub fn extract_token_ids(markets: &[GammaMarket]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(markets.len() * 2);
    let mut ids = Vec::with_capacity(markets.len() * 2);

    for market in markets {
        if market.clob_token_ids.is_empty() {
            debug!(market = %market.slug, "market has no token ids");
            continue;
        }
        for id in &market.clob_token_ids {
            if !id.is_empty() && seen.insert(id.as_str()) {
                ids.push(id.clone());
            }
        }
    }

    ids
}

/// Fetch active markets together with the asset ids to subscribe to.
pub async fn discover_markets(
    http: &reqwest::Client,
    base_url: &str,
    limit: usize,
) -> Result<MarketDiscovery> {
    let markets = fetch_active_markets(http, base_url, limit).await?;
    let asset_ids = extract_token_ids(&markets);
    info!(
        markets = markets.len(),
        tokens = asset_ids.len(),
        "📈 Fetched active markets"
    );
    Ok(MarketDiscovery { markets, asset_ids })
}
