//! CLOB REST trades poller.
//!
//! Secondary ingestion path next to the market WebSocket. Every tick fetches
//! trades created after the previous successful fetch and offers them to the
//! same bounded trade queue. Failures are logged and never end the loop: the
//! listener alone is a valid operating mode.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::{
    sync::watch,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use super::parser::{de_lenient_string, parse_f64, parse_timestamp};
use crate::metrics::MetricsSink;
use crate::models::{Outcome, Side, Trade};
use crate::queue::QueueSender;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_LOOKBACK_MINUTES: i64 = 5;
const PAGE_LIMIT: usize = 100;

/// The trades endpoint is not served by this host.
#[derive(Debug, thiserror::Error)]
#[error("endpoint not found (expected when running on the websocket feed only)")]
pub struct EndpointNotFound;

/// Trade row from `GET /trades`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiTrade {
    #[serde(default, deserialize_with = "de_lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    pub market: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    pub asset_id: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    pub maker_address: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    pub taker_address: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    pub side: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    pub size: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    pub price: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    pub outcome: String,
    /// Unix milliseconds, or any format the event parser accepts
    #[serde(default, deserialize_with = "de_lenient_string")]
    pub timestamp: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    pub transaction_hash: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    pub trade_id: String,
}

impl ApiTrade {
    /// Normalize into a `Trade`. REST sizes are human-scale, so the value is
    /// simply `price * size`.
    pub fn into_trade(self) -> Trade {
        let price = parse_f64(&self.price);
        let size = parse_f64(&self.size);
        let value_usd = (price * size).max(0.0);

        Trade {
            id: format!("api-{}", self.id),
            market_id: self.market,
            asset_id: self.asset_id,
            maker_address: self.maker_address,
            taker_address: self.taker_address,
            side: Side::from_wire(&self.side),
            outcome: Outcome::from_wire(&self.outcome),
            size: self.size,
            price,
            value_usd,
            timestamp: parse_timestamp(&[self.timestamp.as_str()]),
            external_trade_id: non_empty(self.trade_id),
            transaction_hash: non_empty(self.transaction_hash),
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

pub struct TradesPoller {
    client: Client,
    base_url: String,
    interval: Duration,
    trades: QueueSender<Trade>,
    /// `after` cursor: start time of the last successful fetch
    cursor: DateTime<Utc>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl TradesPoller {
    pub fn new(base_url: &str, interval: Duration, trades: QueueSender<Trade>) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .pool_max_idle_per_host(4)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            interval,
            trades,
            cursor: Utc::now() - ChronoDuration::minutes(INITIAL_LOOKBACK_MINUTES),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn cursor(&self) -> DateTime<Utc> {
        self.cursor
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            base_url = %self.base_url,
            interval_ms = self.interval.as_millis() as u64,
            "🔄 Starting CLOB trades poller"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            // First tick fires immediately.
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.poll_once() => result,
            };

            if let Err(e) = result {
                if e.downcast_ref::<EndpointNotFound>().is_some() {
                    debug!(error = %e, "trades poll skipped");
                } else {
                    warn!(error = %e, "trades poll failed");
                }
            }
        }

        info!("trades poller stopped");
    }

    /// One fetch + dispatch cycle. Returns the number of trades accepted by
    /// the queue.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let started = Utc::now();
        let trades = self.fetch_recent_trades(self.cursor).await?;
        self.cursor = started;

        if let Some(sink) = &self.metrics {
            sink.record_poll(started);
        }

        if trades.is_empty() {
            return Ok(0);
        }
        debug!(count = trades.len(), "trades fetched");

        let mut accepted = 0;
        for trade in trades {
            if self.trades.offer(trade) {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    async fn fetch_recent_trades(&self, after: DateTime<Utc>) -> Result<Vec<Trade>> {
        let url = format!(
            "{}/trades?after={}&limit={}",
            self.base_url,
            after.timestamp_millis(),
            PAGE_LIMIT
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("trades request failed")?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(EndpointNotFound.into()),
            status => anyhow::bail!("unexpected status: {}", status),
        }

        let rows: Vec<ApiTrade> = resp.json().await.context("decode trades response")?;
        Ok(rows.into_iter().map(ApiTrade::into_trade).collect())
    }
}
