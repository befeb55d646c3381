use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info};

use super::burst::BurstTracker;
use crate::models::{Suspect, SignalType, Trade};

/// Relative move between consecutive prices that counts as a shock
pub const PRICE_SHOCK_THRESHOLD: f64 = 0.05;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Minimum value for fresh-insider checks and enrichment
    pub min_value_usd: f64,
    pub whale_value_usd: f64,
    /// Wallets with at most this many transactions count as fresh
    pub fresh_wallet_nonce: i64,
    pub burst_count: usize,
    pub burst_window: Duration,
    /// Last-price entries idle for longer than this are evicted on cleanup
    pub price_idle_ttl: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_value_usd: 2_000.0,
            whale_value_usd: 50_000.0,
            fresh_wallet_nonce: 5,
            burst_count: 3,
            burst_window: Duration::from_secs(60),
            price_idle_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PriceEntry {
    price: f64,
    seen_at: Instant,
}

/// Stateful rule evaluator shared by all workers.
pub struct SignalDetector {
    config: DetectorConfig,
    burst_tracker: BurstTracker,
    last_prices: Mutex<HashMap<String, PriceEntry>>,
}

impl SignalDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            burst_tracker: BurstTracker::new(config.burst_window),
            config,
            last_prices: Mutex::new(HashMap::with_capacity(512)),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Evaluate every rule against `trade`.
    ///
    /// `nonce` is the maker's transaction count, or `NONCE_UNKNOWN` when the
    /// wallet was not enriched; fresh-insider checks are skipped in that case.
    pub fn detect(&self, trade: &Trade, nonce: i64) -> Vec<Suspect> {
        let mut suspects = Vec::new();

        // Price shock first: it is the only rule touching the price map.
        if let Some(prev_price) = self.swap_last_price(&trade.asset_id, trade.price) {
            if prev_price > 0.0 {
                let pct_change = (trade.price - prev_price).abs() / prev_price;
                if pct_change >= PRICE_SHOCK_THRESHOLD {
                    debug!(
                        asset = %trade.asset_id,
                        prev_price,
                        new_price = trade.price,
                        pct_change,
                        "price_shock"
                    );
                    suspects.push(
                        Suspect::new(trade.clone(), SignalType::PriceShock, nonce).with_metadata(
                            json!({
                                "prev_price": prev_price,
                                "new_price": trade.price,
                                "pct_change": pct_change,
                            }),
                        ),
                    );
                }
            }
        }

        if trade.value_usd >= self.config.whale_value_usd {
            info!(
                "🐋 Whale trade detected: ${:.0} {} on {}",
                trade.value_usd,
                trade.side.as_str(),
                trade.market_id
            );
            suspects.push(Suspect::new(trade.clone(), SignalType::Whale, nonce));
        }

        if nonce >= 0
            && trade.value_usd >= self.config.min_value_usd
            && nonce <= self.config.fresh_wallet_nonce
        {
            info!(
                maker = %trade.maker_address,
                nonce,
                value_usd = trade.value_usd,
                "fresh_insider"
            );
            suspects.push(
                Suspect::new(trade.clone(), SignalType::FreshInsider, nonce)
                    .with_metadata(json!({ "nonce": nonce })),
            );
        }

        if !trade.maker_address.is_empty() {
            let count = self.burst_tracker.record(&trade.maker_address);
            if count >= self.config.burst_count {
                debug!(maker = %trade.maker_address, count, "panic_burst");
                suspects.push(
                    Suspect::new(trade.clone(), SignalType::PanicBurst, nonce).with_metadata(
                        json!({
                            "trade_count": count,
                            "window_secs": self.config.burst_window.as_secs(),
                        }),
                    ),
                );
            }
        }

        suspects
    }

    /// Cheap pre-filter for the wallet nonce lookup.
    pub fn should_enrich(&self, trade: &Trade) -> bool {
        trade.value_usd >= self.config.min_value_usd && !trade.maker_address.is_empty()
    }

    /// Evict idle burst keys and idle last-price entries.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let burst_removed = self.burst_tracker.cleanup_at(now);

        let price_removed = match now.checked_sub(self.config.price_idle_ttl) {
            Some(cutoff) => {
                let mut prices = self.last_prices.lock();
                let before = prices.len();
                prices.retain(|_, entry| entry.seen_at > cutoff);
                before - prices.len()
            }
            None => 0,
        };

        debug!(burst_removed, price_removed, "detector_cleanup");
    }

    pub fn tracked_assets(&self) -> usize {
        self.last_prices.lock().len()
    }

    pub fn tracked_addresses(&self) -> usize {
        self.burst_tracker.len()
    }

    /// Store `price` for `asset_id` and return the previous one, in a single
    /// critical section.
    fn swap_last_price(&self, asset_id: &str, price: f64) -> Option<f64> {
        let entry = PriceEntry {
            price,
            seen_at: Instant::now(),
        };
        self.last_prices
            .lock()
            .insert(asset_id.to_string(), entry)
            .map(|prev| prev.price)
    }
}
