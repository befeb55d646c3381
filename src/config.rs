//! Engine configuration
//!
//! Priority: environment variables > `.env` file > defaults.

use std::time::Duration;

use anyhow::{bail, Result};

use crate::scrapers::polymarket_ws::ListenerConfig;
use crate::signals::detector::DetectorConfig;

pub const DEFAULT_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/";
pub const DEFAULT_REST_URL: &str = "https://clob.polymarket.com";
pub const DEFAULT_GAMMA_URL: &str = "https://gamma-api.polymarket.com";

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub polymarket_ws_url: String,
    /// Empty disables the secondary trades poller
    pub polymarket_rest_url: String,
    pub gamma_api_url: String,
    pub market_limit: usize,
    pub trade_poll_interval: Duration,

    // Detection thresholds
    pub min_value_usd: f64,
    pub whale_value_usd: f64,
    pub fresh_wallet_nonce: i64,
    pub burst_count: usize,
    pub burst_window: Duration,

    // Pipeline
    pub worker_count: usize,
    pub trade_queue_capacity: usize,
    pub suspect_queue_capacity: usize,
    pub cleanup_interval: Duration,
    pub drain_timeout: Duration,

    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            polymarket_ws_url: DEFAULT_WS_URL.to_string(),
            polymarket_rest_url: DEFAULT_REST_URL.to_string(),
            gamma_api_url: DEFAULT_GAMMA_URL.to_string(),
            market_limit: 100,
            trade_poll_interval: Duration::from_secs(3),
            min_value_usd: 2_000.0,
            whale_value_usd: 50_000.0,
            fresh_wallet_nonce: 5,
            burst_count: 3,
            burst_window: Duration::from_secs(60),
            worker_count: 5,
            trade_queue_capacity: 1_000,
            suspect_queue_capacity: 100,
            cleanup_interval: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(5),
            log_level: "INFO".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            polymarket_ws_url: env_string("POLYMARKET_WS_URL", &defaults.polymarket_ws_url),
            // An explicitly empty value turns the poller off, so don't fall back here.
            polymarket_rest_url: std::env::var("POLYMARKET_REST_URL")
                .unwrap_or(defaults.polymarket_rest_url),
            gamma_api_url: env_string("GAMMA_API_URL", &defaults.gamma_api_url),
            market_limit: env_parse("MARKET_LIMIT", defaults.market_limit),
            trade_poll_interval: Duration::from_secs(env_parse(
                "TRADE_POLL_INTERVAL_SECONDS",
                defaults.trade_poll_interval.as_secs(),
            )),
            min_value_usd: env_parse("MIN_VALUE_USD", defaults.min_value_usd),
            whale_value_usd: env_parse("WHALE_VALUE_USD", defaults.whale_value_usd),
            fresh_wallet_nonce: env_parse("FRESH_WALLET_NONCE", defaults.fresh_wallet_nonce),
            burst_count: env_parse("BURST_COUNT", defaults.burst_count),
            burst_window: Duration::from_secs(env_parse(
                "BURST_WINDOW_SECONDS",
                defaults.burst_window.as_secs(),
            )),
            worker_count: env_parse("WORKER_COUNT", defaults.worker_count),
            trade_queue_capacity: env_parse("TRADE_QUEUE_CAPACITY", defaults.trade_queue_capacity),
            suspect_queue_capacity: env_parse(
                "SUSPECT_QUEUE_CAPACITY",
                defaults.suspect_queue_capacity,
            ),
            cleanup_interval: Duration::from_secs(env_parse(
                "CLEANUP_INTERVAL_SECONDS",
                defaults.cleanup_interval.as_secs(),
            )),
            drain_timeout: Duration::from_secs(env_parse(
                "DRAIN_TIMEOUT_SECONDS",
                defaults.drain_timeout.as_secs(),
            )),
            log_level: env_string("LOG_LEVEL", &defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.polymarket_ws_url.trim().is_empty() {
            bail!("POLYMARKET_WS_URL is required");
        }
        if self.min_value_usd <= 0.0 {
            bail!("MIN_VALUE_USD must be positive");
        }
        if self.whale_value_usd <= 0.0 {
            bail!("WHALE_VALUE_USD must be positive");
        }
        if self.burst_count < 1 {
            bail!("BURST_COUNT must be at least 1");
        }
        if self.burst_window.is_zero() {
            bail!("BURST_WINDOW_SECONDS must be positive");
        }
        if self.worker_count < 1 {
            bail!("WORKER_COUNT must be at least 1");
        }
        if self.trade_queue_capacity < 1 || self.suspect_queue_capacity < 1 {
            bail!("queue capacities must be at least 1");
        }
        if self.trade_poll_interval.is_zero() {
            bail!("TRADE_POLL_INTERVAL_SECONDS must be positive");
        }
        Ok(())
    }

    pub fn poller_enabled(&self) -> bool {
        !self.polymarket_rest_url.trim().is_empty()
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            min_value_usd: self.min_value_usd,
            whale_value_usd: self.whale_value_usd,
            fresh_wallet_nonce: self.fresh_wallet_nonce,
            burst_count: self.burst_count,
            burst_window: self.burst_window,
            ..DetectorConfig::default()
        }
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            url: self.polymarket_ws_url.clone(),
            ..ListenerConfig::default()
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.poller_enabled());
        assert_eq!(config.detector_config().burst_count, 3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.worker_count = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.whale_value_usd = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.polymarket_ws_url = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_rest_url_disables_poller() {
        let config = Config {
            polymarket_rest_url: String::new(),
            ..Config::default()
        };
        assert!(!config.poller_enabled());
    }
}
