use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel passed to the detector when wallet enrichment was not performed.
pub const NONCE_UNKNOWN: i64 = -1;

/// Trade direction as reported by the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
    #[default]
    Unknown,
}

impl Side {
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => Side::Buy,
            "SELL" => Side::Sell,
            _ => Side::Unknown,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
            Side::Unknown => "",
        }
    }
}

/// Binary outcome of the traded token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
    #[default]
    Unknown,
}

impl Outcome {
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "YES" => Outcome::Yes,
            "NO" => Outcome::No,
            _ => Outcome::Unknown,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Outcome::Yes => "YES",
            Outcome::No => "NO",
            Outcome::Unknown => "",
        }
    }
}

/// A normalized trade-like event.
///
/// `size` keeps the raw decimal string from the wire; it is only parsed when
/// computing `value_usd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub market_id: String,
    pub asset_id: String,
    pub maker_address: String,
    pub taker_address: String,
    pub side: Side,
    pub outcome: Outcome,
    pub size: String,
    pub price: f64,
    pub value_usd: f64,
    pub timestamp: DateTime<Utc>,
    pub external_trade_id: Option<String>,
    pub transaction_hash: Option<String>,
}

impl Trade {
    /// Bare trade on `asset_id` at `price`, stamped now. Mostly useful for
    /// callers that fill in the remaining fields with struct update syntax.
    pub fn new(id: impl Into<String>, asset_id: impl Into<String>, price: f64) -> Self {
        Self {
            id: id.into(),
            market_id: String::new(),
            asset_id: asset_id.into(),
            maker_address: String::new(),
            taker_address: String::new(),
            side: Side::Unknown,
            outcome: Outcome::Unknown,
            size: String::new(),
            price,
            value_usd: 0.0,
            timestamp: Utc::now(),
            external_trade_id: None,
            transaction_hash: None,
        }
    }
}

/// Detection signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    FreshInsider,
    Whale,
    PanicBurst,
    PriceShock,
}

impl SignalType {
    pub const ALL: [SignalType; 4] = [
        SignalType::FreshInsider,
        SignalType::Whale,
        SignalType::PanicBurst,
        SignalType::PriceShock,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            SignalType::FreshInsider => "FRESH_INSIDER",
            SignalType::Whale => "WHALE",
            SignalType::PanicBurst => "PANIC_BURST",
            SignalType::PriceShock => "PRICE_SHOCK",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            SignalType::FreshInsider => 0,
            SignalType::Whale => 1,
            SignalType::PanicBurst => 2,
            SignalType::PriceShock => 3,
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trade that tripped one detection rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspect {
    pub trade: Trade,
    pub signal_type: SignalType,
    /// Wallet transaction count, `NONCE_UNKNOWN` when not enriched
    pub nonce: i64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Suspect {
    pub fn new(trade: Trade, signal_type: SignalType, nonce: i64) -> Self {
        Self {
            trade,
            signal_type,
            nonce,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = metadata {
            self.metadata = map;
        }
        self
    }
}
