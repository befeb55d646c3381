//! Polymarket market-channel message parser
//!
//! The feed does not carry a single schema. Each payload is matched against a
//! closed set of shapes, tried in a fixed order, and the first structural match
//! decides the outcome even when it yields no trades:
//!
//! 1. array of book / price_change events
//! 2. single event object carrying `event_type`
//! 3. `{ "type": .., "data": .. }` envelope, dispatched on `type`:
//!    `last_trade_price` (top-level fields) or `trade` (payload in `data`)
//!
//! Only a payload that is not a JSON object envelope at all is an error.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::models::{Outcome, Side, Trade};

pub const KIND_BOOK_ARRAY: &str = "book_array";
pub const KIND_LAST_TRADE_PRICE: &str = "last_trade_price";
pub const KIND_TRADE: &str = "trade";

/// Marks trades synthesized from orderbook updates (no real size).
pub const BOOK_UPDATE_SIZE: &str = "book_update";

/// Sizes above this are raw 6-decimal integers rather than USDC amounts.
const RAW_USDC_THRESHOLD: f64 = 1e6;
/// Numeric timestamps above this are milliseconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to unmarshal message: {0}")]
    InvalidEnvelope(#[from] serde_json::Error),

    #[error("message is not a JSON object envelope")]
    NotAnEnvelope,
}

/// Result of parsing one payload
#[derive(Debug, Default, Clone)]
pub struct ParsedMessage {
    pub trades: Vec<Trade>,
    /// Discriminator observed on the wire, empty when absent
    pub kind: String,
}

impl ParsedMessage {
    fn new(trades: Vec<Trade>, kind: impl Into<String>) -> Self {
        Self {
            trades,
            kind: kind.into(),
        }
    }
}

// =============================================================================
// WIRE SHAPES
// =============================================================================

/// Orderbook snapshot / price change event
#[derive(Debug, Clone, Default, Deserialize)]
struct BookEvent {
    #[serde(default, deserialize_with = "de_lenient_string")]
    market: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    asset_id: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    timestamp: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    event_type: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    last_trade_price: String,
}

/// Generic `type`-tagged envelope
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct LastTradePriceEvent {
    #[serde(default, deserialize_with = "de_lenient_string")]
    asset_id: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    price: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    size: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    side: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    maker: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    taker: String,
}

/// Raw trade object; field names vary between feed versions.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawTrade {
    #[serde(default, deserialize_with = "de_lenient_string")]
    id: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    trade_id: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    market: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    asset_id: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    maker: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    taker: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    maker_address: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    taker_address: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    side: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    size: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    price: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    outcome: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    timestamp: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    transaction_hash: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    match_time: String,
}

impl RawTrade {
    fn is_identified(&self) -> bool {
        !self.id.is_empty() || !self.trade_id.is_empty()
    }
}

#[derive(Debug, Default, Deserialize)]
struct EmbeddedTrades {
    #[serde(default)]
    trades: Vec<RawTrade>,
}

/// Top-level shapes, in match priority order
enum Shape {
    BookArray(Vec<BookEvent>),
    SingleBook(BookEvent),
    Envelope(Envelope),
}

/// Shapes a `trade` envelope payload may take, in match priority order
enum TradePayload {
    Many(Vec<RawTrade>),
    Embedded(Vec<RawTrade>),
    Single(RawTrade),
}

// =============================================================================
// PARSING
// =============================================================================

/// Parse one raw feed payload into normalized trades.
pub fn parse_message(raw: &[u8]) -> Result<ParsedMessage, ParseError> {
    let value: Value = serde_json::from_slice(raw)?;

    match classify(value)? {
        Shape::BookArray(events) => Ok(ParsedMessage::new(
            trades_from_book_events(&events),
            KIND_BOOK_ARRAY,
        )),
        Shape::SingleBook(event) => {
            let kind = event.event_type.clone();
            Ok(ParsedMessage::new(
                trades_from_book_events(std::slice::from_ref(&event)),
                kind,
            ))
        }
        Shape::Envelope(envelope) => {
            let kind = envelope.kind.unwrap_or_default();
            match kind.as_str() {
                KIND_LAST_TRADE_PRICE => {
                    // Fields sit at the top level of the message, not in `data`.
                    let event: LastTradePriceEvent =
                        serde_json::from_slice(raw).unwrap_or_default();
                    Ok(ParsedMessage::new(trade_from_last_price(event), kind))
                }
                KIND_TRADE => {
                    let trades = envelope
                        .data
                        .and_then(classify_trade_payload)
                        .map(|payload| match payload {
                            TradePayload::Many(raw)
                            | TradePayload::Embedded(raw) => convert_trades(raw),
                            TradePayload::Single(raw) => convert_trades(vec![raw]),
                        })
                        .unwrap_or_default();
                    Ok(ParsedMessage::new(trades, kind))
                }
                _ => Ok(ParsedMessage::new(Vec::new(), kind)),
            }
        }
    }
}

fn classify(value: Value) -> Result<Shape, ParseError> {
    match value {
        Value::Array(items) => {
            let events: Vec<BookEvent> = serde_json::from_value(Value::Array(items))
                .map_err(|_| ParseError::NotAnEnvelope)?;
            match events.first() {
                Some(first) if is_book_event_type(&first.event_type) => {
                    Ok(Shape::BookArray(events))
                }
                _ => Err(ParseError::NotAnEnvelope),
            }
        }
        Value::Object(map) => {
            let has_event_type = map
                .get("event_type")
                .map(|v| !lenient_str(v).is_empty())
                .unwrap_or(false);
            if has_event_type {
                if let Ok(event) = serde_json::from_value::<BookEvent>(Value::Object(map.clone())) {
                    return Ok(Shape::SingleBook(event));
                }
            }
            let envelope: Envelope = serde_json::from_value(Value::Object(map))?;
            Ok(Shape::Envelope(envelope))
        }
        _ => Err(ParseError::NotAnEnvelope),
    }
}

fn is_book_event_type(event_type: &str) -> bool {
    matches!(event_type, "book" | "price_change")
}

fn classify_trade_payload(data: Value) -> Option<TradePayload> {
    if data.is_null() {
        return None;
    }

    if data.is_array() {
        if let Ok(many) = serde_json::from_value::<Vec<RawTrade>>(data.clone()) {
            if !many.is_empty() {
                return Some(TradePayload::Many(many));
            }
        }
        return None;
    }

    if let Ok(embedded) = serde_json::from_value::<EmbeddedTrades>(data.clone()) {
        if !embedded.trades.is_empty() {
            return Some(TradePayload::Embedded(embedded.trades));
        }
    }

    let single = serde_json::from_value::<RawTrade>(data).ok()?;
    if single.is_identified() || !single.market.is_empty() {
        return Some(TradePayload::Single(single));
    }
    None
}

fn trades_from_book_events(events: &[BookEvent]) -> Vec<Trade> {
    events
        .iter()
        .filter_map(|event| {
            if event.last_trade_price.is_empty() || event.last_trade_price == "0" {
                return None;
            }
            let price = parse_f64(&event.last_trade_price);
            if price == 0.0 {
                return None;
            }

            Some(Trade {
                id: format!("book-{}-{}", short_id(&event.asset_id), event.timestamp),
                market_id: event.market.clone(),
                size: BOOK_UPDATE_SIZE.to_string(),
                value_usd: 0.0,
                timestamp: parse_timestamp(&[event.timestamp.as_str()]),
                ..Trade::new(String::new(), event.asset_id.clone(), price)
            })
        })
        .collect()
}

fn trade_from_last_price(event: LastTradePriceEvent) -> Vec<Trade> {
    if event.asset_id.is_empty() {
        return Vec::new();
    }

    let now = Utc::now();
    let price = parse_f64(&event.price);
    let nanos = now.timestamp_nanos_opt().unwrap_or_default();

    vec![Trade {
        id: format!("ltp-{}-{}", short_id(&event.asset_id), nanos),
        maker_address: event.maker,
        taker_address: event.taker,
        side: Side::from_wire(&event.side),
        value_usd: compute_value_usd(&event.size, price),
        size: event.size,
        timestamp: now,
        ..Trade::new(String::new(), event.asset_id, price)
    }]
}

fn convert_trades(raw: Vec<RawTrade>) -> Vec<Trade> {
    raw.into_iter().map(convert_trade).collect()
}

fn convert_trade(raw: RawTrade) -> Trade {
    let id = trade_id(&raw);
    let price = parse_f64(&raw.price);
    let value_usd = compute_value_usd(&raw.size, price);
    let timestamp = parse_timestamp(&[raw.timestamp.as_str(), raw.match_time.as_str()]);
    let external_trade_id = non_empty(coalesce(&[&raw.trade_id, &raw.id]));

    Trade {
        id,
        market_id: raw.market,
        asset_id: raw.asset_id,
        maker_address: coalesce(&[&raw.maker_address, &raw.maker]).to_string(),
        taker_address: coalesce(&[&raw.taker_address, &raw.taker]).to_string(),
        side: Side::from_wire(&raw.side),
        outcome: Outcome::from_wire(&raw.outcome),
        size: raw.size,
        price,
        value_usd,
        timestamp,
        external_trade_id,
        transaction_hash: non_empty(&raw.transaction_hash),
    }
}

fn trade_id(raw: &RawTrade) -> String {
    if !raw.id.is_empty() {
        return raw.id.clone();
    }
    if !raw.trade_id.is_empty() {
        return raw.trade_id.clone();
    }
    format!("{}-{}-{}", raw.market, raw.maker, raw.timestamp)
}

// =============================================================================
// FIELD HELPERS
// =============================================================================

/// USD notional of a trade.
///
/// Sizes larger than 1e6 are treated as raw 6-decimal integers and rescaled.
/// The rescaled size is reported as the value directly; `_price` is accepted
/// for the side-aware complement that is not applied yet.
pub fn compute_value_usd(size: &str, _price: f64) -> f64 {
    let mut size = parse_f64(size);
    if !size.is_finite() || size <= 0.0 {
        return 0.0;
    }
    if size > RAW_USDC_THRESHOLD {
        size /= RAW_USDC_THRESHOLD;
    }
    size
}

/// Parse a decimal string, 0.0 on anything malformed.
pub fn parse_f64(raw: &str) -> f64 {
    let raw = raw.trim();
    if raw.is_empty() {
        return 0.0;
    }
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// First parseable timestamp among `candidates`, else now.
///
/// Tries RFC3339 (any precision), `YYYY-MM-DD HH:MM:SS`, then Unix time where
/// values above 1e12 are milliseconds.
pub fn parse_timestamp(candidates: &[&str]) -> DateTime<Utc> {
    candidates
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .find_map(parse_timestamp_value)
        .unwrap_or_else(Utc::now)
}

fn parse_timestamp_value(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    let ts = raw.parse::<i64>().ok()?;
    if ts > MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(ts).single()
    } else {
        Utc.timestamp_opt(ts, 0).single()
    }
}

fn coalesce<'a>(values: &[&'a String]) -> &'a str {
    values
        .iter()
        .find(|v| !v.is_empty())
        .map(|v| v.as_str())
        .unwrap_or("")
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// First 8 chars of an id, used to build synthetic trade ids.
fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

fn lenient_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Accept strings, numbers and null where the feed is inconsistent.
pub(crate) fn de_lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Null | Value::String(_) | Value::Number(_) | Value::Bool(_) => Ok(lenient_str(&v)),
        _ => Err(serde::de::Error::custom("expected a scalar")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_array_with_last_trade_price() {
        let raw = br#"[{
            "market": "0xcond",
            "asset_id": "71321045679252212594626385532706912750332728571942532289631379312455583992563",
            "timestamp": "1736000000123",
            "hash": "0xabc",
            "event_type": "book",
            "last_trade_price": "0.058",
            "bids": [{"price": "0.05", "size": "100"}],
            "asks": [{"price": "0.06", "size": "250"}]
        }]"#;

        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.kind, KIND_BOOK_ARRAY);
        assert_eq!(parsed.trades.len(), 1);

        let trade = &parsed.trades[0];
        assert_eq!(trade.price, 0.058);
        assert_eq!(trade.value_usd, 0.0);
        assert_eq!(trade.size, BOOK_UPDATE_SIZE);
        assert_eq!(trade.market_id, "0xcond");
        assert_eq!(trade.id, "book-71321045-1736000000123");
        assert_eq!(trade.timestamp.timestamp_millis(), 1_736_000_000_123);
    }

    #[test]
    fn test_book_array_skips_events_without_usable_price() {
        let raw = br#"[
            {"asset_id": "a", "event_type": "price_change", "last_trade_price": ""},
            {"asset_id": "b", "event_type": "book", "last_trade_price": "0"},
            {"asset_id": "c", "event_type": "book", "last_trade_price": "0.000"},
            {"asset_id": "d", "event_type": "book", "last_trade_price": "0.42"}
        ]"#;

        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.kind, KIND_BOOK_ARRAY);
        assert_eq!(parsed.trades.len(), 1);
        assert_eq!(parsed.trades[0].asset_id, "d");
    }

    #[test]
    fn test_single_event_is_terminal_even_without_trades() {
        let raw = br#"{"event_type": "tick_size_change", "asset_id": "a"}"#;
        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.kind, "tick_size_change");
        assert!(parsed.trades.is_empty());

        let raw = br#"{"event_type": "book", "asset_id": "abc", "last_trade_price": "0.7"}"#;
        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.kind, "book");
        assert_eq!(parsed.trades.len(), 1);
        assert_eq!(parsed.trades[0].price, 0.7);
    }

    #[test]
    fn test_last_trade_price_envelope() {
        let raw = br#"{
            "type": "last_trade_price",
            "asset_id": "123456789012",
            "price": "0.55",
            "size": "2500",
            "side": "BUY",
            "maker": "0xmaker",
            "taker": "0xtaker"
        }"#;

        let before = Utc::now();
        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.kind, KIND_LAST_TRADE_PRICE);
        assert_eq!(parsed.trades.len(), 1);

        let trade = &parsed.trades[0];
        assert!(trade.id.starts_with("ltp-12345678-"));
        assert_eq!(trade.side, Side::Buy);
        assert_eq!(trade.maker_address, "0xmaker");
        assert_eq!(trade.value_usd, 2500.0);
        assert!(trade.timestamp >= before);
    }

    #[test]
    fn test_last_trade_price_requires_asset_id() {
        let raw = br#"{"type": "last_trade_price", "price": "0.55", "size": "10"}"#;
        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.kind, KIND_LAST_TRADE_PRICE);
        assert!(parsed.trades.is_empty());
    }

    #[test]
    fn test_trade_envelope_array_payload() {
        let raw = br#"{"type": "trade", "data": [
            {"id": "t1", "market": "m", "asset_id": "a", "maker_address": "0xm",
             "size": "12000000", "price": "0.4", "side": "sell", "outcome": "No",
             "timestamp": "2025-01-04T14:32:01Z", "transaction_hash": "0xtx"},
            {"trade_id": "t2", "maker": "0xalt", "taker": "0xt", "size": "15", "price": "0.5",
             "match_time": "1736000000"}
        ]}"#;

        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.kind, KIND_TRADE);
        assert_eq!(parsed.trades.len(), 2);

        let first = &parsed.trades[0];
        assert_eq!(first.id, "t1");
        assert_eq!(first.value_usd, 12.0);
        assert_eq!(first.side, Side::Sell);
        assert_eq!(first.outcome, Outcome::No);
        assert_eq!(first.transaction_hash.as_deref(), Some("0xtx"));
        assert_eq!(first.external_trade_id.as_deref(), Some("t1"));
        assert_eq!(first.timestamp.to_rfc3339(), "2025-01-04T14:32:01+00:00");

        let second = &parsed.trades[1];
        assert_eq!(second.id, "t2");
        assert_eq!(second.maker_address, "0xalt");
        assert_eq!(second.taker_address, "0xt");
        assert_eq!(second.timestamp.timestamp(), 1_736_000_000);
        assert!(second.transaction_hash.is_none());
    }

    #[test]
    fn test_trade_envelope_embedded_and_single_payloads() {
        let embedded = br#"{"type": "trade", "data": {"trades": [{"id": "e1", "size": "5"}]}}"#;
        let parsed = parse_message(embedded).unwrap();
        assert_eq!(parsed.trades.len(), 1);
        assert_eq!(parsed.trades[0].id, "e1");

        let single = br#"{"type": "trade", "data": {"market": "m1", "maker": "0xabc",
            "timestamp": "2025-01-04 14:32:01", "price": "0.3", "size": "10"}}"#;
        let parsed = parse_message(single).unwrap();
        assert_eq!(parsed.trades.len(), 1);
        let trade = &parsed.trades[0];
        assert_eq!(trade.id, "m1-0xabc-2025-01-04 14:32:01");
        assert_eq!(trade.timestamp.to_rfc3339(), "2025-01-04T14:32:01+00:00");
        assert!(trade.external_trade_id.is_none());
    }

    #[test]
    fn test_trade_envelope_without_recognizable_payload() {
        let raw = br#"{"type": "trade", "data": {"status": "MATCHED"}}"#;
        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.kind, KIND_TRADE);
        assert!(parsed.trades.is_empty());

        let raw = br#"{"type": "trade"}"#;
        assert!(parse_message(raw).unwrap().trades.is_empty());
    }

    #[test]
    fn test_unknown_envelope_returns_discriminator() {
        let parsed = parse_message(br#"{"type": "subscribed", "data": {}}"#).unwrap();
        assert_eq!(parsed.kind, "subscribed");
        assert!(parsed.trades.is_empty());

        let parsed = parse_message(br#"{"hello": "world"}"#).unwrap();
        assert_eq!(parsed.kind, "");
        assert!(parsed.trades.is_empty());
    }

    #[test]
    fn test_invalid_payloads_are_errors() {
        assert!(parse_message(b"PONG").is_err());
        assert!(parse_message(b"42").is_err());
        assert!(parse_message(b"[]").is_err());
        assert!(parse_message(br#"[{"event_type": "other"}]"#).is_err());
        assert!(parse_message(br#"{"type": 7}"#).is_err());
    }

    #[test]
    fn test_malformed_numbers_do_not_drop_trade() {
        let raw = br#"{"type": "trade", "data": {"id": "x", "size": "abc", "price": "n/a"}}"#;
        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.trades.len(), 1);
        assert_eq!(parsed.trades[0].value_usd, 0.0);
        assert_eq!(parsed.trades[0].price, 0.0);
    }

    #[test]
    fn test_compute_value_usd_heuristic() {
        assert_eq!(compute_value_usd("2500", 0.5), 2500.0);
        assert_eq!(compute_value_usd("1000000", 0.5), 1_000_000.0);
        assert_eq!(compute_value_usd("55000000000", 0.5), 55_000.0);
        assert_eq!(compute_value_usd("", 0.5), 0.0);
        assert_eq!(compute_value_usd("-10", 0.5), 0.0);
        assert_eq!(compute_value_usd("garbage", 0.5), 0.0);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let ms = parse_timestamp(&["1736000000123"]);
        assert_eq!(ms.timestamp_millis(), 1_736_000_000_123);

        let secs = parse_timestamp(&["1736000000"]);
        assert_eq!(secs.timestamp(), 1_736_000_000);

        let nanos = parse_timestamp(&["2025-01-04T14:32:01.123456789Z"]);
        assert_eq!(nanos.timestamp_subsec_nanos(), 123_456_789);

        // Falls through unparseable candidates to the next one.
        let fallback = parse_timestamp(&["yesterday", "2025-01-04 00:00:00"]);
        assert_eq!(fallback.to_rfc3339(), "2025-01-04T00:00:00+00:00");

        let before = Utc::now();
        assert!(parse_timestamp(&["", "nope"]) >= before);
    }

    #[test]
    fn test_short_id_handles_short_ids() {
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("0123456789"), "01234567");
    }
}
