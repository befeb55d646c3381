//! In-process pipeline metrics.
//!
//! Producers push into a `MetricsSink`. Nothing on this path awaits; locks
//! are held only for map updates.

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::models::{SignalType, Trade};
use crate::scrapers::ws_session::ConnectionState;

const TRADE_RATE_WINDOW: Duration = Duration::from_secs(60);
const ACTIVITY_RETENTION: Duration = Duration::from_secs(60 * 60);
const TOP_MOVERS: usize = 10;

/// Push-style sink fed by the listener, poller and workers.
pub trait MetricsSink: Send + Sync {
    fn record_trade(&self, trade: &Trade, high_value: bool);
    fn record_suspect(&self, signal: SignalType);
    fn record_queue_depth(&self, used: usize, capacity: usize);
    fn set_feed_status(&self, state: ConnectionState);
    fn record_poll(&self, at: DateTime<Utc>);
}

#[derive(Debug, Clone, Copy)]
struct PricePoint {
    price: f64,
    at: Instant,
}

#[derive(Debug, Clone)]
pub struct MarketActivity {
    pub market_id: String,
    /// Market question, when discovery supplied one
    pub question: String,
    pub trade_count: u64,
    pub volume_usd: f64,
    pub last_price: f64,
    price_points: VecDeque<PricePoint>,
    last_update: Instant,
}

impl MarketActivity {
    fn new(market_id: &str, now: Instant) -> Self {
        Self {
            market_id: market_id.to_string(),
            question: String::new(),
            trade_count: 0,
            volume_usd: 0.0,
            last_price: 0.0,
            price_points: VecDeque::with_capacity(64),
            last_update: now,
        }
    }

    /// Percent change across the retained price history
    fn price_change_pct(&self) -> Option<f64> {
        if self.price_points.len() < 2 {
            return None;
        }
        let first = self.price_points.front()?.price;
        let last = self.price_points.back()?.price;
        if first == 0.0 {
            return None;
        }
        Some((last - first) / first * 100.0)
    }
}

#[derive(Debug, Clone)]
pub struct MoverStats {
    pub market_id: String,
    pub question: String,
    pub price_change_pct: f64,
    pub volume_usd: f64,
    pub trade_count: u64,
    pub current_price: f64,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub trades_total: u64,
    pub high_value_trades: u64,
    pub signals_by_type: HashMap<SignalType, u64>,
    /// Trades per second over the last minute
    pub trade_rate: f64,
    pub active_markets: usize,
    pub top_movers: Vec<MoverStats>,
    pub uptime: Duration,
    pub feed_status: ConnectionState,
    pub last_poll: Option<DateTime<Utc>>,
    pub queue_used: usize,
    pub queue_capacity: usize,
}

#[derive(Default)]
struct ActivityState {
    markets: HashMap<String, MarketActivity>,
    recent_trades: VecDeque<Instant>,
}

pub struct MetricsTracker {
    started: Instant,
    trades_total: AtomicU64,
    high_value_trades: AtomicU64,
    signals: [AtomicU64; 4],
    queue_used: AtomicUsize,
    queue_capacity: AtomicUsize,
    feed_status: RwLock<ConnectionState>,
    last_poll: RwLock<Option<DateTime<Utc>>>,
    activity: Mutex<ActivityState>,
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            trades_total: AtomicU64::new(0),
            high_value_trades: AtomicU64::new(0),
            signals: Default::default(),
            queue_used: AtomicUsize::new(0),
            queue_capacity: AtomicUsize::new(0),
            feed_status: RwLock::new(ConnectionState::Disconnected),
            last_poll: RwLock::new(None),
            activity: Mutex::new(ActivityState::default()),
        }
    }

    pub fn trades_total(&self) -> u64 {
        self.trades_total.load(Ordering::Relaxed)
    }

    pub fn signal_count(&self, signal: SignalType) -> u64 {
        self.signals[signal.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();

        let signals_by_type = SignalType::ALL
            .iter()
            .map(|s| (*s, self.signal_count(*s)))
            .collect();

        let (trade_rate, active_markets, top_movers) = {
            let activity = self.activity.lock();

            let trade_rate = match activity.recent_trades.front() {
                Some(oldest) => {
                    let secs = now.duration_since(*oldest).as_secs_f64();
                    if secs > 0.0 {
                        activity.recent_trades.len() as f64 / secs
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };

            let mut movers: Vec<MoverStats> = activity
                .markets
                .values()
                .filter_map(|m| {
                    Some(MoverStats {
                        market_id: m.market_id.clone(),
                        question: m.question.clone(),
                        price_change_pct: m.price_change_pct()?,
                        volume_usd: m.volume_usd,
                        trade_count: m.trade_count,
                        current_price: m.last_price,
                    })
                })
                .collect();
            movers.sort_by(|a, b| {
                b.price_change_pct
                    .abs()
                    .partial_cmp(&a.price_change_pct.abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            movers.truncate(TOP_MOVERS);

            (trade_rate, activity.markets.len(), movers)
        };

        MetricsSnapshot {
            trades_total: self.trades_total(),
            high_value_trades: self.high_value_trades.load(Ordering::Relaxed),
            signals_by_type,
            trade_rate,
            active_markets,
            top_movers,
            uptime: now.duration_since(self.started),
            feed_status: *self.feed_status.read(),
            last_poll: *self.last_poll.read(),
            queue_used: self.queue_used.load(Ordering::Relaxed),
            queue_capacity: self.queue_capacity.load(Ordering::Relaxed),
        }
    }

    /// Register a discovered market by name. Counts no trade.
    pub fn seed_market(&self, market_id: &str, question: &str) {
        if market_id.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut activity = self.activity.lock();
        let market = activity
            .markets
            .entry(market_id.to_string())
            .or_insert_with(|| MarketActivity::new(market_id, now));
        if !question.is_empty() {
            market.question = question.to_string();
        }
    }

    pub fn market(&self, market_id: &str) -> Option<MarketActivity> {
        self.activity.lock().markets.get(market_id).cloned()
    }

    /// Drop markets with no trades in the last hour.
    pub fn cleanup(&self) -> usize {
        self.cleanup_idle(ACTIVITY_RETENTION)
    }

    pub fn cleanup_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut activity = self.activity.lock();
        let before = activity.markets.len();
        activity
            .markets
            .retain(|_, m| now.duration_since(m.last_update) <= max_idle);
        before - activity.markets.len()
    }
}

impl MetricsSink for MetricsTracker {
    fn record_trade(&self, trade: &Trade, high_value: bool) {
        self.trades_total.fetch_add(1, Ordering::Relaxed);
        if high_value {
            self.high_value_trades.fetch_add(1, Ordering::Relaxed);
        }

        let now = Instant::now();
        let market_id = if trade.market_id.is_empty() {
            trade.asset_id.as_str()
        } else {
            trade.market_id.as_str()
        };

        let mut activity = self.activity.lock();

        activity.recent_trades.push_back(now);
        while activity
            .recent_trades
            .front()
            .is_some_and(|t| now.duration_since(*t) > TRADE_RATE_WINDOW)
        {
            activity.recent_trades.pop_front();
        }

        let market = activity
            .markets
            .entry(market_id.to_string())
            .or_insert_with(|| MarketActivity::new(market_id, now));
        market.trade_count += 1;
        market.volume_usd += trade.value_usd;
        market.last_price = trade.price;
        market.last_update = now;
        market.price_points.push_back(PricePoint {
            price: trade.price,
            at: now,
        });
        while market
            .price_points
            .front()
            .is_some_and(|p| now.duration_since(p.at) > ACTIVITY_RETENTION)
        {
            market.price_points.pop_front();
        }
    }

    fn record_suspect(&self, signal: SignalType) {
        self.signals[signal.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn record_queue_depth(&self, used: usize, capacity: usize) {
        self.queue_used.store(used, Ordering::Relaxed);
        self.queue_capacity.store(capacity, Ordering::Relaxed);
    }

    fn set_feed_status(&self, state: ConnectionState) {
        *self.feed_status.write() = state;
    }

    fn record_poll(&self, at: DateTime<Utc>) {
        *self.last_poll.write() = Some(at);
    }
}
