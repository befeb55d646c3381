//! Polymarket CLOB WebSocket (market channel) listener.
//!
//! - One connection to the market channel, subscribed to a fixed asset set
//! - Every frame goes through the event parser; trades are offered to the
//!   bounded trade queue and dropped when it is full
//! - Reconnects with exponential backoff and jitter
//! - A heartbeat monitor pings idle connections and kills dead ones
//!
//! `stop()` tears the connection down and joins both background tasks.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::{
    net::TcpStream,
    sync::{watch, Notify},
    task::JoinHandle,
    time::{interval, sleep, timeout, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, protocol::WebSocketConfig, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use super::parser::parse_message;
use super::ws_session::{Backoff, ConnectionState};
use crate::metrics::MetricsSink;
use crate::models::Trade;
use crate::queue::QueueSender;

const POLYMARKET_ORIGIN: &str = "https://polymarket.com";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Base WebSocket URL; `/market` is appended unless already present
    pub url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    pub jitter: f64,
    pub handshake_timeout: Duration,
    /// Idle time after which the heartbeat monitor sends a ping
    pub heartbeat_timeout: Duration,
    pub pong_timeout: Duration,
    pub write_timeout: Duration,
    /// How often the heartbeat monitor wakes up
    pub heartbeat_interval: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            url: crate::config::DEFAULT_WS_URL.to_string(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: 0.2,
            handshake_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl ListenerConfig {
    /// Read deadline for a single frame
    pub fn read_deadline(&self) -> Duration {
        self.heartbeat_timeout + self.pong_timeout
    }
}

/// Market channel subscription message
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub assets_ids: Vec<String>,
}

impl SubscriptionRequest {
    pub fn market(assets_ids: Vec<String>) -> Self {
        Self {
            msg_type: "market",
            assets_ids,
        }
    }
}

/// Resolve the market channel endpoint from a base URL.
pub fn market_channel_url(base: &str) -> String {
    if base.ends_with("/market") || base.ends_with("/user") {
        return base.to_string();
    }
    format!("{}/market", base.trim_end_matches('/'))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub messages_received: u64,
    pub trades_dispatched: u64,
    pub trades_dropped: u64,
    pub parse_errors: u64,
    pub connections: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct ListenerCounters {
    messages_received: AtomicU64,
    trades_dispatched: AtomicU64,
    trades_dropped: AtomicU64,
    parse_errors: AtomicU64,
    connections: AtomicU64,
    reconnects: AtomicU64,
}

impl ListenerCounters {
    fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            trades_dispatched: self.trades_dispatched.load(Ordering::Relaxed),
            trades_dropped: self.trades_dropped.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Write half of the live connection plus its kill switch.
struct Connection {
    sink: WsSink,
    kill: Arc<Notify>,
}

struct ListenerInner {
    config: ListenerConfig,
    trades: QueueSender<Trade>,
    asset_ids: RwLock<Vec<String>>,
    state: RwLock<ConnectionState>,
    connection: tokio::sync::Mutex<Option<Connection>>,
    last_message: Mutex<Option<Instant>>,
    counters: ListenerCounters,
    metrics: RwLock<Option<Arc<dyn MetricsSink>>>,
    stop_tx: watch::Sender<bool>,
}

pub struct Listener {
    inner: Arc<ListenerInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Listener {
    pub fn new(config: ListenerConfig, trades: QueueSender<Trade>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ListenerInner {
                config,
                trades,
                asset_ids: RwLock::new(Vec::new()),
                state: RwLock::new(ConnectionState::Disconnected),
                connection: tokio::sync::Mutex::new(None),
                last_message: Mutex::new(None),
                counters: ListenerCounters::default(),
                metrics: RwLock::new(None),
                stop_tx,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Replace the subscription set. Takes effect on the next (re)connect.
    pub fn set_asset_ids(&self, asset_ids: Vec<String>) {
        *self.inner.asset_ids.write() = asset_ids;
    }

    pub fn asset_ids(&self) -> Vec<String> {
        self.inner.asset_ids.read().clone()
    }

    /// Mirror state transitions into a metrics sink.
    pub fn set_metrics(&self, sink: Arc<dyn MetricsSink>) {
        sink.set_feed_status(self.state());
        *self.inner.metrics.write() = Some(sink);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn stats(&self) -> ListenerStats {
        self.inner.counters.snapshot()
    }

    /// Spawn the read loop and heartbeat monitor.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("listener already started");
            return;
        }
        if *self.inner.stop_tx.borrow() {
            warn!("listener was stopped; not restarting");
            return;
        }

        info!(
            assets = self.inner.asset_ids.read().len(),
            "🚀 Starting Polymarket market listener"
        );

        let run_rx = self.inner.stop_tx.subscribe();
        let heartbeat_rx = self.inner.stop_tx.subscribe();
        tasks.push(tokio::spawn(self.inner.clone().run_loop(run_rx)));
        tasks.push(tokio::spawn(
            self.inner.clone().heartbeat_monitor(heartbeat_rx),
        ));
    }

    /// Signal stop, close the connection and wait for both tasks to exit.
    pub async fn stop(&self) {
        self.inner.stop_tx.send_replace(true);
        self.inner.release_connection().await;

        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "listener task panicked");
            }
        }

        self.inner.set_state(ConnectionState::Stopped);
        info!("🛑 Polymarket market listener stopped");
    }
}

impl ListenerInner {
    fn set_state(&self, next: ConnectionState) {
        let prev = {
            let mut state = self.state.write();
            if state.is_terminal() {
                return;
            }
            std::mem::replace(&mut *state, next)
        };
        if prev != next {
            debug!(from = %prev, to = %next, "listener_state");
        }
        if let Some(sink) = self.metrics.read().as_ref() {
            sink.set_feed_status(next);
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.read()
    }

    async fn run_loop(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(
            self.config.initial_backoff,
            self.config.max_backoff,
            self.config.backoff_factor,
            self.config.jitter,
        );

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            let outcome = tokio::select! {
                _ = stop_rx.changed() => None,
                result = self.session(&mut backoff) => Some(result),
            };
            self.release_connection().await;

            let Some(result) = outcome else {
                break;
            };

            let delay = backoff.next_delay();
            self.set_state(ConnectionState::Backoff);
            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            match result {
                Ok(()) => info!(
                    backoff_ms = delay.as_millis() as u64,
                    "Polymarket market WS closed by server; reconnecting"
                ),
                Err(e) => warn!(
                    error = %e,
                    backoff_ms = delay.as_millis() as u64,
                    "Polymarket market WS disconnected; reconnecting"
                ),
            }

            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Stopped);
        debug!("listener read loop exited");
    }

    /// One connection lifetime: connect, subscribe, read until failure.
    async fn session(&self, backoff: &mut Backoff) -> Result<()> {
        self.set_state(ConnectionState::Connecting);

        let url = market_channel_url(&self.config.url);
        info!(url = %url, "🔌 Connecting to Polymarket market WS");

        let mut request = url
            .as_str()
            .into_client_request()
            .context("Failed to build websocket request")?;
        if let Ok(origin) = POLYMARKET_ORIGIN.parse() {
            request.headers_mut().insert("Origin", origin);
        }

        let ws_config = WebSocketConfig {
            max_message_size: Some(16 * 1024 * 1024),
            max_frame_size: Some(4 * 1024 * 1024),
            ..Default::default()
        };

        let (ws_stream, response) = timeout(
            self.config.handshake_timeout,
            connect_async_with_config(request, Some(ws_config), false),
        )
        .await
        .context("websocket handshake timed out")?
        .context("Failed to connect to WebSocket")?;

        info!(
            "✅ Polymarket market WS connected (status={})",
            response.status()
        );
        backoff.reset();
        self.counters.connections.fetch_add(1, Ordering::Relaxed);

        let (sink, mut stream) = ws_stream.split();
        let kill = Arc::new(Notify::new());
        *self.connection.lock().await = Some(Connection {
            sink,
            kill: kill.clone(),
        });
        *self.last_message.lock() = Some(Instant::now());

        self.set_state(ConnectionState::Subscribing);
        let request = SubscriptionRequest::market(self.asset_ids.read().clone());
        let payload =
            serde_json::to_string(&request).context("serialize subscription request")?;
        self.send(Message::Text(payload))
            .await
            .context("send market subscription")?;
        info!(
            assets = request.assets_ids.len(),
            "📡 Subscribed to market channel"
        );

        self.set_state(ConnectionState::Reading);
        let read_deadline = self.config.read_deadline();

        loop {
            let frame = tokio::select! {
                _ = kill.notified() => bail!("connection closed by heartbeat monitor"),
                frame = timeout(read_deadline, stream.next()) => frame,
            };

            let msg = match frame {
                Err(_) => bail!("no frame within {:?}", read_deadline),
                Ok(None) => bail!("market ws stream ended"),
                Ok(Some(Err(e))) => return Err(e).context("market ws read failed"),
                Ok(Some(Ok(msg))) => msg,
            };

            *self.last_message.lock() = Some(Instant::now());

            match msg {
                Message::Text(text) => self.handle_payload(text.as_bytes()),
                Message::Binary(bytes) => self.handle_payload(&bytes),
                Message::Ping(payload) => {
                    self.send(Message::Pong(payload))
                        .await
                        .context("reply to ping")?;
                }
                Message::Close(frame) => {
                    debug!(?frame, "market ws close");
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    fn handle_payload(&self, raw: &[u8]) {
        self.counters
            .messages_received
            .fetch_add(1, Ordering::Relaxed);

        let parsed = match parse_message(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, len = raw.len(), "unparsed market message");
                return;
            }
        };

        for trade in parsed.trades {
            if self.trades.offer(trade) {
                self.counters
                    .trades_dispatched
                    .fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.trades_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn send(&self, msg: Message) -> Result<()> {
        let mut guard = self.connection.lock().await;
        let conn = guard.as_mut().context("not connected")?;
        timeout(self.config.write_timeout, conn.sink.send(msg))
            .await
            .context("websocket write timed out")?
            .context("websocket write failed")?;
        Ok(())
    }

    /// Drop the current connection, waking its read loop.
    async fn release_connection(&self) {
        let conn = self.connection.lock().await.take();
        if let Some(mut conn) = conn {
            conn.kill.notify_one();
            let _ = timeout(self.config.write_timeout, conn.sink.close()).await;
        }
    }

    async fn heartbeat_monitor(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {}
            }
            if *stop_rx.borrow() {
                break;
            }
            if self.current_state() != ConnectionState::Reading {
                continue;
            }

            let idle = match *self.last_message.lock() {
                Some(seen) => seen.elapsed(),
                None => continue,
            };
            if idle <= self.config.heartbeat_timeout {
                continue;
            }

            debug!(idle_ms = idle.as_millis() as u64, "heartbeat ping");
            if let Err(e) = self.send(Message::Ping(Vec::new())).await {
                warn!(error = %e, "heartbeat ping failed; closing connection");
                self.release_connection().await;
            }
        }

        debug!("heartbeat monitor exited");
    }
}
