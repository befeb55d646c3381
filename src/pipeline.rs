//! Ingestion → detection pipeline.
//!
//! Tasks talk only through the two bounded queues and the shutdown signal:
//!
//! ```text
//! Listener ─┐                        ┌─> worker ─┐
//!           ├─> trade queue (drop) ──┼─> worker ─┼─> suspect queue (drop) ─> consumer
//! Poller  ──┘                        └─> worker ─┘
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::{
    sync::{mpsc, watch, Mutex as AsyncMutex},
    task::JoinHandle,
    time::{interval, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics::{MetricsSink, MetricsTracker};
use crate::models::{Suspect, Trade};
use crate::queue::{self, QueueSender};
use crate::scrapers::{Listener, TradesPoller};
use crate::signals::{
    enrichment::{resolve_nonce, NONCE_LOOKUP_TIMEOUT},
    NonceLookup, SignalDetector,
};

type SharedReceiver<T> = Arc<AsyncMutex<mpsc::Receiver<T>>>;

/// Pipeline builder. `start` spawns everything.
pub struct Pipeline {
    config: Config,
    asset_ids: Vec<String>,
    detector: Arc<SignalDetector>,
    metrics: Arc<MetricsTracker>,
    nonce_lookup: Option<Arc<dyn NonceLookup>>,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        let detector = Arc::new(SignalDetector::new(config.detector_config()));
        Self {
            config,
            asset_ids: Vec::new(),
            detector,
            metrics: Arc::new(MetricsTracker::new()),
            nonce_lookup: None,
        }
    }

    /// Instruments the listener subscribes to
    pub fn with_asset_ids(mut self, asset_ids: Vec<String>) -> Self {
        self.asset_ids = asset_ids;
        self
    }

    pub fn with_nonce_lookup(mut self, lookup: Arc<dyn NonceLookup>) -> Self {
        self.nonce_lookup = Some(lookup);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsTracker>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn start(self) -> Result<RunningPipeline> {
        let config = self.config;
        let (shutdown_tx, _) = watch::channel(false);

        let (trade_tx, trade_rx) = queue::bounded::<Trade>("trades", config.trade_queue_capacity);
        let (suspect_tx, suspect_rx) =
            queue::bounded::<Suspect>("suspects", config.suspect_queue_capacity);
        let trade_rx: SharedReceiver<Trade> = Arc::new(AsyncMutex::new(trade_rx));

        let mut tasks = Vec::with_capacity(config.worker_count + 2);

        let listener = Listener::new(config.listener_config(), trade_tx.clone());
        listener.set_asset_ids(self.asset_ids);
        listener.set_metrics(self.metrics.clone());
        listener.start();

        if config.poller_enabled() {
            let poller = TradesPoller::new(
                &config.polymarket_rest_url,
                config.trade_poll_interval,
                trade_tx.clone(),
            )?
            .with_metrics(self.metrics.clone());
            tasks.push(tokio::spawn(poller.run(shutdown_tx.subscribe())));
        } else {
            info!("trades poller disabled");
        }

        let ctx = Arc::new(WorkerContext {
            detector: self.detector.clone(),
            metrics: self.metrics.clone(),
            nonce_lookup: self.nonce_lookup,
            trades: trade_tx.clone(),
            suspects: suspect_tx.clone(),
            min_value_usd: config.min_value_usd,
            nonce_timeout: NONCE_LOOKUP_TIMEOUT,
        });
        for id in 0..config.worker_count {
            tasks.push(tokio::spawn(worker(
                id,
                ctx.clone(),
                trade_rx.clone(),
                shutdown_tx.subscribe(),
            )));
        }

        tasks.push(tokio::spawn(cleanup_loop(
            self.detector.clone(),
            self.metrics.clone(),
            config.cleanup_interval,
            shutdown_tx.subscribe(),
        )));

        info!(
            workers = config.worker_count,
            trade_queue = config.trade_queue_capacity,
            suspect_queue = config.suspect_queue_capacity,
            "✅ Pipeline started"
        );

        Ok(RunningPipeline {
            shutdown_tx,
            listener,
            trade_tx,
            trade_rx,
            suspect_tx,
            suspect_rx: Some(suspect_rx),
            tasks,
            detector: self.detector,
            metrics: self.metrics,
            drain_timeout: config.drain_timeout,
        })
    }
}

/// Counters reported once shutdown completes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Trades discarded from the queue during the grace period
    pub drained: usize,
    pub trades_dropped: u64,
    pub suspects_dropped: u64,
}

pub struct RunningPipeline {
    shutdown_tx: watch::Sender<bool>,
    listener: Listener,
    trade_tx: QueueSender<Trade>,
    trade_rx: SharedReceiver<Trade>,
    suspect_tx: QueueSender<Suspect>,
    suspect_rx: Option<mpsc::Receiver<Suspect>>,
    tasks: Vec<JoinHandle<()>>,
    detector: Arc<SignalDetector>,
    metrics: Arc<MetricsTracker>,
    drain_timeout: Duration,
}

impl RunningPipeline {
    /// Hand the suspect queue to its consumer. Only the first call gets it.
    pub fn take_suspects(&mut self) -> Option<mpsc::Receiver<Suspect>> {
        self.suspect_rx.take()
    }

    /// Producer handle for the trade queue, for additional ingestion sources.
    pub fn trade_sender(&self) -> QueueSender<Trade> {
        self.trade_tx.clone()
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn detector(&self) -> Arc<SignalDetector> {
        self.detector.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsTracker> {
        self.metrics.clone()
    }

    /// Stop workers, stop the listener, then discard whatever is still queued
    /// within the drain grace period.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!("🛑 Shutting down pipeline");
        self.shutdown_tx.send_replace(true);
        self.listener.stop().await;

        for handle in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "pipeline task panicked");
            }
        }

        let drained = drain_queue(&self.trade_rx, self.drain_timeout).await;

        let report = ShutdownReport {
            drained,
            trades_dropped: self.trade_tx.dropped(),
            suspects_dropped: self.suspect_tx.dropped(),
        };
        info!(
            drained = report.drained,
            trades_dropped = report.trades_dropped,
            suspects_dropped = report.suspects_dropped,
            "pipeline stopped"
        );
        report
    }
}

struct WorkerContext {
    detector: Arc<SignalDetector>,
    metrics: Arc<MetricsTracker>,
    nonce_lookup: Option<Arc<dyn NonceLookup>>,
    trades: QueueSender<Trade>,
    suspects: QueueSender<Suspect>,
    min_value_usd: f64,
    nonce_timeout: Duration,
}

impl WorkerContext {
    async fn process(&self, trade: Trade) {
        self.metrics
            .record_trade(&trade, trade.value_usd >= self.min_value_usd);
        self.metrics
            .record_queue_depth(self.trades.len(), self.trades.capacity());

        let nonce = resolve_nonce(
            &self.detector,
            self.nonce_lookup.as_deref(),
            &trade,
            self.nonce_timeout,
        )
        .await;

        for suspect in self.detector.detect(&trade, nonce) {
            let signal = suspect.signal_type;
            self.metrics.record_suspect(signal);
            if self.suspects.offer(suspect) {
                debug!(
                    signal = %signal,
                    market = %trade.market_id,
                    value_usd = trade.value_usd,
                    "signal_detected"
                );
            }
        }
    }
}

async fn worker(
    id: usize,
    ctx: Arc<WorkerContext>,
    trades: SharedReceiver<Trade>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker = id, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let trade = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            trade = async { trades.lock().await.recv().await } => trade,
        };

        // Queue closed: every producer is gone.
        let Some(trade) = trade else {
            break;
        };

        // A trade still in flight at shutdown is abandoned.
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ctx.process(trade) => {}
        }
    }

    debug!(worker = id, "worker stopped");
}

async fn cleanup_loop(
    detector: Arc<SignalDetector>,
    metrics: Arc<MetricsTracker>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                detector.cleanup();
                let markets_removed = metrics.cleanup();
                debug!(
                    markets_removed,
                    tracked_assets = detector.tracked_assets(),
                    tracked_addresses = detector.tracked_addresses(),
                    "🧹 periodic cleanup"
                );
            }
        }
    }
}

/// Discard queued trades until the queue is empty or `grace` runs out.
async fn drain_queue(trades: &AsyncMutex<mpsc::Receiver<Trade>>, grace: Duration) -> usize {
    let deadline = Instant::now() + grace;

    let Ok(mut rx) = tokio::time::timeout_at(deadline, trades.lock()).await else {
        warn!("trade queue still held at drain deadline; skipping drain");
        return 0;
    };

    let mut drained = 0;
    while rx.try_recv().is_ok() {
        drained += 1;
        if Instant::now() >= deadline {
            warn!(drained, "drain deadline reached; discarding remaining trades");
            break;
        }
    }

    if drained > 0 {
        info!(count = drained, "trades_drained");
    }
    drained
}
