//! Market channel session primitives.
//!
//! - Connection state machine shared by the listener and the metrics sink
//! - Exponential backoff with jitter

use std::time::Duration;

use rand::Rng;

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Listener connection states.
///
/// `Disconnected -> Connecting -> Subscribing -> Reading`; any failure goes to
/// `Backoff` and back to `Connecting`. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, never started
    Disconnected,
    /// WebSocket handshake in progress
    Connecting,
    /// Connected, subscription request being written
    Subscribing,
    /// Receiving market events
    Reading,
    /// Waiting before the next connection attempt
    Backoff,
    /// Stop requested
    Stopped,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Subscribing => write!(f, "SUBSCRIBING"),
            Self::Reading => write!(f, "READING"),
            Self::Backoff => write!(f, "BACKOFF"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

// =============================================================================
// EXPONENTIAL BACKOFF WITH JITTER
// =============================================================================

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            initial,
            max,
            factor: factor.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            current: initial,
        }
    }

    /// Base delay of the next wait, before jitter
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Jittered wait for this attempt; advances the base delay toward the cap.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.as_secs_f64();
        let spread = base * self.jitter;
        let offset = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        let delay = Duration::from_secs_f64((base + offset).max(0.0));

        let next = (base * self.factor).min(self.max.as_secs_f64());
        self.current = Duration::from_secs_f64(next);

        delay
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
