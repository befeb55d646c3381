//! PolyInsider engine library
//!
//! Real-time Polymarket trade ingestion and insider-signal detection.
//! The binary in `main.rs` wires these modules together; tests use them
//! directly.

pub mod config;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod scrapers;
pub mod signals;

pub use config::Config;
pub use models::{Suspect, SignalType, Trade};
pub use pipeline::{Pipeline, RunningPipeline, ShutdownReport};
