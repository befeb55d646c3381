pub mod burst;
pub mod detector;
pub mod enrichment;

pub use burst::BurstTracker;
pub use detector::{DetectorConfig, SignalDetector};
pub use enrichment::NonceLookup;
