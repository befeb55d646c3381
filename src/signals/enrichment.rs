//! Wallet nonce enrichment hook.
//!
//! Fresh-insider detection needs the maker's transaction count. Looking it up
//! is an external call, so workers only ask when `SignalDetector::should_enrich`
//! passes, and any failure or timeout degrades to `NONCE_UNKNOWN`.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::detector::SignalDetector;
use crate::models::{Trade, NONCE_UNKNOWN};

/// Source of wallet transaction counts (e.g. an RPC `eth_getTransactionCount`).
#[async_trait]
pub trait NonceLookup: Send + Sync {
    async fn nonce(&self, address: &str) -> Result<u64>;
}

/// Upper bound on a single lookup
pub const NONCE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Nonce to pass into `detect` for `trade`.
pub async fn resolve_nonce(
    detector: &SignalDetector,
    lookup: Option<&dyn NonceLookup>,
    trade: &Trade,
    limit: Duration,
) -> i64 {
    let Some(lookup) = lookup else {
        return NONCE_UNKNOWN;
    };
    if !detector.should_enrich(trade) {
        return NONCE_UNKNOWN;
    }

    match tokio::time::timeout(limit, lookup.nonce(&trade.maker_address)).await {
        Ok(Ok(nonce)) => i64::try_from(nonce).unwrap_or(i64::MAX),
        Ok(Err(e)) => {
            debug!(maker = %trade.maker_address, error = %e, "nonce_lookup_failed");
            NONCE_UNKNOWN
        }
        Err(_) => {
            debug!(
                maker = %trade.maker_address,
                timeout_ms = limit.as_millis() as u64,
                "nonce_lookup_timed_out"
            );
            NONCE_UNKNOWN
        }
    }
}
