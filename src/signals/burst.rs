//! Per-address sliding window trade counter for panic burst detection.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

pub struct BurstTracker {
    window: Duration,
    trades: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl BurstTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            trades: Mutex::new(HashMap::with_capacity(1024)),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a trade for `key` and return the number of trades inside the
    /// window, including this one.
    pub fn record(&self, key: &str) -> usize {
        self.record_at(key, Instant::now())
    }

    pub fn record_at(&self, key: &str, now: Instant) -> usize {
        let cutoff = now.checked_sub(self.window);
        let mut trades = self.trades.lock();
        let timestamps = trades.entry(key.to_string()).or_default();

        if let Some(cutoff) = cutoff {
            while timestamps.front().is_some_and(|t| *t <= cutoff) {
                timestamps.pop_front();
            }
        }
        timestamps.push_back(now);
        timestamps.len()
    }

    /// Drop keys whose most recent trade already fell out of the window.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return 0;
        };
        let mut trades = self.trades.lock();
        let before = trades.len();
        trades.retain(|_, timestamps| timestamps.back().is_some_and(|t| *t > cutoff));
        before - trades.len()
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.trades.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_counts_within_window() {
        let tracker = BurstTracker::new(WINDOW);
        let start = Instant::now();

        assert_eq!(tracker.record_at("0xa", start), 1);
        assert_eq!(tracker.record_at("0xa", start + Duration::from_secs(5)), 2);
        assert_eq!(tracker.record_at("0xa", start + Duration::from_secs(10)), 3);
        // Other keys are independent.
        assert_eq!(tracker.record_at("0xb", start + Duration::from_secs(10)), 1);
    }

    #[test]
    fn test_full_reset_after_window() {
        let tracker = BurstTracker::new(WINDOW);
        let start = Instant::now();

        tracker.record_at("0xa", start);
        tracker.record_at("0xa", start + Duration::from_secs(1));
        tracker.record_at("0xa", start + Duration::from_secs(2));

        let later = start + Duration::from_secs(2) + WINDOW + Duration::from_millis(1);
        assert_eq!(tracker.record_at("0xa", later), 1);
    }

    #[test]
    fn test_entry_exactly_at_cutoff_is_discarded() {
        let tracker = BurstTracker::new(WINDOW);
        let start = Instant::now();

        tracker.record_at("0xa", start);
        assert_eq!(tracker.record_at("0xa", start + WINDOW), 1);
    }

    #[test]
    fn test_partial_prune_keeps_recent_entries() {
        let tracker = BurstTracker::new(WINDOW);
        let start = Instant::now();

        tracker.record_at("0xa", start);
        tracker.record_at("0xa", start + Duration::from_secs(30));
        assert_eq!(tracker.record_at("0xa", start + Duration::from_secs(70)), 2);
    }

    #[test]
    fn test_cleanup_evicts_idle_keys() {
        let tracker = BurstTracker::new(WINDOW);
        let start = Instant::now();

        tracker.record_at("idle", start);
        tracker.record_at("active", start + Duration::from_secs(50));

        let removed = tracker.cleanup_at(start + Duration::from_secs(61));
        assert_eq!(removed, 1);
        assert_eq!(tracker.len(), 1);
        assert_eq!(
            tracker.record_at("active", start + Duration::from_secs(62)),
            2
        );
    }

    #[test]
    fn test_concurrent_records_on_distinct_keys() {
        let tracker = Arc::new(BurstTracker::new(WINDOW));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    let key = format!("0x{i}");
                    let mut last = 0;
                    for _ in 0..100 {
                        last = tracker.record(&key);
                    }
                    tracker.cleanup();
                    last
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 100);
        }
        assert_eq!(tracker.len(), 8);
    }
}
