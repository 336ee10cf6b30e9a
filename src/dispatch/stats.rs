use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Lock-free per-collector emission counters.
///
/// `snapshot()` reads and resets every counter, for periodic reporting.
#[derive(Debug, Default)]
pub struct DispatchStats {
    counts: DashMap<String, AtomicU64>,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter for `collector` by one.
    pub fn record(&self, collector: &str) {
        self.record_n(collector, 1);
    }

    pub fn record_n(&self, collector: &str, n: u64) {
        if let Some(counter) = self.counts.get(collector) {
            counter.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counts
            .entry(collector.to_string())
            .or_default()
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Read and reset all counters, returning non-zero entries sorted by name.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut result: Vec<(String, u64)> = self
            .counts
            .iter()
            .filter_map(|entry| {
                let v = entry.value().swap(0, Ordering::Relaxed);
                (v > 0).then(|| (entry.key().clone(), v))
            })
            .collect();
        result.sort_unstable();
        result
    }
}
