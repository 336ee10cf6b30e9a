//! Fan-in of every collector's output into one bounded stream.

mod stats;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::datapoint::{DataPoint, MultiDataPoint};
use crate::export::health::HealthMetrics;

pub use self::stats::DispatchStats;

/// Owns the fan-in queue. Collectors write through [`Emitter`]s; the main loop
/// reads from the receiver.
pub struct Dispatcher {
    tx: mpsc::Sender<DataPoint>,
    rx: Option<mpsc::Receiver<DataPoint>>,
    stats: Arc<DispatchStats>,
    health: Arc<HealthMetrics>,
}

impl Dispatcher {
    pub fn new(capacity: usize, health: Arc<HealthMetrics>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Some(rx),
            stats: Arc::new(DispatchStats::new()),
            health,
        }
    }

    /// Creates a producer handle for `collector`.
    pub fn emitter(&self, collector: &str) -> Emitter {
        Emitter {
            collector: Arc::from(collector),
            tx: self.tx.clone(),
            stats: Arc::clone(&self.stats),
            health: Arc::clone(&self.health),
        }
    }

    /// Hands out the consuming end. Only the first call returns `Some`.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<DataPoint>> {
        self.rx.take()
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    /// Logs and resets the per-collector tallies every `period`.
    pub fn spawn_stats_reporter(&self, period: Duration, cancel: CancellationToken) {
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = stats.snapshot();
                        let total: u64 = snapshot.iter().map(|(_, n)| n).sum();

                        if total == 0 {
                            continue;
                        }

                        info!(emitted = total, period = ?period, "dispatch stats");

                        for (collector, count) in &snapshot {
                            debug!(collector = %collector, count, "  by collector");
                        }
                    }
                }
            }
        });
    }
}

/// Producer side of the fan-in queue bound to one collector.
#[derive(Clone)]
pub struct Emitter {
    collector: Arc<str>,
    tx: mpsc::Sender<DataPoint>,
    stats: Arc<DispatchStats>,
    health: Arc<HealthMetrics>,
}

impl Emitter {
    pub fn collector(&self) -> &str {
        &self.collector
    }

    /// Cleans `dp` and queues it, waiting for space when the queue is full.
    ///
    /// Returns false once the consumer is gone. A point that fails cleaning is
    /// dropped and counted; the emitter stays usable.
    pub async fn emit(&self, mut dp: DataPoint) -> bool {
        if let Err(e) = dp.clean() {
            self.health.datapoints_rejected.inc();
            warn!(collector = %self.collector, metric = %dp.metric, error = %e, "rejected datapoint");
            return true;
        }

        if self.tx.send(dp).await.is_err() {
            return false;
        }

        self.stats.record(&self.collector);
        self.health
            .datapoints_emitted
            .with_label_values(&[self.collector.as_ref()])
            .inc();
        self.health
            .dispatch_queue_length
            .set((self.tx.max_capacity() - self.tx.capacity()) as f64);

        true
    }

    /// Queues a batch in order. Stops at the first closed-queue failure.
    pub async fn emit_batch(&self, md: MultiDataPoint) -> bool {
        for dp in md {
            if !self.emit(dp).await {
                return false;
            }
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
