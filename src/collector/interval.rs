use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::time::{interval, interval_at, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::context::{self, AgentContext};
use crate::datapoint::{MultiDataPoint, TagSet};
use crate::dispatch::Emitter;
use crate::metadata::{Hint, Unit};

/// Appends this cycle's points to the batch. Points appended before an error
/// are still emitted.
pub type RunFn = Box<dyn FnMut(&AgentContext, &mut MultiDataPoint) -> Result<()> + Send>;
pub type InitFn = Box<dyn FnOnce() -> Result<()> + Send>;
pub type EnabledFn = Box<dyn Fn() -> bool + Send + Sync>;

const DESC_DURATION: &str = "Wall time of the collector's last run.";
const DESC_ERROR: &str = "Whether the collector's last run failed (1) or not (0).";

/// A plain "produce a batch" function driven by a ticking timer.
///
/// Interval semantics:
/// - unset: wait the agent's default interval, then run, repeatedly
/// - zero: run immediately, then wait the default interval after each run
/// - `d`: wait `d`, then run, repeatedly
///
/// `enabled` is consulted on every tick. `init` runs once, right before the
/// first run. A failing or panicking run is logged and retried on the next
/// tick.
pub struct IntervalCollector {
    name: String,
    interval: Option<Duration>,
    enabled: Option<EnabledFn>,
    init: Option<InitFn>,
    run: Option<RunFn>,
}

impl IntervalCollector {
    pub fn new<F>(name: &str, run: F) -> Self
    where
        F: FnMut(&AgentContext, &mut MultiDataPoint) -> Result<()> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            interval: None,
            enabled: None,
            init: None,
            run: Some(Box::new(run)),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_enabled<F>(mut self, enabled: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.enabled = Some(Box::new(enabled));
        self
    }

    pub fn with_init<F>(mut self, init: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.init = Some(Box::new(init));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    fn is_enabled(&self) -> bool {
        self.enabled.as_ref().map_or(true, |f| f())
    }

    fn ticker(&self, default: Duration) -> Interval {
        let mut ticker = match self.interval {
            Some(d) if d.is_zero() => interval(default),
            Some(d) => interval_at(tokio::time::Instant::now() + d, d),
            None => interval_at(tokio::time::Instant::now() + default, default),
        };
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    pub(crate) async fn run(mut self, ctx: Arc<AgentContext>, out: Emitter, cancel: CancellationToken) {
        let mut ticker = self.ticker(ctx.freq());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if !self.is_enabled() {
                debug!(collector = %self.name, "collector disabled, skipping cycle");
                continue;
            }

            let start = Instant::now();
            let (md, result) = tokio::select! {
                _ = cancel.cancelled() => return,
                collected = self.collect(&ctx) => collected,
            };
            let elapsed = start.elapsed();

            ctx.health()
                .collector_duration
                .with_label_values(&[self.name.as_str()])
                .observe(elapsed.as_secs_f64());

            let failed = match result {
                Ok(()) => false,
                Err(e) => {
                    ctx.health()
                        .collector_errors
                        .with_label_values(&[self.name.as_str()])
                        .inc();
                    error!(collector = %self.name, error = %e, emitted = md.len(), "collector run failed");
                    true
                }
            };

            if !out.emit_batch(md).await {
                return;
            }

            if ctx.collector_stats() && !out.emit_batch(self.self_stats(&ctx, elapsed, failed)).await {
                return;
            }
        }
    }

    /// Runs `init` (first time only) and `run` on the blocking pool so a slow
    /// run delays only its own cadence. A panic fails the cycle; the run
    /// function is kept for the next tick.
    async fn collect(&mut self, ctx: &Arc<AgentContext>) -> (MultiDataPoint, Result<()>) {
        let Some(mut run) = self.run.take() else {
            return (MultiDataPoint::new(), Err(anyhow!("run function unavailable")));
        };
        let init = self.init.take();
        let ctx = Arc::clone(ctx);
        let name = self.name.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let mut md = MultiDataPoint::new();
            let caught = panic::catch_unwind(AssertUnwindSafe(|| {
                if let Some(init) = init {
                    if let Err(e) = init() {
                        error!(collector = %name, error = %e, "collector init failed");
                    }
                }
                run(ctx.as_ref(), &mut md)
            }));
            let result = caught
                .unwrap_or_else(|payload| Err(anyhow!("panicked: {}", panic_message(&*payload))));
            (run, md, result)
        })
        .await;

        match joined {
            Ok((run, md, result)) => {
                self.run = Some(run);
                (md, result)
            }
            Err(e) => (MultiDataPoint::new(), Err(anyhow!("collector task failed: {e}"))),
        }
    }

    fn self_stats(&self, ctx: &AgentContext, elapsed: Duration, failed: bool) -> MultiDataPoint {
        let mut md = MultiDataPoint::new();
        let tags = TagSet::new().with("collector", self.name.as_str());
        let ts = context::now();
        ctx.add_ts(
            &mut md,
            "hostcollect.collector.duration",
            ts,
            elapsed.as_secs_f64(),
            tags.clone(),
            Hint::gauge(Unit::Second, DESC_DURATION),
        );
        ctx.add_ts(
            &mut md,
            "hostcollect.collector.error",
            ts,
            i64::from(failed),
            tags,
            Hint::gauge(Unit::None, DESC_ERROR),
        );
        md
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::dispatch::Dispatcher;
    use crate::export::health::HealthMetrics;

    fn setup() -> (Arc<AgentContext>, Dispatcher) {
        let health = Arc::new(HealthMetrics::new("").expect("health metrics"));
        let ctx = Arc::new(
            AgentContext::new("web01", Arc::clone(&health)).with_freq(Duration::from_secs(15)),
        );
        (ctx, Dispatcher::new(1024, health))
    }

    fn counter_collector(name: &str, hits: Arc<AtomicUsize>) -> IntervalCollector {
        IntervalCollector::new(name, move |ctx: &AgentContext, md: &mut MultiDataPoint| {
            let n = hits.fetch_add(1, Ordering::SeqCst);
            ctx.add(md, "test.count", n as i64, TagSet::new(), Hint::NONE);
            Ok(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_runs_immediately() {
        let (ctx, mut d) = setup();
        let mut rx = d.take_receiver().expect("receiver");
        let hits = Arc::new(AtomicUsize::new(0));
        let c = counter_collector("zero", Arc::clone(&hits)).with_interval(Duration::ZERO);
        let cancel = CancellationToken::new();
        tokio::spawn(c.run(Arc::clone(&ctx), d.emitter("zero"), cancel.clone()));

        let dp = rx.recv().await.expect("first point");
        assert_eq!(dp.metric, "test.count");
        assert_eq!(dp.tags.get("host"), Some("web01"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unset_interval_waits_default_first() {
        let (ctx, mut d) = setup();
        let mut rx = d.take_receiver().expect("receiver");
        let hits = Arc::new(AtomicUsize::new(0));
        let c = counter_collector("default", Arc::clone(&hits));
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        tokio::spawn(c.run(Arc::clone(&ctx), d.emitter("default"), cancel.clone()));

        rx.recv().await.expect("point");
        assert!(started.elapsed() >= Duration::from_secs(15));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_cycle_is_skipped_and_reevaluated() {
        let (ctx, mut d) = setup();
        let mut rx = d.take_receiver().expect("receiver");
        let hits = Arc::new(AtomicUsize::new(0));
        let enabled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&enabled);
        let c = counter_collector("toggle", Arc::clone(&hits))
            .with_interval(Duration::from_secs(1))
            .with_enabled(move || flag.load(Ordering::SeqCst));
        let cancel = CancellationToken::new();
        tokio::spawn(c.run(Arc::clone(&ctx), d.emitter("toggle"), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());

        enabled.store(true, Ordering::SeqCst);
        rx.recv().await.expect("point after enable");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_does_not_stop_next_cycle() {
        let (ctx, mut d) = setup();
        let mut rx = d.take_receiver().expect("receiver");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let c = IntervalCollector::new("flaky", move |ctx: &AgentContext, md: &mut MultiDataPoint| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("device busy");
            }
            ctx.add(md, "flaky.ok", 1, TagSet::new(), Hint::NONE);
            Ok(())
        })
        .with_interval(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        tokio::spawn(c.run(Arc::clone(&ctx), d.emitter("flaky"), cancel.clone()));

        let dp = rx.recv().await.expect("point from second cycle");
        assert_eq!(dp.metric, "flaky.ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            ctx.health()
                .collector_errors
                .with_label_values(&["flaky"])
                .get() as u64,
            1
        );
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_runs_once_before_first_run() {
        let (ctx, mut d) = setup();
        let mut rx = d.take_receiver().expect("receiver");
        let inits = Arc::new(AtomicUsize::new(0));
        let init_count = Arc::clone(&inits);
        let observed = Arc::clone(&inits);
        let c = IntervalCollector::new("init", move |ctx: &AgentContext, md: &mut MultiDataPoint| {
            let n = observed.load(Ordering::SeqCst) as i64;
            ctx.add(md, "init.seen", n, TagSet::new(), Hint::NONE);
            Ok(())
        })
        .with_interval(Duration::from_secs(1))
        .with_init(move || {
            init_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let cancel = CancellationToken::new();
        tokio::spawn(c.run(Arc::clone(&ctx), d.emitter("init"), cancel.clone()));

        for _ in 0..3 {
            let dp = rx.recv().await.expect("point");
            assert_eq!(dp.value, crate::datapoint::Value::Int(1));
        }
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_stats_emitted() {
        let health = Arc::new(HealthMetrics::new("").expect("health metrics"));
        let ctx = Arc::new(AgentContext::new("web01", Arc::clone(&health)).with_collector_stats(true));
        let mut d = Dispatcher::new(64, health);
        let mut rx = d.take_receiver().expect("receiver");
        let c = IntervalCollector::new("empty", |_ctx: &AgentContext, _md: &mut MultiDataPoint| Ok(()))
            .with_interval(Duration::ZERO);
        let cancel = CancellationToken::new();
        tokio::spawn(c.run(Arc::clone(&ctx), d.emitter("empty"), cancel.clone()));

        let duration = rx.recv().await.expect("duration point");
        let error = rx.recv().await.expect("error point");
        assert_eq!(duration.metric, "hostcollect.collector.duration");
        assert_eq!(duration.tags.get("collector"), Some("empty"));
        assert_eq!(error.metric, "hostcollect.collector.error");
        assert_eq!(error.value, crate::datapoint::Value::Int(0));
        cancel.cancel();
    }
    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_emitted_on_error() {
        let (ctx, mut d) = setup();
        let mut rx = d.take_receiver().expect("receiver");
        let c = IntervalCollector::new("partial", |ctx: &AgentContext, md: &mut MultiDataPoint| {
            ctx.add(md, "partial.ok", 1, TagSet::new(), Hint::NONE);
            anyhow::bail!("second device unreadable")
        })
        .with_interval(Duration::ZERO);
        let cancel = CancellationToken::new();
        tokio::spawn(c.run(Arc::clone(&ctx), d.emitter("partial"), cancel.clone()));

        let dp = rx.recv().await.expect("point from failing cycle");
        assert_eq!(dp.metric, "partial.ok");
        assert_eq!(
            ctx.health()
                .collector_errors
                .with_label_values(&["partial"])
                .get() as u64,
            1
        );
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_does_not_silence_collector() {
        let (ctx, mut d) = setup();
        let mut rx = d.take_receiver().expect("receiver");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let c = IntervalCollector::new("panicky", move |ctx: &AgentContext, md: &mut MultiDataPoint| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("sensor crashed");
            }
            ctx.add(md, "panicky.ok", 1, TagSet::new(), Hint::NONE);
            Ok(())
        })
        .with_interval(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        tokio::spawn(c.run(Arc::clone(&ctx), d.emitter("panicky"), cancel.clone()));

        let dp = rx.recv().await.expect("point after panic");
        assert_eq!(dp.metric, "panicky.ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            ctx.health()
                .collector_errors
                .with_label_values(&["panicky"])
                .get() as u64,
            1
        );
        cancel.cancel();
    }
}
