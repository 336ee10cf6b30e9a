use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::warn;

use crate::datapoint::{self, DataPoint, MultiDataPoint, TagSet, ValidationError, Value};
use crate::export::health::HealthMetrics;
use crate::metadata::{Hint, MetaStore};

/// Interval used when a collector does not configure one.
pub const DEFAULT_FREQ: Duration = Duration::from_secs(15);

/// Reserved tag carrying the local hostname.
pub const HOST_TAG: &str = "host";

/// Shared state every collector reads while building points.
///
/// Constructed once at startup and passed by `Arc` into the dispatcher and
/// every collector task. The default tag set is swapped atomically and read
/// as an owned snapshot, so producers never hold a reference into it.
pub struct AgentContext {
    hostname: String,
    default_tags: ArcSwap<TagSet>,
    metadata: MetaStore,
    freq: Duration,
    collector_stats: bool,
    health: Arc<HealthMetrics>,
}

impl AgentContext {
    /// Creates a context for `hostname`. The name is cleaned; an unusable
    /// name falls back to `unknown`.
    pub fn new(hostname: &str, health: Arc<HealthMetrics>) -> Self {
        let hostname = datapoint::clean(hostname).unwrap_or_else(|_| "unknown".to_string());
        Self {
            hostname,
            default_tags: ArcSwap::from_pointee(TagSet::new()),
            metadata: MetaStore::new(),
            freq: DEFAULT_FREQ,
            collector_stats: false,
            health,
        }
    }

    pub fn with_default_tags(self, tags: TagSet) -> Self {
        self.default_tags.store(Arc::new(tags));
        self
    }

    pub fn with_freq(mut self, freq: Duration) -> Self {
        self.freq = freq;
        self
    }

    pub fn with_collector_stats(mut self, enabled: bool) -> Self {
        self.collector_stats = enabled;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Default collector interval.
    pub fn freq(&self) -> Duration {
        self.freq
    }

    pub fn collector_stats(&self) -> bool {
        self.collector_stats
    }

    pub fn health(&self) -> &HealthMetrics {
        &self.health
    }

    pub fn metadata(&self) -> &MetaStore {
        &self.metadata
    }

    /// Snapshot of the process-wide default tags.
    pub fn default_tags(&self) -> Arc<TagSet> {
        self.default_tags.load_full()
    }

    /// Replaces the process-wide default tags. Later reads see the new set;
    /// snapshots already taken are unaffected.
    pub fn set_default_tags(&self, tags: TagSet) {
        self.default_tags.store(Arc::new(tags));
    }

    /// Applies host injection and the default tag set to call-site tags.
    ///
    /// Call-site keys win over defaults. `host=""` removes the host tag even
    /// when the defaults carry one.
    pub fn resolve_tags(&self, mut tags: TagSet) -> TagSet {
        let suppress_host = match tags.get(HOST_TAG) {
            None => {
                tags.insert(HOST_TAG, self.hostname.as_str());
                false
            }
            Some("") => {
                tags.remove(HOST_TAG);
                true
            }
            Some(_) => false,
        };

        let mut resolved = TagSet::clone(&self.default_tags.load());
        resolved.merge(&tags);
        if suppress_host {
            resolved.remove(HOST_TAG);
        }
        resolved
    }

    /// Builds a canonical point without appending it anywhere.
    pub fn canonicalize(
        &self,
        name: &str,
        timestamp: i64,
        value: impl Into<Value>,
        tags: TagSet,
    ) -> Result<DataPoint, ValidationError> {
        let mut dp = DataPoint::new(name, timestamp, value, self.resolve_tags(tags));
        dp.clean()?;
        Ok(dp)
    }

    /// Appends a point stamped with the current time.
    pub fn add(
        &self,
        md: &mut MultiDataPoint,
        name: &str,
        value: impl Into<Value>,
        tags: TagSet,
        hint: Hint,
    ) {
        self.add_ts(md, name, now(), value, tags, hint);
    }

    /// Appends a point with an explicit timestamp.
    ///
    /// A point whose name or tags clean to nothing is not appended; the
    /// rejection is logged and counted.
    pub fn add_ts(
        &self,
        md: &mut MultiDataPoint,
        name: &str,
        timestamp: i64,
        value: impl Into<Value>,
        tags: TagSet,
        hint: Hint,
    ) {
        match self.canonicalize(name, timestamp, value, tags) {
            Ok(dp) => {
                self.metadata.record(&dp.metric, &dp.tags, hint);
                md.push(dp);
            }
            Err(e) => {
                self.health.datapoints_rejected.inc();
                warn!(metric = name, error = %e, "rejected datapoint");
            }
        }
    }
}

/// Current unix time in seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetaName, Unit};

    fn ctx() -> AgentContext {
        let health = Arc::new(HealthMetrics::new("").expect("health metrics"));
        AgentContext::new("web01", health)
    }

    #[test]
    fn test_add_injects_hostname() {
        let ctx = ctx();
        let mut md = MultiDataPoint::new();
        ctx.add(&mut md, "os.cpu", 1, TagSet::new(), Hint::NONE);
        assert_eq!(md.len(), 1);
        assert_eq!(md[0].tags.get("host"), Some("web01"));
    }

    #[test]
    fn test_add_host_opt_out() {
        let ctx = ctx();
        let mut md = MultiDataPoint::new();
        ctx.add(&mut md, "os.cpu", 1, TagSet::from([("host", "")]), Hint::NONE);
        assert_eq!(md.len(), 1);
        assert!(!md[0].tags.contains_key("host"));
    }

    #[test]
    fn test_host_opt_out_beats_default_host() {
        let ctx = ctx().with_default_tags(TagSet::from([("host", "other"), ("env", "prod")]));
        let tags = ctx.resolve_tags(TagSet::from([("host", "")]));
        assert!(!tags.contains_key("host"));
        assert_eq!(tags.get("env"), Some("prod"));
    }

    #[test]
    fn test_call_site_tags_win_over_defaults() {
        let ctx = ctx().with_default_tags(TagSet::from([("env", "prod"), ("dc", "ny")]));
        let mut md = MultiDataPoint::new();
        ctx.add(
            &mut md,
            "os.cpu",
            1,
            TagSet::from([("env", "staging")]),
            Hint::NONE,
        );
        assert_eq!(md[0].tags.get("env"), Some("staging"));
        assert_eq!(md[0].tags.get("dc"), Some("ny"));
        assert_eq!(md[0].tags.get("host"), Some("web01"));
    }

    #[test]
    fn test_explicit_host_kept() {
        let ctx = ctx();
        let tags = ctx.resolve_tags(TagSet::from([("host", "db02")]));
        assert_eq!(tags.get("host"), Some("db02"));
    }

    #[test]
    fn test_add_rejects_unclean_metric() {
        let ctx = ctx();
        let mut md = MultiDataPoint::new();
        ctx.add(&mut md, "%%%", 1, TagSet::new(), Hint::NONE);
        ctx.add(&mut md, "ok", 1, TagSet::from([("k", "***")]), Hint::NONE);
        ctx.add(&mut md, "fine", 1, TagSet::new(), Hint::NONE);
        assert_eq!(md.len(), 1);
        assert_eq!(md[0].metric, "fine");
        assert_eq!(ctx.health().datapoints_rejected.get() as u64, 2);
    }

    #[test]
    fn test_add_cleans_every_tag() {
        let ctx = ctx().with_default_tags(TagSet::from([("role", "front end")]));
        let mut md = MultiDataPoint::new();
        ctx.add_ts(
            &mut md,
            "net if bytes",
            42,
            7u64,
            TagSet::from([("iface", "eth 0")]),
            Hint::NONE,
        );
        let dp = &md[0];
        assert_eq!(dp.metric, "netifbytes");
        assert_eq!(dp.timestamp, 42);
        for (k, v) in dp.tags.iter() {
            assert!(datapoint::valid_tag(k), "bad key {k:?}");
            assert!(datapoint::valid_tag(v), "bad value {v:?}");
        }
    }

    #[test]
    fn test_add_records_metadata_once() {
        let ctx = ctx();
        let mut md = MultiDataPoint::new();
        let hint = Hint::gauge(Unit::Bytes, "resident memory");
        ctx.add(&mut md, "mem.rss", 1, TagSet::new(), hint);
        ctx.add(&mut md, "mem.rss", 2, TagSet::new(), Hint::counter(Unit::Pct, ""));
        let entries = ctx.metadata().get("mem.rss");
        let unit = entries
            .iter()
            .find(|(k, _)| k.name == MetaName::Unit)
            .map(|(_, v)| v.as_str());
        assert_eq!(unit, Some("bytes"));
    }

    #[test]
    fn test_default_tags_swap() {
        let ctx = ctx();
        let before = ctx.default_tags();
        ctx.set_default_tags(TagSet::from([("env", "prod")]));
        assert!(before.is_empty());
        assert_eq!(ctx.default_tags().get("env"), Some("prod"));
    }

    #[test]
    fn test_hostname_is_cleaned() {
        let health = Arc::new(HealthMetrics::new("").expect("health metrics"));
        assert_eq!(AgentContext::new("my host", Arc::clone(&health)).hostname(), "myhost");
        assert_eq!(AgentContext::new("", health).hostname(), "unknown");
    }
}
