//! Out-of-band metric metadata.
//!
//! Rate, unit and description are recorded once per metric instead of being
//! attached to every point.

use std::fmt;

use dashmap::DashMap;
use serde::Serialize;

use crate::datapoint::TagSet;

/// How a metric's value evolves over time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateType {
    #[default]
    Unknown,
    Gauge,
    Counter,
    Rate,
}

impl RateType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "",
            Self::Gauge => "gauge",
            Self::Counter => "counter",
            Self::Rate => "rate",
        }
    }
}

/// Unit of a metric's value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    #[default]
    None,
    Bytes,
    Count,
    Fault,
    Files,
    Load,
    Page,
    Pct,
    Process,
    Second,
    Syscall,
}

impl Unit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Bytes => "bytes",
            Self::Count => "count",
            Self::Fault => "faults",
            Self::Files => "files",
            Self::Load => "load",
            Self::Page => "pages",
            Self::Pct => "percent",
            Self::Process => "processes",
            Self::Second => "seconds",
            Self::Syscall => "syscalls",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate, unit and description supplied alongside a point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hint {
    pub rate: RateType,
    pub unit: Unit,
    pub desc: &'static str,
}

impl Hint {
    pub const NONE: Hint = Hint::new(RateType::Unknown, Unit::None, "");

    pub const fn new(rate: RateType, unit: Unit, desc: &'static str) -> Self {
        Self { rate, unit, desc }
    }

    pub const fn gauge(unit: Unit, desc: &'static str) -> Self {
        Self::new(RateType::Gauge, unit, desc)
    }

    pub const fn counter(unit: Unit, desc: &'static str) -> Self {
        Self::new(RateType::Counter, unit, desc)
    }
}

/// Which metadata field an entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaName {
    Rate,
    Unit,
    Desc,
}

/// Key of a metadata entry. Descriptions are keyed by metric and tag set,
/// rate and unit by metric alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MetaKey {
    pub metric: String,
    /// Rendered `a=b,c=d`; empty for rate and unit.
    pub tags: String,
    pub name: MetaName,
}

/// Concurrent write-once metadata store.
#[derive(Debug, Default)]
pub struct MetaStore {
    entries: DashMap<MetaKey, String>,
}

impl MetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the non-default parts of `hint` for `metric`. Existing entries
    /// are kept.
    pub fn record(&self, metric: &str, tags: &TagSet, hint: Hint) {
        if hint.rate != RateType::Unknown {
            self.put(metric, String::new(), MetaName::Rate, hint.rate.as_str());
        }
        if hint.unit != Unit::None {
            self.put(metric, String::new(), MetaName::Unit, hint.unit.as_str());
        }
        if !hint.desc.is_empty() {
            self.put(metric, tags.tags(), MetaName::Desc, hint.desc);
        }
    }

    fn put(&self, metric: &str, tags: String, name: MetaName, value: &str) {
        let key = MetaKey {
            metric: metric.to_string(),
            tags,
            name,
        };
        self.entries.entry(key).or_insert_with(|| value.to_string());
    }

    /// Returns every entry recorded for `metric`.
    pub fn get(&self, metric: &str) -> Vec<(MetaKey, String)> {
        self.entries
            .iter()
            .filter(|e| e.key().metric == metric)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
