//! Time-series data point model and the canonical character set.
//!
//! Every point leaving the agent has a metric name and tag set made only of
//! letters, decimal digits, `-`, `_`, `.` and `/`, and a value that is either a signed
//! 64-bit integer or a finite 64-bit float.

pub mod tags;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

pub use self::tags::{clean, must_replace, parse_tags, replace, replace_tags, valid_tag, TagSet};

/// Errors raised while canonicalizing a metric name, tag or value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("clean result is empty")]
    Empty,

    #[error("cleaning metric {metric:?}: clean result is empty")]
    Metric { metric: String },

    #[error("cleaning tag key {key:?}: clean result is empty")]
    TagKey { key: String },

    #[error("cleaning value {value:?} of tag {key:?}: clean result is empty")]
    TagValue { key: String, value: String },

    #[error("bad tag: {0}")]
    BadTag(String),

    #[error("invalid character in {0}")]
    InvalidCharacter(String),

    #[error("duplicated tag: {0}")]
    DuplicateTag(String),

    #[error("unparseable number {0:?}")]
    Unparseable(String),

    #[error("metric {metric:?} has non-finite value {value}")]
    NonFinite { metric: String, value: f64 },
}

/// A numeric sample value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn is_finite(self) -> bool {
        match self {
            Self::Int(_) => true,
            Self::Float(f) => f.is_finite(),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

impl FromStr for Value {
    type Err = ValidationError;

    /// Integer first, then float. `NaN` and infinities are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(i) = s.parse::<i64>() {
            return Ok(Self::Int(i));
        }
        match s.parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(Self::Float(f)),
            _ => Err(ValidationError::Unparseable(s.to_string())),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u64> for Value {
    /// Values above `i64::MAX` are promoted to float.
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => Self::Int(i),
            Err(_) => Self::Float(v as f64),
        }
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Self::from(v as u64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

/// One timestamped measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    pub metric: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub value: Value,
    pub tags: TagSet,
}

/// A batch of points produced by one collector invocation.
pub type MultiDataPoint = Vec<DataPoint>;

impl DataPoint {
    pub fn new(metric: impl Into<String>, timestamp: i64, value: impl Into<Value>, tags: TagSet) -> Self {
        Self {
            metric: metric.into(),
            timestamp,
            value: value.into(),
            tags,
        }
    }

    /// Rewrites the metric name and every tag into the accepted character set.
    ///
    /// On error the point must be dropped; it is left partially unchanged.
    pub fn clean(&mut self) -> Result<(), ValidationError> {
        if !self.value.is_finite() {
            return Err(ValidationError::NonFinite {
                metric: self.metric.clone(),
                value: self.value.as_f64(),
            });
        }
        self.tags.clean()?;
        let metric = clean(&self.metric).map_err(|_| ValidationError::Metric {
            metric: self.metric.clone(),
        })?;
        if metric != self.metric {
            self.metric = metric;
        }
        Ok(())
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.metric, self.timestamp, self.value, self.tags
        )
    }
}
