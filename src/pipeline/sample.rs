use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::error::WindowError;

/// A single reading, or the explicit lack of one.
///
/// Raw samples use `Absent` for "no reading at this instant"; bucketed
/// samples use it as the gap marker for an empty bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Present(f64),
    Absent,
}

impl Reading {
    /// Returns the value if present.
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Present(v) => Some(v),
            Self::Absent => None,
        }
    }
}

impl From<Option<f64>> for Reading {
    fn from(v: Option<f64>) -> Self {
        match v {
            Some(v) => Self::Present(v),
            None => Self::Absent,
        }
    }
}

/// Identity of a series: all samples sharing node, source and label.
///
/// Ordering is (node_id, source, label), which is also the tie-break order
/// of bucketized output within one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub node_id: Arc<str>,
    pub source: Arc<str>,
    pub label: Arc<str>,
}

impl SeriesKey {
    pub fn new(node_id: &str, source: &str, label: &str) -> Self {
        Self {
            node_id: Arc::from(node_id),
            source: Arc::from(source),
            label: Arc::from(label),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node_id, self.source, self.label)
    }
}

/// A raw telemetry sample as handed over by the collection step.
#[derive(Debug, Clone)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub series: SeriesKey,
    pub reading: Reading,
}

/// The aggregate of one series over one bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketedSample {
    /// Always an exact multiple of the bucket width.
    pub bucket_start: DateTime<Utc>,
    pub series: SeriesKey,
    pub reading: Reading,
}

/// A deduplicated record ready for the sink. The value is never absent.
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedRecord {
    pub time: DateTime<Utc>,
    pub series: SeriesKey,
    pub value: f64,
}

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, WindowError> {
        if end <= start {
            return Err(WindowError::Empty { start, end });
        }
        Ok(Self { start, end })
    }

    /// Returns true if `t` falls inside the window.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    pub fn duration(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or(Duration::ZERO)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%Y-%m-%dT%H:%M:%SZ"),
            self.end.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// Floors epoch milliseconds to a multiple of `width_ms`.
///
/// Uses Euclidean division so timestamps before the epoch still floor
/// towards negative infinity.
pub fn align_down_ms(ts_ms: i64, width_ms: i64) -> i64 {
    ts_ms.div_euclid(width_ms) * width_ms
}

/// Converts epoch milliseconds to a UTC datetime.
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
