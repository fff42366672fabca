use chrono::{DateTime, Utc};
use thiserror::Error;

use super::sample::Window;

/// Invalid bucketing geometry.
#[derive(Debug, Error, PartialEq)]
pub enum WindowError {
    #[error("window end {end} is not after start {start}")]
    Empty {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("bucket width must be positive")]
    ZeroWidth,
}

/// The upstream query failed to supply samples.
#[derive(Debug, Error)]
#[error("collecting samples from {source_name}: {message}")]
pub struct CollectionError {
    pub source_name: String,
    pub message: String,
}

impl CollectionError {
    pub fn new(source_name: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self {
            source_name: source_name.into(),
            message: format!("{err:#}"),
        }
    }
}

/// The estimation prefix cannot produce any tolerance.
///
/// Non-fatal: the pipeline continues with an empty map and every label
/// falls back to emit-everything.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InsufficientSampleError {
    #[error("estimation prefix is empty")]
    EmptyPrefix,
    #[error("no positive values for any of {labels} discovered labels")]
    NoPositiveValues { labels: usize },
}

/// A label has no tolerance; its values are all treated as significant.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("no tolerance for label {label:?}")]
pub struct UnknownLabelTolerance {
    pub label: String,
}

/// Persisting emitted records failed.
#[derive(Debug, Error)]
#[error("writing to {sink}: {message}")]
pub struct SinkError {
    pub sink: String,
    pub message: String,
}

impl SinkError {
    pub fn new(sink: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self {
            sink: sink.into(),
            message: format!("{err:#}"),
        }
    }
}

/// Fatal outcome of one table's run, with table/window context attached.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("table {table} window {window}: {source}")]
    Collection {
        table: String,
        window: Window,
        #[source]
        source: CollectionError,
    },
    #[error("table {table} window {window}: {source}")]
    Sink {
        table: String,
        window: Window,
        #[source]
        source: SinkError,
    },
    #[error("table {table}: {source}")]
    Window {
        table: String,
        #[source]
        source: WindowError,
    },
    #[error("table {table} window {window}: cancelled before commit")]
    Cancelled { table: String, window: Window },
    #[error("table {table} window {window}: reduction task failed: {message}")]
    Task {
        table: String,
        window: Window,
        message: String,
    },
}

impl PipelineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Collection { .. } => "collection",
            Self::Sink { .. } => "sink",
            Self::Window { .. } => "window",
            Self::Cancelled { .. } => "cancelled",
            Self::Task { .. } => "task",
        }
    }
}
