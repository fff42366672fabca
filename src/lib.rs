//! Bucketing and adaptive deduplication of cluster hardware telemetry.
//!
//! Raw samples are grouped into fixed-width time buckets per series, a
//! per-label noise tolerance is estimated from a bounded prefix, and only
//! values that move beyond that tolerance are persisted.

pub mod clock;
pub mod config;
pub mod export;
pub mod pipeline;
pub mod runner;
pub mod sink;
pub mod source;
