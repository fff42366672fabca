//! Bucketing, tolerance estimation and deduplication of raw telemetry.
//!
//! The three stages run sequentially on one thread per table. Each run owns
//! a [`RunContext`] that is threaded through the stages and turned into the
//! [`RunSummary`] reported to the caller.

pub mod bucket;
pub mod dedup;
pub mod error;
pub mod sample;
pub mod tolerance;

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use self::bucket::{Bucketized, Bucketizer};
use self::dedup::{DedupStats, Deduplicator, Grouping, LabelOnly, PerSeries};
use self::error::WindowError;
use self::sample::{BucketedSample, EmittedRecord, Sample, Window};
use self::tolerance::{LabelDiscovery, ToleranceEstimator, ToleranceMap};

/// Which samples share a dedup baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingMode {
    /// One baseline per label across all nodes and sources.
    #[default]
    LabelOnly,
    /// One baseline per (node, source, label) series.
    PerSeries,
}

impl GroupingMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LabelOnly => "label_only",
            Self::PerSeries => "per_series",
        }
    }
}

/// Parameters of the reduction core.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub bucket_width: Duration,
    pub estimation_prefix_size: usize,
    pub label_discovery: LabelDiscovery,
    pub grouping: GroupingMode,
}

/// Per-run summary handed back to the orchestrator.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub table: String,
    pub window: Window,
    pub raw_samples: usize,
    pub out_of_window: usize,
    pub series: usize,
    pub tolerances: usize,
    pub undetermined_labels: usize,
    /// Estimation failed entirely; every label was emitted unfiltered.
    pub degraded: bool,
    pub dedup: DedupStats,
}

impl RunSummary {
    pub(crate) fn new(table: String, window: Window) -> Self {
        Self {
            table,
            window,
            raw_samples: 0,
            out_of_window: 0,
            series: 0,
            tolerances: 0,
            undetermined_labels: 0,
            degraded: false,
            dedup: DedupStats::default(),
        }
    }

    pub fn input_count(&self) -> usize {
        self.dedup.input_count
    }

    pub fn output_count(&self) -> usize {
        self.dedup.output_count
    }

    pub fn reduction_ratio(&self) -> f64 {
        self.dedup.reduction_ratio()
    }

    pub fn labels_without_tolerance(&self) -> usize {
        self.dedup.labels_without_tolerance
    }
}

/// Exclusively-owned state of one table's run.
#[derive(Debug)]
pub struct RunContext {
    summary: RunSummary,
}

impl RunContext {
    pub fn new(table: impl Into<String>, window: Window) -> Self {
        Self {
            summary: RunSummary::new(table.into(), window),
        }
    }

    pub fn table(&self) -> &str {
        &self.summary.table
    }

    pub fn window(&self) -> Window {
        self.summary.window
    }
}

/// Output of a completed run.
#[derive(Debug)]
pub struct RunOutput {
    pub records: Vec<EmittedRecord>,
    pub summary: RunSummary,
}

/// The synchronous reduction core: bucketize, estimate, deduplicate.
#[derive(Debug, Clone, Copy)]
pub struct Pipeline {
    bucketizer: Bucketizer,
    estimator: ToleranceEstimator,
    grouping: GroupingMode,
}

impl Pipeline {
    pub fn new(settings: Settings) -> Result<Self, WindowError> {
        Ok(Self {
            bucketizer: Bucketizer::new(settings.bucket_width)?,
            estimator: ToleranceEstimator::new(
                settings.estimation_prefix_size,
                settings.label_discovery,
            ),
            grouping: settings.grouping,
        })
    }

    /// Runs all three stages over one table's raw samples.
    pub fn run(&self, mut ctx: RunContext, samples: Vec<Sample>) -> RunOutput {
        let bucketized = self.bucketize(&mut ctx, samples);
        let tolerances = self.estimate(&mut ctx, &bucketized);
        let records = match self.grouping {
            GroupingMode::LabelOnly => Self::dedup(&mut ctx, LabelOnly, bucketized, &tolerances),
            GroupingMode::PerSeries => Self::dedup(&mut ctx, PerSeries, bucketized, &tolerances),
        };

        let summary = ctx.summary;
        info!(
            table = %summary.table,
            window = %summary.window,
            input_count = summary.input_count(),
            output_count = summary.output_count(),
            reduction_ratio = summary.reduction_ratio(),
            labels_without_tolerance = summary.labels_without_tolerance(),
            grouping = self.grouping.as_str(),
            "reduction complete",
        );

        RunOutput { records, summary }
    }

    fn bucketize(&self, ctx: &mut RunContext, samples: Vec<Sample>) -> Vec<BucketedSample> {
        ctx.summary.raw_samples = samples.len();

        let Bucketized {
            samples,
            series,
            buckets_per_series,
            out_of_window,
        } = self.bucketizer.bucketize(ctx.window(), samples);

        ctx.summary.series = series;
        ctx.summary.out_of_window = out_of_window;
        if out_of_window > 0 {
            debug!(
                table = ctx.table(),
                out_of_window, "ignored samples outside the window"
            );
        }
        debug!(
            table = ctx.table(),
            series,
            buckets_per_series,
            bucketed = samples.len(),
            "bucketized",
        );

        samples
    }

    fn estimate(&self, ctx: &mut RunContext, series: &[BucketedSample]) -> ToleranceMap {
        match self.estimator.estimate(series) {
            Ok(map) => {
                ctx.summary.tolerances = map.len();
                ctx.summary.undetermined_labels = map.undetermined().count();
                for label in map.undetermined() {
                    debug!(table = ctx.table(), label, "no positive values, emitting unfiltered");
                }
                map
            }
            Err(e) => {
                warn!(
                    table = ctx.table(),
                    error = %e,
                    "tolerance estimation failed, emitting every value",
                );
                ctx.summary.degraded = true;
                ToleranceMap::empty()
            }
        }
    }

    fn dedup<G: Grouping>(
        ctx: &mut RunContext,
        grouping: G,
        series: Vec<BucketedSample>,
        tolerances: &ToleranceMap,
    ) -> Vec<EmittedRecord> {
        let (records, stats) = Deduplicator::new(grouping, tolerances).run(series);
        ctx.summary.dedup = stats;
        records
    }
}
