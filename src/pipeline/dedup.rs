use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::trace;

use super::sample::{BucketedSample, EmittedRecord, Reading, SeriesKey};
use super::tolerance::{Tolerance, ToleranceMap};

/// Chooses which samples share a running baseline.
pub trait Grouping {
    type Key: Hash + Eq;

    fn key(&self, series: &SeriesKey) -> Self::Key;
}

/// One baseline per label, shared by every node and source.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelOnly;

impl Grouping for LabelOnly {
    type Key = Arc<str>;

    fn key(&self, series: &SeriesKey) -> Arc<str> {
        Arc::clone(&series.label)
    }
}

/// One baseline per (node, source, label) series.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerSeries;

impl Grouping for PerSeries {
    type Key = SeriesKey;

    fn key(&self, series: &SeriesKey) -> SeriesKey {
        series.clone()
    }
}

/// Baseline state of one grouping key.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum BaselineState {
    /// Nothing emitted yet. Absent readings keep the key here.
    #[default]
    NoBaseline,
    /// Last emitted value.
    HasBaseline(f64),
}

impl BaselineState {
    /// Whether `value` is a significant change under `tolerance`.
    fn is_significant(self, value: f64, tolerance: Tolerance) -> bool {
        match (self, tolerance) {
            (Self::NoBaseline, _) | (_, Tolerance::Unbounded) => true,
            (Self::HasBaseline(prev), Tolerance::Bounded(tol)) => {
                value < prev - tol || value > prev + tol
            }
        }
    }
}

/// Counters reported by one deduplication pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub input_count: usize,
    pub output_count: usize,
    pub gaps_skipped: usize,
    pub duplicates_skipped: usize,
    /// Distinct labels with present values but no bounded tolerance.
    pub labels_without_tolerance: usize,
}

impl DedupStats {
    /// Fraction of input dropped (0.0 for empty input).
    pub fn reduction_ratio(&self) -> f64 {
        if self.input_count == 0 {
            return 0.0;
        }
        1.0 - self.output_count as f64 / self.input_count as f64
    }
}

/// Streaming, tolerance-driven deduplicator.
///
/// Generic over the [`Grouping`] strategy that decides which samples share a
/// baseline. One instance is used for one run and then discarded.
pub struct Deduplicator<'a, G: Grouping> {
    grouping: G,
    tolerances: &'a ToleranceMap,
    baselines: HashMap<G::Key, BaselineState>,
    emitted: HashSet<(DateTime<Utc>, SeriesKey)>,
    unbounded_labels: HashSet<Arc<str>>,
    stats: DedupStats,
}

impl<'a, G: Grouping> Deduplicator<'a, G> {
    pub fn new(grouping: G, tolerances: &'a ToleranceMap) -> Self {
        Self {
            grouping,
            tolerances,
            baselines: HashMap::new(),
            emitted: HashSet::new(),
            unbounded_labels: HashSet::new(),
            stats: DedupStats::default(),
        }
    }

    /// Feeds one sample; returns the record to emit, if any.
    pub fn push(&mut self, sample: BucketedSample) -> Option<EmittedRecord> {
        self.stats.input_count += 1;

        let value = match sample.reading {
            Reading::Present(v) if v.is_finite() => v,
            _ => {
                self.stats.gaps_skipped += 1;
                return None;
            }
        };

        let tolerance = match self.tolerances.threshold(&sample.series.label) {
            Ok(t) => Tolerance::Bounded(t),
            Err(unknown) => {
                if self.unbounded_labels.insert(Arc::clone(&sample.series.label)) {
                    trace!(%unknown, "emitting every value");
                }
                Tolerance::Unbounded
            }
        };

        let key = self.grouping.key(&sample.series);
        let state = self.baselines.entry(key).or_default();
        if !state.is_significant(value, tolerance) {
            return None;
        }

        if !self
            .emitted
            .insert((sample.bucket_start, sample.series.clone()))
        {
            self.stats.duplicates_skipped += 1;
            return None;
        }

        *state = BaselineState::HasBaseline(value);
        self.stats.output_count += 1;

        Some(EmittedRecord {
            time: sample.bucket_start,
            series: sample.series,
            value,
        })
    }

    /// Runs a full pass over `samples`, preserving input order.
    pub fn run<I>(mut self, samples: I) -> (Vec<EmittedRecord>, DedupStats)
    where
        I: IntoIterator<Item = BucketedSample>,
    {
        let mut out = Vec::new();
        for sample in samples {
            if let Some(record) = self.push(sample) {
                out.push(record);
            }
        }
        let stats = self.stats();
        (out, stats)
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            labels_without_tolerance: self.unbounded_labels.len(),
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn t0() -> DateTime<Utc> {
        "2024-03-01T00:00:00Z".parse().expect("valid timestamp")
    }

    fn on(node: &str, label: &str, values: &[Option<f64>]) -> Vec<BucketedSample> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| BucketedSample {
                bucket_start: t0() + Duration::minutes(10 * i as i64),
                series: SeriesKey::new(node, "idrac", label),
                reading: Reading::from(*v),
            })
            .collect()
    }

    fn present(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    fn values(records: &[EmittedRecord]) -> Vec<f64> {
        records.iter().map(|r| r.value).collect()
    }

    #[test]
    fn test_boundary_scenario() {
        let map = ToleranceMap::from_thresholds([("Temp1", 3.0)]);
        let (out, stats) = Deduplicator::new(LabelOnly, &map)
            .run(on("n1", "Temp1", &present(&[50.0, 51.0, 55.0, 54.0, 60.0])));

        assert_eq!(values(&out), vec![50.0, 55.0, 60.0]);
        assert_eq!(stats.input_count, 5);
        assert_eq!(stats.output_count, 3);
        assert!((stats.reduction_ratio() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_value_exactly_at_tolerance_is_dropped() {
        let map = ToleranceMap::from_thresholds([("Temp1", 3.0)]);
        let (out, _) = Deduplicator::new(LabelOnly, &map)
            .run(on("n1", "Temp1", &present(&[50.0, 53.0, 47.0, 53.5])));
        assert_eq!(values(&out), vec![50.0, 53.5]);
    }

    #[test]
    fn test_absent_values_skip_without_touching_baseline() {
        let map = ToleranceMap::from_thresholds([("Temp1", 5.0)]);
        let (out, stats) = Deduplicator::new(LabelOnly, &map).run(on(
            "n1",
            "Temp1",
            &[Some(10.0), None, Some(10.0), Some(40.0)],
        ));

        assert_eq!(values(&out), vec![10.0, 40.0]);
        assert_eq!(stats.gaps_skipped, 1);
    }

    #[test]
    fn test_non_finite_value_never_becomes_baseline() {
        let map = ToleranceMap::from_thresholds([("Temp1", 5.0)]);
        let (out, stats) = Deduplicator::new(LabelOnly, &map).run(on(
            "n1",
            "Temp1",
            &[Some(f64::NAN), Some(10.0), Some(500.0), Some(f64::INFINITY), Some(9000.0)],
        ));

        assert_eq!(values(&out), vec![10.0, 500.0, 9000.0]);
        assert_eq!(stats.gaps_skipped, 2);
    }

    #[test]
    fn test_leading_absent_keeps_no_baseline() {
        let map = ToleranceMap::from_thresholds([("Temp1", 5.0)]);
        let (out, _) =
            Deduplicator::new(LabelOnly, &map).run(on("n1", "Temp1", &[None, None, Some(12.0)]));
        assert_eq!(values(&out), vec![12.0]);
    }

    #[test]
    fn test_unknown_label_emits_everything() {
        let map = ToleranceMap::from_thresholds([("Temp1", 5.0)]);
        let (out, stats) = Deduplicator::new(LabelOnly, &map)
            .run(on("n1", "RareSensor", &present(&[0.0, 0.0, 0.1, 0.1])));

        assert_eq!(out.len(), 4);
        assert_eq!(stats.labels_without_tolerance, 1);
    }

    #[test]
    fn test_label_only_shares_baseline_across_nodes() {
        let map = ToleranceMap::from_thresholds([("Temp1", 3.0)]);
        let mut input = on("n1", "Temp1", &present(&[50.0]));
        input.extend(on("n2", "Temp1", &present(&[51.0])));

        let (out, _) = Deduplicator::new(LabelOnly, &map).run(input.clone());
        assert_eq!(out.len(), 1);

        let (out, _) = Deduplicator::new(PerSeries, &map).run(input);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_duplicate_bucket_key_emitted_once() {
        let map = ToleranceMap::empty();
        let mut input = on("n1", "Temp1", &present(&[1.0]));
        input.extend(on("n1", "Temp1", &present(&[2.0])));

        let (out, stats) = Deduplicator::new(PerSeries, &map).run(input);
        assert_eq!(values(&out), vec![1.0]);
        assert_eq!(stats.duplicates_skipped, 1);
    }

    #[test]
    fn test_rerun_over_output_is_stable() {
        let map = ToleranceMap::from_thresholds([("Fan1", 60.0)]);
        let input = on(
            "n1",
            "Fan1",
            &present(&[3600.0, 3620.0, 3700.0, 3690.0, 3500.0, 3560.0, 3900.0]),
        );

        let (first, _) = Deduplicator::new(LabelOnly, &map).run(input);
        let again: Vec<BucketedSample> = first
            .iter()
            .map(|r| BucketedSample {
                bucket_start: r.time,
                series: r.series.clone(),
                reading: Reading::Present(r.value),
            })
            .collect();
        let (second, stats) = Deduplicator::new(LabelOnly, &map).run(again);

        assert_eq!(first, second);
        assert_eq!(stats.input_count, stats.output_count);
    }

    #[test]
    fn test_empty_input_ratio() {
        let map = ToleranceMap::empty();
        let (out, stats) = Deduplicator::new(LabelOnly, &map).run(Vec::new());
        assert!(out.is_empty());
        assert_eq!(stats.reduction_ratio(), 0.0);
    }
}
