use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use super::error::{InsufficientSampleError, UnknownLabelTolerance};
use super::sample::{BucketedSample, Reading};

/// How labels are discovered in the estimation prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelDiscovery {
    /// Only labels present in the first `k` prefix entries get a tolerance.
    /// Labels first seen later fall back to emit-everything.
    Window(usize),
    /// Every label present anywhere in the prefix gets a tolerance.
    FullPrefix,
}

/// Tolerance available for one label.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tolerance {
    /// Values within ± this bound of the baseline are insignificant.
    Bounded(f64),
    /// No tolerance known; every value is significant.
    Unbounded,
}

/// Per-label noise thresholds derived from the estimation prefix.
#[derive(Debug, Clone, Default)]
pub struct ToleranceMap {
    thresholds: HashMap<Arc<str>, f64>,
    /// Discovered labels without a single positive value in the prefix.
    undetermined: BTreeSet<Arc<str>>,
}

impl ToleranceMap {
    /// A map with no entries: every label is unbounded.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_thresholds<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<Arc<str>>,
    {
        Self {
            thresholds: entries.into_iter().map(|(l, t)| (l.into(), t)).collect(),
            undetermined: BTreeSet::new(),
        }
    }

    /// The threshold for `label`, or why there is none.
    pub fn threshold(&self, label: &str) -> Result<f64, UnknownLabelTolerance> {
        self.thresholds
            .get(label)
            .copied()
            .ok_or_else(|| UnknownLabelTolerance {
                label: label.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    pub fn undetermined(&self) -> impl Iterator<Item = &str> {
        self.undetermined.iter().map(AsRef::as_ref)
    }
}

/// Derives per-label tolerances from a bounded prefix of the bucketized series.
#[derive(Debug, Clone, Copy)]
pub struct ToleranceEstimator {
    prefix_size: usize,
    discovery: LabelDiscovery,
}

impl ToleranceEstimator {
    pub fn new(prefix_size: usize, discovery: LabelDiscovery) -> Self {
        Self {
            prefix_size,
            discovery,
        }
    }

    /// Estimates tolerances from the first `prefix_size` entries of `series`.
    ///
    /// `series` must be in chronological order. Threshold per label is
    /// `floor(sqrt(mean))` of its present, strictly positive prefix values.
    pub fn estimate(
        &self,
        series: &[BucketedSample],
    ) -> Result<ToleranceMap, InsufficientSampleError> {
        let prefix = &series[..series.len().min(self.prefix_size)];
        if prefix.is_empty() {
            return Err(InsufficientSampleError::EmptyPrefix);
        }

        let discovery_span = match self.discovery {
            LabelDiscovery::Window(k) => &prefix[..prefix.len().min(k)],
            LabelDiscovery::FullPrefix => prefix,
        };
        let labels: HashSet<&Arc<str>> = discovery_span.iter().map(|s| &s.series.label).collect();

        let mut means: HashMap<&Arc<str>, (f64, u32)> = HashMap::with_capacity(labels.len());
        for s in prefix {
            let Reading::Present(v) = s.reading else {
                continue;
            };
            if !(v.is_finite() && v > 0.0) || !labels.contains(&s.series.label) {
                continue;
            }
            let (mean, count) = means.entry(&s.series.label).or_insert((0.0, 0));
            *count += 1;
            let n = f64::from(*count);
            *mean += v / n - *mean / n;
        }

        let mut map = ToleranceMap::empty();
        for label in labels {
            match means.get(label) {
                Some(&(mean, count)) if count > 0 => {
                    map.thresholds.insert(Arc::clone(label), mean.sqrt().floor());
                }
                _ => {
                    map.undetermined.insert(Arc::clone(label));
                }
            }
        }

        if map.thresholds.is_empty() {
            return Err(InsufficientSampleError::NoPositiveValues {
                labels: map.undetermined.len(),
            });
        }

        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::*;
    use crate::pipeline::sample::SeriesKey;

    fn t0() -> DateTime<Utc> {
        "2024-03-01T00:00:00Z".parse().expect("valid timestamp")
    }

    fn bucketed(idx: i64, label: &str, reading: Reading) -> BucketedSample {
        BucketedSample {
            bucket_start: t0() + Duration::minutes(10 * idx),
            series: SeriesKey::new("n1", "idrac", label),
            reading,
        }
    }

    fn series(label: &str, values: &[f64]) -> Vec<BucketedSample> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| bucketed(i as i64, label, Reading::Present(*v)))
            .collect()
    }

    #[test]
    fn test_sqrt_of_mean_threshold() {
        let est = ToleranceEstimator::new(1000, LabelDiscovery::Window(50));
        let map = est
            .estimate(&series("Temp1", &[4.0, 9.0, 16.0]))
            .expect("tolerance");
        // mean = 9.67, sqrt = 3.11
        assert_eq!(map.threshold("Temp1"), Ok(3.0));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_non_finite_values_do_not_feed_threshold() {
        let est = ToleranceEstimator::new(1000, LabelDiscovery::Window(50));
        let map = est
            .estimate(&series("Temp1", &[f64::NAN, 4.0, f64::INFINITY, 9.0, 16.0]))
            .expect("tolerance");
        assert_eq!(map.threshold("Temp1"), Ok(3.0));

        let only_nan = est.estimate(&series("Temp2", &[f64::NAN, f64::NAN]));
        assert!(matches!(
            only_nan,
            Err(InsufficientSampleError::NoPositiveValues { labels: 1 })
        ));
    }

    #[test]
    fn test_estimate_is_deterministic() {
        let est = ToleranceEstimator::new(1000, LabelDiscovery::Window(50));
        let mut input = series("Fan1", &[3600.0, 3620.0, 3580.0]);
        input.extend(series("Fan2", &[1200.0, 1100.0]));

        let a = est.estimate(&input).expect("tolerance");
        let b = est.estimate(&input).expect("tolerance");
        assert_eq!(a.threshold("Fan1"), b.threshold("Fan1"));
        assert_eq!(a.threshold("Fan2"), b.threshold("Fan2"));
        assert_eq!(a.threshold("Fan1"), Ok(60.0));
    }

    #[test]
    fn test_empty_prefix_fails() {
        let est = ToleranceEstimator::new(1000, LabelDiscovery::Window(50));
        assert_eq!(
            est.estimate(&[]).unwrap_err(),
            InsufficientSampleError::EmptyPrefix
        );
    }

    #[test]
    fn test_label_without_positive_values_is_undetermined() {
        let est = ToleranceEstimator::new(1000, LabelDiscovery::Window(50));
        let mut input = series("RareSensor", &[0.0]);
        input.extend(series("Temp1", &[25.0, 25.0]));

        let map = est.estimate(&input).expect("tolerance");
        assert!(map.threshold("RareSensor").is_err());
        assert_eq!(
            map.threshold("RareSensor").unwrap_err().label,
            "RareSensor"
        );
        assert_eq!(map.threshold("Temp1"), Ok(5.0));
        assert_eq!(map.undetermined().collect::<Vec<_>>(), vec!["RareSensor"]);
    }

    #[test]
    fn test_no_positive_values_anywhere_fails() {
        let est = ToleranceEstimator::new(1000, LabelDiscovery::Window(50));
        let mut input = series("RareSensor", &[0.0, -3.0]);
        input.push(bucketed(5, "Other", Reading::Absent));

        assert_eq!(
            est.estimate(&input).unwrap_err(),
            InsufficientSampleError::NoPositiveValues { labels: 2 }
        );
    }

    #[test]
    fn test_window_discovery_ignores_late_labels() {
        let mut input = series("Early", &[16.0, 16.0]);
        input.push(bucketed(3, "Late", Reading::Present(100.0)));

        let legacy = ToleranceEstimator::new(1000, LabelDiscovery::Window(2))
            .estimate(&input)
            .expect("tolerance");
        assert_eq!(legacy.threshold("Early"), Ok(4.0));
        assert!(legacy.threshold("Late").is_err());

        let full = ToleranceEstimator::new(1000, LabelDiscovery::FullPrefix)
            .estimate(&input)
            .expect("tolerance");
        assert_eq!(full.threshold("Late"), Ok(10.0));
    }

    #[test]
    fn test_values_gathered_from_whole_prefix() {
        // Label discovered in the first entry; its later values still count.
        let input = series("Temp1", &[1.0, 1.0, 1.0, 97.0]);
        let map = ToleranceEstimator::new(1000, LabelDiscovery::Window(1))
            .estimate(&input)
            .expect("tolerance");
        // mean = 25
        assert_eq!(map.threshold("Temp1"), Ok(5.0));
    }

    #[test]
    fn test_prefix_size_bounds_statistics() {
        let input = series("Temp1", &[4.0, 4.0, 400.0]);
        let map = ToleranceEstimator::new(2, LabelDiscovery::FullPrefix)
            .estimate(&input)
            .expect("tolerance");
        assert_eq!(map.threshold("Temp1"), Ok(2.0));
    }
}
