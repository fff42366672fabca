use std::collections::BTreeMap;
use std::time::Duration;

use super::error::WindowError;
use super::sample::{align_down_ms, from_millis, BucketedSample, Reading, Sample, SeriesKey, Window};

/// Running mean for one (series, bucket) cell.
///
/// Updated incrementally so large finite inputs cannot overflow the mean.
/// Non-finite raw values are treated as absent.
#[derive(Debug, Clone, Copy, Default)]
struct MeanAccumulator {
    mean: f64,
    count: u32,
}

impl MeanAccumulator {
    fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count = self.count.saturating_add(1);
        let n = f64::from(self.count);
        self.mean += value / n - self.mean / n;
    }

    fn reading(self) -> Reading {
        if self.count == 0 {
            Reading::Absent
        } else {
            Reading::Present(self.mean)
        }
    }
}

/// Gap-filled bucketing output plus counters for the run summary.
#[derive(Debug, Clone, Default)]
pub struct Bucketized {
    /// Ordered by bucket_start, then series key.
    pub samples: Vec<BucketedSample>,
    /// Distinct series seen inside the window.
    pub series: usize,
    /// Bucket boundaries per series.
    pub buckets_per_series: usize,
    /// Raw samples that fell outside the window and were ignored.
    pub out_of_window: usize,
}

/// Groups raw samples into fixed-width time buckets per series.
#[derive(Debug, Clone, Copy)]
pub struct Bucketizer {
    width_ms: i64,
}

impl Bucketizer {
    pub fn new(width: Duration) -> Result<Self, WindowError> {
        let width_ms = i64::try_from(width.as_millis()).unwrap_or(i64::MAX);
        if width_ms <= 0 {
            return Err(WindowError::ZeroWidth);
        }
        Ok(Self { width_ms })
    }

    /// Number of bucket boundaries covering `window`, and the first one in ms.
    fn geometry(&self, window: Window) -> (i64, usize) {
        let first = align_down_ms(window.start.timestamp_millis(), self.width_ms);
        let end = window.end.timestamp_millis();
        let span = end.saturating_sub(first);
        let count = span.saturating_add(self.width_ms - 1) / self.width_ms;
        (first, usize::try_from(count).unwrap_or(0))
    }

    /// Buckets `samples` over `window`, emitting one entry per bucket
    /// boundary for every series with at least one sample in the window.
    pub fn bucketize(&self, window: Window, samples: Vec<Sample>) -> Bucketized {
        let (first_ms, bucket_count) = self.geometry(window);

        let mut cells: BTreeMap<SeriesKey, Vec<MeanAccumulator>> = BTreeMap::new();
        let mut out_of_window = 0usize;

        for sample in samples {
            if !window.contains(sample.timestamp) {
                out_of_window += 1;
                continue;
            }

            let bucket_ms = align_down_ms(sample.timestamp.timestamp_millis(), self.width_ms);
            let idx = ((bucket_ms - first_ms) / self.width_ms) as usize;

            let row = cells
                .entry(sample.series)
                .or_insert_with(|| vec![MeanAccumulator::default(); bucket_count]);

            if let (Some(cell), Reading::Present(v)) = (row.get_mut(idx), sample.reading) {
                cell.add(v);
            }
        }

        let mut out = Vec::with_capacity(cells.len().saturating_mul(bucket_count));
        for idx in 0..bucket_count {
            let bucket_start = from_millis(first_ms + idx as i64 * self.width_ms);
            for (series, row) in &cells {
                out.push(BucketedSample {
                    bucket_start,
                    series: series.clone(),
                    reading: row[idx].reading(),
                });
            }
        }

        Bucketized {
            samples: out,
            series: cells.len(),
            buckets_per_series: bucket_count,
            out_of_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid timestamp")
    }

    fn sample(t: &str, node: &str, label: &str, v: Option<f64>) -> Sample {
        Sample {
            timestamp: ts(t),
            series: SeriesKey::new(node, "idrac", label),
            reading: Reading::from(v),
        }
    }

    fn hour_window() -> Window {
        Window::new(ts("2024-03-01T00:00:00Z"), ts("2024-03-01T01:00:00Z")).expect("window")
    }

    fn ten_minutes() -> Bucketizer {
        Bucketizer::new(Duration::from_secs(600)).expect("bucketizer")
    }

    #[test]
    fn test_zero_width_rejected() {
        assert_eq!(
            Bucketizer::new(Duration::ZERO).unwrap_err(),
            WindowError::ZeroWidth
        );
    }

    #[test]
    fn test_bucket_start_is_multiple_of_width() {
        let out = ten_minutes().bucketize(
            hour_window(),
            vec![sample("2024-03-01T00:17:42Z", "n1", "Temp1", Some(7.0))],
        );
        let populated = out
            .samples
            .iter()
            .find(|s| s.reading == Reading::Present(7.0))
            .expect("populated bucket");
        assert_eq!(populated.bucket_start, ts("2024-03-01T00:10:00Z"));
    }

    #[test]
    fn test_gap_fill_emits_every_boundary() {
        let out = ten_minutes().bucketize(
            hour_window(),
            vec![sample("2024-03-01T00:05:00Z", "n1", "Fan1", Some(3000.0))],
        );

        assert_eq!(out.series, 1);
        assert_eq!(out.buckets_per_series, 6);
        assert_eq!(out.samples.len(), 6);
        assert_eq!(out.samples[0].reading, Reading::Present(3000.0));
        assert!(out.samples[1..].iter().all(|s| s.reading == Reading::Absent));
        for (i, s) in out.samples.iter().enumerate() {
            assert_eq!(
                s.bucket_start,
                ts("2024-03-01T00:00:00Z") + chrono::Duration::minutes(10 * i as i64)
            );
        }
    }

    #[test]
    fn test_mean_of_bucket_values() {
        let out = ten_minutes().bucketize(
            hour_window(),
            vec![
                sample("2024-03-01T00:01:00Z", "n1", "Temp1", Some(40.0)),
                sample("2024-03-01T00:02:00Z", "n1", "Temp1", Some(41.0)),
                sample("2024-03-01T00:09:59Z", "n1", "Temp1", Some(45.0)),
            ],
        );

        let v = out.samples[0].reading.value().expect("present");
        assert!((v - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_absent_raw_values_are_ignored_in_mean() {
        let out = ten_minutes().bucketize(
            hour_window(),
            vec![
                sample("2024-03-01T00:01:00Z", "n1", "Temp1", Some(10.0)),
                sample("2024-03-01T00:02:00Z", "n1", "Temp1", None),
                sample("2024-03-01T00:11:00Z", "n1", "Temp1", None),
            ],
        );

        assert_eq!(out.samples[0].reading, Reading::Present(10.0));
        // Only absent raw values: the bucket is a gap, not zero.
        assert_eq!(out.samples[1].reading, Reading::Absent);
    }

    #[test]
    fn test_output_ordered_by_bucket_then_series() {
        let out = ten_minutes().bucketize(
            hour_window(),
            vec![
                sample("2024-03-01T00:15:00Z", "n2", "Temp1", Some(1.0)),
                sample("2024-03-01T00:05:00Z", "n1", "Temp2", Some(2.0)),
                sample("2024-03-01T00:25:00Z", "n1", "Temp1", Some(3.0)),
            ],
        );

        assert_eq!(out.series, 3);
        assert_eq!(out.samples.len(), 18);
        for pair in out.samples.windows(2) {
            let ordered = (pair[0].bucket_start, &pair[0].series)
                < (pair[1].bucket_start, &pair[1].series);
            assert!(ordered, "out of order: {:?} then {:?}", pair[0], pair[1]);
        }
        let first_three: Vec<String> = out.samples[..3]
            .iter()
            .map(|s| s.series.to_string())
            .collect();
        assert_eq!(
            first_three,
            vec!["n1/idrac/Temp1", "n1/idrac/Temp2", "n2/idrac/Temp1"]
        );
    }

    #[test]
    fn test_non_finite_raw_values_are_absent() {
        let out = ten_minutes().bucketize(
            hour_window(),
            vec![
                sample("2024-03-01T00:01:00Z", "n1", "Temp1", Some(f64::NAN)),
                sample("2024-03-01T00:02:00Z", "n1", "Temp1", Some(12.0)),
                sample("2024-03-01T00:11:00Z", "n1", "Temp1", Some(f64::INFINITY)),
                sample("2024-03-01T00:21:00Z", "n1", "Temp1", Some(f64::NEG_INFINITY)),
            ],
        );

        assert_eq!(out.samples[0].reading, Reading::Present(12.0));
        assert_eq!(out.samples[1].reading, Reading::Absent);
        assert_eq!(out.samples[2].reading, Reading::Absent);
    }

    #[test]
    fn test_mean_of_huge_values_stays_finite() {
        let out = ten_minutes().bucketize(
            hour_window(),
            vec![
                sample("2024-03-01T00:01:00Z", "n1", "PSU1", Some(1.5e308)),
                sample("2024-03-01T00:02:00Z", "n1", "PSU1", Some(1.5e308)),
                sample("2024-03-01T00:11:00Z", "n1", "PSU1", Some(-1.5e308)),
                sample("2024-03-01T00:12:00Z", "n1", "PSU1", Some(1.5e308)),
            ],
        );

        let v = out.samples[0].reading.value().expect("present");
        assert!(v.is_finite());
        assert_eq!(v, 1.5e308);
        let mixed = out.samples[1].reading.value().expect("present");
        assert!(mixed.is_finite());
    }

    #[test]
    fn test_samples_outside_window_are_dropped() {
        let out = ten_minutes().bucketize(
            hour_window(),
            vec![
                sample("2024-02-29T23:59:59Z", "n1", "Temp1", Some(1.0)),
                sample("2024-03-01T01:00:00Z", "n9", "Temp1", Some(1.0)),
            ],
        );

        assert_eq!(out.out_of_window, 2);
        assert_eq!(out.series, 0);
        assert!(out.samples.is_empty());
    }

    #[test]
    fn test_unaligned_window_start_floors_first_bucket() {
        let window =
            Window::new(ts("2024-03-01T00:05:00Z"), ts("2024-03-01T00:30:00Z")).expect("window");
        let out = ten_minutes().bucketize(
            window,
            vec![sample("2024-03-01T00:06:00Z", "n1", "Temp1", Some(5.0))],
        );

        assert_eq!(out.buckets_per_series, 3);
        assert_eq!(out.samples[0].bucket_start, ts("2024-03-01T00:00:00Z"));
        assert_eq!(out.samples[0].reading, Reading::Present(5.0));
    }
}
