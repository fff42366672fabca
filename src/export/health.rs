use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

use crate::pipeline::RunSummary;

/// Prometheus metrics for reduction runs.
///
/// All metrics use the "reducto" namespace. The binary is a batch job, so
/// the registry is rendered once at exit into a node_exporter textfile
/// instead of being served.
pub struct RunMetrics {
    registry: Registry,

    /// Table runs by outcome (ok/failed).
    pub runs_total: CounterVec,
    /// Failed table runs by error kind.
    pub run_failures_total: CounterVec,
    /// Bucketed samples fed to the deduplicator, per table.
    pub input_samples: GaugeVec,
    /// Records emitted to the sink, per table.
    pub output_records: GaugeVec,
    /// Fraction of bucketed samples dropped, per table.
    pub reduction_ratio: GaugeVec,
    /// Labels emitted without a bounded tolerance, per table.
    pub labels_without_tolerance: GaugeVec,
    /// Whether tolerance estimation failed for the table (1=yes, 0=no).
    pub degraded: GaugeVec,
    /// Rows written per sink.
    pub sink_rows_total: CounterVec,
    /// Wall time of one table run.
    pub run_duration: HistogramVec,
    /// Unix time at which the last invocation finished.
    pub last_run_timestamp: Gauge,
}

impl RunMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let runs_total = CounterVec::new(
            Opts::new("runs_total", "Total table runs by outcome.").namespace("reducto"),
            &["table", "outcome"],
        )?;
        let run_failures_total = CounterVec::new(
            Opts::new(
                "run_failures_total",
                "Total failed table runs by error kind.",
            )
            .namespace("reducto"),
            &["table", "kind"],
        )?;
        let input_samples = GaugeVec::new(
            Opts::new(
                "input_samples",
                "Bucketed samples fed to the deduplicator in the last run.",
            )
            .namespace("reducto"),
            &["table"],
        )?;
        let output_records = GaugeVec::new(
            Opts::new(
                "output_records",
                "Records emitted to the sink in the last run.",
            )
            .namespace("reducto"),
            &["table"],
        )?;
        let reduction_ratio = GaugeVec::new(
            Opts::new(
                "reduction_ratio",
                "Fraction of bucketed samples dropped in the last run.",
            )
            .namespace("reducto"),
            &["table"],
        )?;
        let labels_without_tolerance = GaugeVec::new(
            Opts::new(
                "labels_without_tolerance",
                "Labels emitted unfiltered for lack of a tolerance in the last run.",
            )
            .namespace("reducto"),
            &["table"],
        )?;
        let degraded = GaugeVec::new(
            Opts::new(
                "degraded",
                "Whether tolerance estimation failed in the last run (1=yes, 0=no).",
            )
            .namespace("reducto"),
            &["table"],
        )?;
        let sink_rows_total = CounterVec::new(
            Opts::new("sink_rows_total", "Total rows written by sink.").namespace("reducto"),
            &["sink"],
        )?;
        let run_duration = HistogramVec::new(
            HistogramOpts::new("run_duration_seconds", "Wall time of one table run.")
                .namespace("reducto")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
            &["table"],
        )?;
        let last_run_timestamp = Gauge::with_opts(
            Opts::new(
                "last_run_timestamp_seconds",
                "Unix time at which the last invocation finished.",
            )
            .namespace("reducto"),
        )?;

        registry.register(Box::new(runs_total.clone()))?;
        registry.register(Box::new(run_failures_total.clone()))?;
        registry.register(Box::new(input_samples.clone()))?;
        registry.register(Box::new(output_records.clone()))?;
        registry.register(Box::new(reduction_ratio.clone()))?;
        registry.register(Box::new(labels_without_tolerance.clone()))?;
        registry.register(Box::new(degraded.clone()))?;
        registry.register(Box::new(sink_rows_total.clone()))?;
        registry.register(Box::new(run_duration.clone()))?;
        registry.register(Box::new(last_run_timestamp.clone()))?;

        Ok(Self {
            registry,
            runs_total,
            run_failures_total,
            input_samples,
            output_records,
            reduction_ratio,
            labels_without_tolerance,
            degraded,
            sink_rows_total,
            run_duration,
            last_run_timestamp,
        })
    }

    /// Records a successful table run.
    pub fn observe_success(
        &self,
        summary: &RunSummary,
        sink: &str,
        written: usize,
        took: Duration,
    ) {
        let table = summary.table.as_str();

        self.runs_total.with_label_values(&[table, "ok"]).inc();
        self.input_samples
            .with_label_values(&[table])
            .set(summary.input_count() as f64);
        self.output_records
            .with_label_values(&[table])
            .set(summary.output_count() as f64);
        self.reduction_ratio
            .with_label_values(&[table])
            .set(summary.reduction_ratio());
        self.labels_without_tolerance
            .with_label_values(&[table])
            .set(summary.labels_without_tolerance() as f64);
        self.degraded
            .with_label_values(&[table])
            .set(if summary.degraded { 1.0 } else { 0.0 });
        self.sink_rows_total
            .with_label_values(&[sink])
            .inc_by(written as f64);
        self.run_duration
            .with_label_values(&[table])
            .observe(took.as_secs_f64());
    }

    /// Records a failed table run.
    pub fn observe_failure(&self, table: &str, kind: &str, took: Duration) {
        self.runs_total.with_label_values(&[table, "failed"]).inc();
        self.run_failures_total
            .with_label_values(&[table, kind])
            .inc();
        self.run_duration
            .with_label_values(&[table])
            .observe(took.as_secs_f64());
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Writes the rendered registry to `path`, atomically via a temp file.
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        self.last_run_timestamp
            .set(chrono::Utc::now().timestamp_millis() as f64 / 1000.0);

        let text = self.render()?;
        let tmp = path.with_extension("prom.tmp");

        std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;

        tracing::debug!(path = %path.display(), "metrics textfile written");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sample::Window;

    fn summary() -> RunSummary {
        let window = Window::new(
            "2024-03-01T00:00:00Z".parse().expect("valid timestamp"),
            "2024-03-08T00:00:00Z".parse().expect("valid timestamp"),
        )
        .expect("window");
        let mut s = RunSummary::new("power".to_string(), window);
        s.dedup.input_count = 10;
        s.dedup.output_count = 4;
        s
    }

    #[test]
    fn test_metrics_render_with_namespace() {
        let metrics = RunMetrics::new().expect("metrics");
        metrics.observe_success(&summary(), "clickhouse", 4, Duration::from_millis(250));
        metrics.observe_failure("fan", "collection", Duration::from_millis(10));

        let text = metrics.render().expect("render");
        let line = |name: &str, table: &str| {
            let label = format!("table=\"{table}\"");
            text.lines()
                .find(|l| l.starts_with(name) && l.contains(&label))
                .map(str::to_string)
                .unwrap_or_default()
        };
        let power = line("reducto_runs_total{", "power");
        assert!(power.contains("outcome=\"ok\""), "{power}");
        assert!(power.ends_with(" 1"), "{power}");
        let fan = line("reducto_runs_total{", "fan");
        assert!(fan.contains("outcome=\"failed\""), "{fan}");
        assert!(line("reducto_run_failures_total{", "fan").contains("kind=\"collection\""));
        assert!(line("reducto_output_records{", "power").ends_with(" 4"));
        assert!(text.contains("reducto_sink_rows_total{sink=\"clickhouse\"} 4"));
        assert!(text.contains("reducto_reduction_ratio{table=\"power\"}"));
    }

    #[test]
    fn test_write_textfile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reducto.prom");

        let metrics = RunMetrics::new().expect("metrics");
        metrics.observe_success(&summary(), "http", 4, Duration::from_secs(1));
        metrics.write_textfile(&path).expect("write textfile");

        let text = std::fs::read_to_string(&path).expect("read textfile");
        assert!(text.contains("reducto_last_run_timestamp_seconds"));
        assert!(!path.with_extension("prom.tmp").exists());
    }
}
