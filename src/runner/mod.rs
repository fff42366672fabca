//! Async orchestration of per-table reduction runs.
//!
//! Each table is an independent task: compute the window, fetch raw samples,
//! run the synchronous core on a blocking thread and hand the output to the
//! sink. Tasks are bounded by a semaphore and never abort each other.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::WindowClock;
use crate::config::{Config, TableConfig};
use crate::export::health::RunMetrics;
use crate::pipeline::error::{PipelineError, WindowError};
use crate::pipeline::sample::Window;
use crate::pipeline::{Pipeline, RunContext, RunSummary, Settings};
use crate::sink::Sink;
use crate::source::SampleSource;

/// One table to reduce, with its resolved window length.
#[derive(Debug, Clone)]
pub struct TableJob {
    pub table: TableConfig,
    pub window: Duration,
}

impl TableJob {
    /// Resolves jobs from configuration, optionally restricted to `only`.
    ///
    /// Jobs keep configuration order. Unknown names in `only` are an error.
    pub fn from_config(cfg: &Config, only: &[String]) -> Result<Vec<Self>> {
        for name in only {
            if !cfg.tables.iter().any(|t| &t.name == name) {
                bail!("unknown table: {name}");
            }
        }

        Ok(cfg
            .tables
            .iter()
            .filter(|t| only.is_empty() || only.contains(&t.name))
            .map(|t| Self {
                table: t.clone(),
                window: cfg.window_for(t),
            })
            .collect())
    }
}

/// Result of a successful table run.
#[derive(Debug, Clone)]
pub struct TableReport {
    pub summary: RunSummary,
    /// Rows acknowledged by the sink.
    pub written: usize,
}

/// Outcome of one table's run.
#[derive(Debug)]
pub struct TableOutcome {
    pub table: String,
    pub took: Duration,
    pub result: Result<TableReport, PipelineError>,
}

impl TableOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs the reduction core over every table, isolating failures.
pub struct Runner<S, K> {
    pipeline: Pipeline,
    clock: WindowClock,
    source: Arc<S>,
    sink: Arc<K>,
    max_concurrent: usize,
    metrics: Option<Arc<RunMetrics>>,
    cancel: CancellationToken,
}

impl<S, K> Runner<S, K>
where
    S: SampleSource + 'static,
    K: Sink + 'static,
{
    pub fn new(
        settings: Settings,
        clock: WindowClock,
        source: S,
        sink: K,
        max_concurrent: usize,
    ) -> Result<Self, WindowError> {
        Ok(Self {
            pipeline: Pipeline::new(settings)?,
            clock,
            source: Arc::new(source),
            sink: Arc::new(sink),
            max_concurrent: max_concurrent.max(1),
            metrics: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Records every outcome into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Token that cancels all runs that have not started their sink write.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs every job and returns one outcome per job, in job order.
    pub async fn run(&self, jobs: Vec<TableJob>) -> Vec<TableOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        info!(
            tables = jobs.len(),
            max_concurrent = self.max_concurrent,
            end = %self.clock.end(),
            source = self.source.name(),
            sink = self.sink.name(),
            "starting reduction",
        );

        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let name = job.table.name.clone();
            let task = TableTask {
                pipeline: self.pipeline,
                clock: self.clock,
                source: Arc::clone(&self.source),
                sink: Arc::clone(&self.sink),
                cancel: self.cancel.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            let metrics = self.metrics.clone();
            let task_name = name.clone();

            let handle = tokio::spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    _ = task.cancel.cancelled() => None,
                };

                let started = Instant::now();
                let result = task.run(job).await;
                let outcome = TableOutcome {
                    table: task_name,
                    took: started.elapsed(),
                    result,
                };
                if let Some(metrics) = &metrics {
                    record(metrics, task.sink.name(), &outcome);
                }
                outcome
            });
            handles.push((name, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(table = %name, error = %e, "table task panicked");
                    let outcome = TableOutcome {
                        table: name.clone(),
                        took: Duration::ZERO,
                        result: Err(PipelineError::Task {
                            table: name,
                            window: self.window_hint(),
                            message: e.to_string(),
                        }),
                    };
                    if let Some(metrics) = &self.metrics {
                        record(metrics, self.sink.name(), &outcome);
                    }
                    outcome
                }
            };
            if let Err(e) = &outcome.result {
                error!(table = %outcome.table, kind = e.kind(), error = %e, "table run failed");
            }
            outcomes.push(outcome);
        }

        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        info!(
            tables = outcomes.len(),
            failed,
            "reduction finished",
        );

        outcomes
    }

    /// A zero-length window at the clock end, for errors raised outside a run.
    fn window_hint(&self) -> Window {
        Window {
            start: self.clock.end(),
            end: self.clock.end(),
        }
    }
}

fn record(metrics: &RunMetrics, sink: &str, outcome: &TableOutcome) {
    match &outcome.result {
        Ok(report) => metrics.observe_success(&report.summary, sink, report.written, outcome.took),
        Err(e) => metrics.observe_failure(&outcome.table, e.kind(), outcome.took),
    }
}

/// Everything one spawned table run needs, owned.
struct TableTask<S, K> {
    pipeline: Pipeline,
    clock: WindowClock,
    source: Arc<S>,
    sink: Arc<K>,
    cancel: CancellationToken,
}

impl<S, K> TableTask<S, K>
where
    S: SampleSource + 'static,
    K: Sink + 'static,
{
    async fn run(&self, job: TableJob) -> Result<TableReport, PipelineError> {
        let TableJob { table, window } = job;
        let name = table.name.clone();

        let window = self
            .clock
            .window(window)
            .map_err(|source| PipelineError::Window {
                table: name.clone(),
                source,
            })?;

        let cancelled = || PipelineError::Cancelled {
            table: name.clone(),
            window,
        };

        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }

        info!(table = %name, %window, source_table = %table.source_table, "reducing table");

        let samples = tokio::select! {
            fetched = self.source.fetch(&table, window) => {
                fetched.map_err(|source| PipelineError::Collection {
                    table: name.clone(),
                    window,
                    source,
                })?
            }
            _ = self.cancel.cancelled() => return Err(cancelled()),
        };

        debug!(table = %name, samples = samples.len(), "running reduction core");

        let pipeline = self.pipeline;
        let ctx = RunContext::new(name.clone(), window);
        let output = tokio::task::spawn_blocking(move || pipeline.run(ctx, samples))
            .await
            .map_err(|e| PipelineError::Task {
                table: name.clone(),
                window,
                message: e.to_string(),
            })?;

        // Nothing is written once cancellation is observed here.
        if self.cancel.is_cancelled() {
            warn!(table = %name, "cancelled before sink write");
            return Err(cancelled());
        }

        let target = table.target_table();
        let written = self
            .sink
            .write(&target, &output.records)
            .await
            .map_err(|source| PipelineError::Sink {
                table: name.clone(),
                window,
                source,
            })?;

        info!(
            table = %name,
            target = %target,
            written,
            degraded = output.summary.degraded,
            "table reduced",
        );

        Ok(TableReport {
            summary: output.summary,
            written,
        })
    }
}
