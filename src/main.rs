use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use reducto::clock::WindowClock;
use reducto::config::Config;
use reducto::export::health::RunMetrics;
use reducto::export::ClickHouseWriter;
use reducto::runner::{Runner, TableJob};
use reducto::sink::{ClickHouseSink, HttpSink, Output};
use reducto::source::ClickHouseSource;

/// Bucketing and adaptive deduplication of cluster hardware telemetry.
#[derive(Parser)]
#[command(name = "reducto", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Reference end time (RFC 3339). Defaults to now; aligned down to the bucket width.
    #[arg(long, value_parser = parse_end)]
    end: Option<DateTime<Utc>>,

    /// Reduce only the named table. May be repeated.
    #[arg(long = "table")]
    tables: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the configuration, then exit.
    Validate,
    /// Print version information and exit.
    Version,
}

fn parse_end(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 time {s:?}: {e}"))
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("reducto {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .as_ref()
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    if let Some(Command::Validate) = &cli.command {
        tracing::info!(
            path = %config_path.display(),
            tables = cfg.tables.len(),
            "configuration is valid",
        );
        return Ok(());
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting reducto",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let failed = rt.block_on(run(cfg, cli.end, cli.tables))?;
    if failed > 0 {
        bail!("{failed} table(s) failed");
    }

    Ok(())
}

/// Runs every selected table once. Returns the number of failed tables.
async fn run(cfg: Config, end: Option<DateTime<Utc>>, only: Vec<String>) -> Result<usize> {
    let jobs = TableJob::from_config(&cfg, &only)?;
    let clock = WindowClock::new(end, cfg.reduction.bucket_width)?;
    let metrics = Arc::new(RunMetrics::new().context("creating run metrics")?);

    let mut source_writer = ClickHouseWriter::new("source", cfg.source.clickhouse.clone());
    let source_pool = source_writer.start().await?;
    let source = ClickHouseSource::new(source_pool, cfg.source.clickhouse.database.clone());

    let mut sink_writer = None;
    let output = if cfg.sink.clickhouse.enabled {
        let ch = &cfg.sink.clickhouse;
        let mut writer = ClickHouseWriter::new("sink", ch.connection.clone());
        let pool = writer.start().await?;
        sink_writer = Some(writer);
        Output::ClickHouse(ClickHouseSink::new(
            pool,
            ch.connection.database.clone(),
            ch.batch_size,
        ))
    } else {
        Output::Http(HttpSink::new(cfg.sink.http.clone())?)
    };

    let runner = Runner::new(
        cfg.reduction.settings(),
        clock,
        source,
        output,
        cfg.reduction.max_concurrent_tables,
    )
    .context("building runner")?
    .with_metrics(Arc::clone(&metrics));

    let signals = tokio::spawn(wait_for_signal(runner.cancellation_token()));

    let outcomes = runner.run(jobs).await;
    signals.abort();

    if let Some(mut writer) = sink_writer {
        writer.stop().await?;
    }
    source_writer.stop().await?;

    if let Some(path) = &cfg.metrics.textfile {
        if let Err(e) = metrics.write_textfile(path) {
            tracing::warn!(error = %e, "writing metrics textfile");
        }
    }

    let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
    tracing::info!(tables = outcomes.len(), failed, "reducto finished");

    Ok(failed)
}

/// Cancels `token` on SIGINT or SIGTERM.
async fn wait_for_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "registering SIGTERM handler");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, cancelling");
                token.cancel();
                return;
            }
        };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, cancelling");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, cancelling");
        }
    }

    token.cancel();
}
