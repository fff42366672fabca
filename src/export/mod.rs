pub mod health;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;

/// Manages a ClickHouse native TCP connection pool.
///
/// Wraps `clickhouse-rs` Pool with LZ4 compression and a small pool
/// (min=2, max=5). One writer is opened for the source and one for the
/// ClickHouse sink.
pub struct ClickHouseWriter {
    role: &'static str,
    cfg: ClickHouseConfig,
    started: bool,
}

impl ClickHouseWriter {
    /// Creates a new writer with the given configuration.
    pub fn new(role: &'static str, cfg: ClickHouseConfig) -> Self {
        Self {
            role,
            cfg,
            started: false,
        }
    }

    /// Opens the connection pool and verifies connectivity with a ping.
    pub async fn start(&mut self) -> Result<Pool> {
        let dsn = self.build_dsn();
        let pool = Pool::new(dsn);

        let mut handle = pool
            .get_handle()
            .await
            .with_context(|| format!("opening ClickHouse {} connection", self.role))?;

        handle
            .ping()
            .await
            .with_context(|| format!("pinging ClickHouse {}", self.role))?;

        tracing::info!(
            role = self.role,
            endpoint = %self.cfg.endpoint,
            database = %self.cfg.database,
            "ClickHouse connected",
        );

        self.started = true;

        Ok(pool)
    }

    /// Closes the connection pool.
    pub async fn stop(&mut self) -> Result<()> {
        if std::mem::take(&mut self.started) {
            tracing::debug!(role = self.role, "ClickHouse pool closed");
        }
        Ok(())
    }

    /// Builds a clickhouse-rs compatible TCP DSN from configuration.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?options`
    fn build_dsn(&self) -> String {
        let mut dsn = "tcp://".to_string();

        if !self.cfg.username.is_empty() {
            dsn.push_str(&self.cfg.username);
            if !self.cfg.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.cfg.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.cfg.endpoint);
        dsn.push('/');
        dsn.push_str(&self.cfg.database);
        dsn.push_str("?compression=lz4&pool_min=2&pool_max=5");

        dsn
    }
}

/// Quotes a ClickHouse identifier with backticks.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}
