use std::fmt::Write;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;
use tracing::debug;

use crate::export::quote_identifier;
use crate::pipeline::error::SinkError;
use crate::pipeline::sample::EmittedRecord;

use super::{format_datetime, Sink};

const COLUMNS: &str = "time, node_id, source, label, value";

/// ClickHouse batch writer for emitted records.
///
/// Records are inserted in chunks of `batch_size` rows. ClickHouse has no
/// multi-statement transactions, so a failure after the first chunk leaves
/// the earlier chunks committed.
pub struct ClickHouseSink {
    pool: Pool,
    database: String,
    batch_size: usize,
}

impl ClickHouseSink {
    /// Creates a new ClickHouse sink.
    pub fn new(pool: Pool, database: String, batch_size: usize) -> Self {
        Self {
            pool,
            database,
            batch_size: batch_size.max(1),
        }
    }

    async fn insert(&self, target: &str, records: &[EmittedRecord]) -> Result<usize> {
        let table = qualified_table(&self.database, target);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for reduced insert")?;

        let mut written = 0;
        for chunk in records.chunks(self.batch_size) {
            let sql = build_insert(&table, chunk);
            handle
                .execute(sql.as_str())
                .await
                .with_context(|| format!("sending {table} batch after {written} rows"))?;
            written += chunk.len();
        }

        Ok(written)
    }
}

impl Sink for ClickHouseSink {
    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn write(&self, target: &str, records: &[EmittedRecord]) -> Result<usize, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }

        let written = self
            .insert(target, records)
            .await
            .map_err(|e| SinkError::new(self.name(), e))?;

        debug!(target, rows = written, "flushed reduced records");

        Ok(written)
    }
}

/// Returns `database.target` with both parts quoted.
fn qualified_table(database: &str, target: &str) -> String {
    format!("{}.{}", quote_identifier(database), quote_identifier(target))
}

/// Builds one multi-row INSERT statement.
fn build_insert(table: &str, records: &[EmittedRecord]) -> String {
    let mut sql = String::with_capacity(64 + table.len() + records.len() * 96);
    let _ = write!(sql, "INSERT INTO {table} ({COLUMNS}) VALUES ");

    for (idx, r) in records.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }
        let _ = write!(
            sql,
            "('{}', '{}', '{}', '{}', {})",
            format_datetime(r.time),
            escape_sql(&r.series.node_id),
            escape_sql(&r.series.source),
            escape_sql(&r.series.label),
            r.value,
        );
    }

    sql
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
