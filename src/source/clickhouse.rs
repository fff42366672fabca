use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;
use tracing::debug;

use crate::config::TableConfig;
use crate::export::quote_identifier;
use crate::pipeline::error::CollectionError;
use crate::pipeline::sample::{from_millis, Reading, Sample, SeriesKey, Window};

use super::SampleSource;

/// Reads raw telemetry rows from ClickHouse.
///
/// Expects each source table to carry `timestamp`, `node_id`, `source`,
/// `value` and the table's configured label column.
pub struct ClickHouseSource {
    pool: Pool,
    database: String,
}

impl ClickHouseSource {
    pub fn new(pool: Pool, database: String) -> Self {
        Self { pool, database }
    }

    async fn query(&self, table: &TableConfig, window: Window) -> Result<Vec<Sample>> {
        let sql = build_select(&self.database, table, window);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for sample query")?;

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .with_context(|| format!("querying {}", table.source_table))?;

        let mut interner = Interner::default();
        let mut samples = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let ts_ms: i64 = row.get("ts_ms").context("reading ts_ms")?;
            let node_id: String = row.get("node_id").context("reading node_id")?;
            let source: String = row.get("source").context("reading source")?;
            let label: String = row.get("label").context("reading label")?;
            let value: Option<f64> = row.get("value").context("reading value")?;

            samples.push(Sample {
                timestamp: from_millis(ts_ms),
                series: SeriesKey {
                    node_id: interner.intern(&node_id),
                    source: interner.intern(&source),
                    label: interner.intern(&label),
                },
                reading: Reading::from(value.filter(|v| v.is_finite())),
            });
        }

        Ok(samples)
    }
}

impl SampleSource for ClickHouseSource {
    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn fetch(
        &self,
        table: &TableConfig,
        window: Window,
    ) -> Result<Vec<Sample>, CollectionError> {
        let samples = self
            .query(table, window)
            .await
            .map_err(|e| CollectionError::new(self.name(), e))?;

        debug!(
            table = %table.name,
            source_table = %table.source_table,
            rows = samples.len(),
            "fetched raw samples",
        );

        Ok(samples)
    }
}

/// Shares one allocation per distinct string within a fetch.
#[derive(Default)]
struct Interner {
    seen: HashSet<Arc<str>>,
}

impl Interner {
    fn intern(&mut self, s: &str) -> Arc<str> {
        if let Some(existing) = self.seen.get(s) {
            return Arc::clone(existing);
        }
        let value: Arc<str> = Arc::from(s);
        self.seen.insert(Arc::clone(&value));
        value
    }
}

/// Builds the windowed SELECT for one table.
fn build_select(database: &str, table: &TableConfig, window: Window) -> String {
    let start_ms = window.start.timestamp_millis();
    let end_ms = window.end.timestamp_millis();

    let mut sql = String::with_capacity(512);
    let _ = write!(
        sql,
        "SELECT toInt64(toUnixTimestamp64Milli(toDateTime64(timestamp, 3))) AS ts_ms, \
         toString(node_id) AS node_id, \
         toString(source) AS source, \
         toString({label}) AS label, \
         toNullable(toFloat64(value)) AS value \
         FROM {database}.{source_table} \
         WHERE timestamp >= fromUnixTimestamp64Milli(toInt64({start_ms})) \
         AND timestamp < fromUnixTimestamp64Milli(toInt64({end_ms})) \
         ORDER BY timestamp",
        label = quote_identifier(&table.label_column),
        database = quote_identifier(database),
        source_table = quote_identifier(&table.source_table),
    );
    sql
}
