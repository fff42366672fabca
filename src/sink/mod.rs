pub mod clickhouse;
pub mod http;

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::pipeline::error::SinkError;
use crate::pipeline::sample::EmittedRecord;

pub use self::clickhouse::ClickHouseSink;
pub use self::http::HttpSink;

/// Sink bulk-persists the records emitted for one table run.
///
/// Implementations own transactionality and idempotence; the reduction
/// core makes no cross-run uniqueness guarantee.
pub trait Sink: Send + Sync {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Persist `records` into `target`, in order. Returns the rows written.
    fn write(
        &self,
        target: &str,
        records: &[EmittedRecord],
    ) -> impl Future<Output = Result<usize, SinkError>> + Send;
}

/// Output dispatches emitted records to the configured backend.
///
/// Uses enum dispatch rather than trait objects, as async trait methods
/// are not object safe.
pub enum Output {
    ClickHouse(ClickHouseSink),
    Http(HttpSink),
}

impl Sink for Output {
    fn name(&self) -> &str {
        match self {
            Self::ClickHouse(s) => s.name(),
            Self::Http(s) => s.name(),
        }
    }

    async fn write(&self, target: &str, records: &[EmittedRecord]) -> Result<usize, SinkError> {
        match self {
            Self::ClickHouse(s) => s.write(target, records).await,
            Self::Http(s) => s.write(target, records).await,
        }
    }
}

/// Formats a timestamp as "2006-01-02 15:04:05.000" in UTC.
pub(crate) fn format_datetime(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}
