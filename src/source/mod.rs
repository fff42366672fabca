pub mod clickhouse;

use std::future::Future;

use crate::config::TableConfig;
use crate::pipeline::error::CollectionError;
use crate::pipeline::sample::{Sample, Window};

pub use self::clickhouse::ClickHouseSource;

/// Supplies raw samples for one table and window.
pub trait SampleSource: Send + Sync {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Fetch every raw sample of `table` whose timestamp falls in `window`.
    ///
    /// Samples should be in chronological order. Readings the upstream
    /// could not produce are returned as `Reading::Absent`.
    fn fetch(
        &self,
        table: &TableConfig,
        window: Window,
    ) -> impl Future<Output = Result<Vec<Sample>, CollectionError>> + Send;
}
