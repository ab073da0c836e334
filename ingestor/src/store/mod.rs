//! Persistence seams of the ingestion core.
//!
//! - [`ReadingStore`]: append-only time series of readings.
//! - [`DashboardRegistry`]: read access to dashboards plus the conditional
//!   write of a field's cached current value.
//!
//! [`PgStore`] implements both against Postgres, [`MemoryStore`] in-process.

pub mod memory;
pub mod postgres;

use crate::errors::{Error, Result};
use crate::model::{Dashboard, FieldDescriptor, NewReading, Reading};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Bounds of a series lookup. `from`/`to` are inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesQuery {
    pub dashboard_id: String,
    pub field_name: String,
    pub from: DateTime<FixedOffset>,
    pub to: DateTime<FixedOffset>,
    pub limit: usize,
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Persists exactly one record. Identical payloads are never deduplicated.
    ///
    /// `deadline` bounds the work up to the point of commit. Once the commit
    /// is under way the call runs to completion, so `Ok` and durable coincide.
    async fn append(&self, reading: &NewReading, deadline: Option<Duration>) -> Result<Uuid>;

    /// The newest `limit` readings inside the window, returned oldest-first.
    async fn query(&self, query: &SeriesQuery) -> Result<Vec<Reading>>;

    /// Newest reading of a field by event time, if any.
    async fn latest(&self, dashboard_id: &str, field_name: &str) -> Result<Option<Reading>>;

    /// Number of readings for a dashboard, optionally narrowed to one field.
    async fn count(&self, dashboard_id: &str, field_name: Option<&str>) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}

#[async_trait]
pub trait DashboardRegistry: Send + Sync {
    async fn dashboard(&self, dashboard_id: &str) -> Result<Option<Dashboard>>;

    async fn dashboard_by_api_key(&self, api_key: &str) -> Result<Option<Dashboard>>;

    async fn dashboard_ids(&self) -> Result<Vec<String>>;

    async fn field(&self, dashboard_id: &str, field_name: &str) -> Result<Option<FieldDescriptor>>;

    /// Sets `last_value`/`last_update` only if `timestamp` is strictly later
    /// than the cached `last_update` (or none is cached). Returns whether the
    /// descriptor changed. Unknown fields are left alone and return `false`.
    async fn store_field_cache(
        &self,
        dashboard_id: &str,
        field_name: &str,
        value: f64,
        timestamp: DateTime<FixedOffset>,
    ) -> Result<bool>;
}

/// Runs `stage` under `deadline`, then drives `finish` on its output with no
/// deadline. When the deadline hits, `stage` is dropped and `finish` never runs.
pub(crate) async fn deadline_before_commit<T, U, S, F, Fut>(
    deadline: Option<Duration>,
    stage: S,
    finish: F,
) -> Result<U>
where
    S: Future<Output = Result<T>>,
    F: FnOnce(T) -> Fut,
    Fut: Future<Output = Result<U>>,
{
    let staged = match deadline {
        None => stage.await?,
        Some(limit) => timeout(limit, stage)
            .await
            .map_err(|_| Error::DeadlineExceeded(limit))??,
    };
    finish(staged).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_slow_commit_outlives_deadline() {
        let result = deadline_before_commit(
            Some(Duration::from_millis(50)),
            async { Ok(7) },
            |n| async move {
                sleep(Duration::from_millis(200)).await;
                Ok(n * 2)
            },
        )
        .await;

        assert_eq!(result.unwrap(), 14);
    }

    #[tokio::test]
    async fn test_slow_stage_never_reaches_commit() {
        let committed = AtomicBool::new(false);

        let result = deadline_before_commit(
            Some(Duration::from_millis(20)),
            async {
                sleep(Duration::from_millis(500)).await;
                Ok(())
            },
            |()| async {
                committed.store(true, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert!(matches!(result, Err(Error::DeadlineExceeded(_))));
        assert!(!committed.load(Ordering::SeqCst));
    }
}
