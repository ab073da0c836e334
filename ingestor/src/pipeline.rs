use crate::errors::IngestError;
use crate::metrics::{CACHE_OUTCOMES_TOTAL, INGEST_LATENCY_SECONDS, READINGS_TOTAL};
use crate::model::{CacheOutcome, IngestReceipt, NewReading};
use crate::store::ReadingStore;
use crate::sync::CacheSynchronizer;
use crate::validate::validate;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// The single `Ingest` operation every gateway funnels into: append the
/// reading, then reconcile the field cache.
#[derive(Clone)]
pub struct IngestPipeline {
    store: Arc<dyn ReadingStore>,
    synchronizer: CacheSynchronizer,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn ReadingStore>, synchronizer: CacheSynchronizer) -> Self {
        Self {
            store,
            synchronizer,
        }
    }

    /// Ingests an already authorized and resolved reading.
    ///
    /// `deadline` bounds the append up to its commit; a reading that reaches
    /// commit is reported as stored and the cache reconcile always runs to
    /// completion. A cache failure is logged
    /// and reported as [`CacheOutcome::Failed`] but does not fail the call.
    pub async fn ingest(
        &self,
        reading: NewReading,
        deadline: Option<Duration>,
    ) -> std::result::Result<IngestReceipt, IngestError> {
        validate(&reading)?;
        let start = Instant::now();

        let reading_id = self.store.append(&reading, deadline).await.map_err(|e| {
            let e = IngestError::from(e);
            error!(
                "Failed to append {} reading for {}/{}: {}",
                reading.source, reading.dashboard_id, reading.field_name, e
            );
            e
        })?;
        READINGS_TOTAL
            .with_label_values(&[reading.source.as_str()])
            .inc();

        let cache = match self
            .synchronizer
            .reconcile(
                &reading.dashboard_id,
                &reading.field_name,
                reading.value,
                reading.timestamp,
            )
            .await
        {
            Ok(true) => CacheOutcome::Updated,
            Ok(false) => CacheOutcome::Unchanged,
            Err(e) => {
                warn!(
                    "Reading {} stored but cache for {}/{} not refreshed: {}",
                    reading_id, reading.dashboard_id, reading.field_name, e
                );
                CacheOutcome::Failed
            }
        };
        CACHE_OUTCOMES_TOTAL
            .with_label_values(&[cache.as_str()])
            .inc();
        INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());

        debug!(
            "Ingested {} = {} at {} for {}/{} (cache {})",
            reading_id,
            reading.value,
            reading.timestamp,
            reading.dashboard_id,
            reading.field_name,
            cache.as_str()
        );

        Ok(IngestReceipt {
            reading_id,
            value: reading.value,
            timestamp: reading.timestamp,
            cache,
        })
    }
}
