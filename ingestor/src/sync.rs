//! Field cache synchronization.
//!
//! `reconcile` is the only path that writes a field's `last_value` and
//! `last_update`. It applies last-writer-wins by event time: a reading older
//! than the cached one never overwrites it, whatever order they arrive in.
//! Calls for the same (dashboard, field) pair are serialized through a
//! per-field async mutex; different fields proceed in parallel.

use crate::errors::Result;
use crate::metrics::CACHE_REPAIRED_TOTAL;
use crate::store::{DashboardRegistry, ReadingStore};
use crate::timestamp::is_newer;
use chrono::{DateTime, FixedOffset};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::interval;
use tracing::{debug, error, info};

type FieldKey = (String, String);

#[derive(Clone)]
pub struct CacheSynchronizer {
    registry: Arc<dyn DashboardRegistry>,
    locks: Arc<DashMap<FieldKey, Arc<Mutex<()>>>>,
}

impl CacheSynchronizer {
    pub fn new(registry: Arc<dyn DashboardRegistry>) -> Self {
        Self {
            registry,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, dashboard_id: &str, field_name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry((dashboard_id.to_string(), field_name.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Moves the field's cached value to `(value, timestamp)` if the timestamp
    /// is strictly later than the cached one. Returns whether anything changed.
    pub async fn reconcile(
        &self,
        dashboard_id: &str,
        field_name: &str,
        value: f64,
        timestamp: DateTime<FixedOffset>,
    ) -> Result<bool> {
        let lock = self.lock_for(dashboard_id, field_name);
        let _guard = lock.lock().await;

        let Some(field) = self.registry.field(dashboard_id, field_name).await? else {
            debug!(
                "Field {} of dashboard {} vanished before reconcile",
                field_name, dashboard_id
            );
            return Ok(false);
        };

        if !is_newer(&timestamp, field.last_update.as_ref()) {
            debug!(
                "Keeping cached {}/{} at {:?}, incoming {} is not newer",
                dashboard_id, field_name, field.last_update, timestamp
            );
            return Ok(false);
        }

        self.registry
            .store_field_cache(dashboard_id, field_name, value, timestamp)
            .await
    }

    /// Replays the newest stored reading of every field through `reconcile`.
    ///
    /// Repairs descriptors left stale by a failed cache write; since
    /// `reconcile` only ever moves forward it is safe next to live ingestion.
    pub async fn rebuild(&self, store: &dyn ReadingStore) -> Result<usize> {
        let mut repaired = 0;

        for dashboard_id in self.registry.dashboard_ids().await? {
            let Some(dashboard) = self.registry.dashboard(&dashboard_id).await? else {
                continue;
            };

            for field in &dashboard.fields {
                let Some(latest) = store.latest(&dashboard.id, &field.name).await? else {
                    continue;
                };
                if self
                    .reconcile(&dashboard.id, &field.name, latest.value, latest.timestamp)
                    .await?
                {
                    info!(
                        "Cache rebuild moved {}/{} forward to {}",
                        dashboard.id, field.name, latest.timestamp
                    );
                    repaired += 1;
                }
            }
        }

        CACHE_REPAIRED_TOTAL.inc_by(repaired as f64);
        Ok(repaired)
    }
}

/// Periodically rebuilds field caches from the store until shutdown.
pub async fn run_cache_rebuild(
    synchronizer: CacheSynchronizer,
    store: Arc<dyn ReadingStore>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting cache rebuild every {:?}", every);
    let mut ticker = interval(every);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match synchronizer.rebuild(store.as_ref()).await {
                    Ok(0) => debug!("Cache rebuild found nothing stale"),
                    Ok(n) => info!("Cache rebuild repaired {} field(s)", n),
                    Err(e) => error!("Cache rebuild failed: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    info!("Cache rebuild stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dashboard, FieldDescriptor, NewReading, ReadingSource};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use rand::seq::SliceRandom;
    use serde_json::Map;

    fn dashboard() -> Dashboard {
        Dashboard {
            id: "d1".to_string(),
            name: "Tank".to_string(),
            api_key: "key-1".to_string(),
            privileged: false,
            is_public: false,
            created_by: None,
            assigned_users: vec![],
            fields: vec![
                FieldDescriptor::numeric("Temp", Some("C")),
                FieldDescriptor::numeric("Level", Some("%")),
            ],
            updated_at: Utc::now().fixed_offset(),
        }
    }

    async fn memory_sync() -> (Arc<MemoryStore>, CacheSynchronizer) {
        let store = Arc::new(MemoryStore::new());
        store.insert_dashboard(dashboard()).await;
        let sync = CacheSynchronizer::new(store.clone());
        (store, sync)
    }

    #[tokio::test]
    async fn test_newer_reading_wins_regardless_of_order() {
        let (store, sync) = memory_sync().await;
        let t = Utc::now().fixed_offset();
        let earlier = t - ChronoDuration::hours(10);

        assert!(sync.reconcile("d1", "Temp", 26.0, t).await.unwrap());
        assert!(!sync.reconcile("d1", "Temp", 20.0, earlier).await.unwrap());

        let field = store.field("d1", "Temp").await.unwrap().unwrap();
        assert_eq!(field.last_value, Some(26.0));
        assert_eq!(field.last_update, Some(t));
    }

    #[tokio::test]
    async fn test_equal_timestamp_is_ignored() {
        let (store, sync) = memory_sync().await;
        let t = Utc::now().fixed_offset();

        assert!(sync.reconcile("d1", "Temp", 1.0, t).await.unwrap());
        assert!(!sync.reconcile("d1", "Temp", 2.0, t).await.unwrap());

        let field = store.field("d1", "Temp").await.unwrap().unwrap();
        assert_eq!(field.last_value, Some(1.0));
    }

    #[tokio::test]
    async fn test_naive_and_utc_equivalent_do_not_overwrite() {
        let (store, sync) = memory_sync().await;
        let aware = crate::timestamp::parse_timestamp("2024-05-01T10:00:00+00:00").unwrap();
        let naive = crate::timestamp::parse_timestamp("2024-05-01 10:00:00").unwrap();

        assert!(sync.reconcile("d1", "Temp", 1.0, aware).await.unwrap());
        assert!(!sync.reconcile("d1", "Temp", 2.0, naive).await.unwrap());
        assert_eq!(
            store.field("d1", "Temp").await.unwrap().unwrap().last_value,
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_unknown_field_is_not_updated() {
        let (_store, sync) = memory_sync().await;
        let t = Utc::now().fixed_offset();
        assert!(!sync.reconcile("d1", "Pressure", 1.0, t).await.unwrap());
    }

    #[tokio::test]
    async fn test_rebuild_repairs_stale_cache() {
        let (store, sync) = memory_sync().await;
        let t = Utc::now().fixed_offset();

        // Appended but never reconciled, as after a failed cache write
        store
            .append(
                &NewReading {
                    dashboard_id: "d1".to_string(),
                    field_name: "Level".to_string(),
                    value: 64.5,
                    timestamp: t,
                    source: ReadingSource::Mqtt,
                    metadata: Map::new(),
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(sync.rebuild(store.as_ref()).await.unwrap(), 1);
        assert_eq!(sync.rebuild(store.as_ref()).await.unwrap(), 0);

        let field = store.field("d1", "Level").await.unwrap().unwrap();
        assert_eq!(field.last_value, Some(64.5));
        assert_eq!(field.last_update, Some(t));
    }

    /// Registry whose write is a blind overwrite, so only the per-field lock
    /// keeps concurrent reconciles from losing the newest value.
    #[derive(Default)]
    struct BlindRegistry {
        cached: std::sync::Mutex<(Option<f64>, Option<DateTime<FixedOffset>>)>,
    }

    #[async_trait]
    impl DashboardRegistry for BlindRegistry {
        async fn dashboard(&self, _id: &str) -> Result<Option<Dashboard>> {
            Ok(None)
        }

        async fn dashboard_by_api_key(&self, _key: &str) -> Result<Option<Dashboard>> {
            Ok(None)
        }

        async fn dashboard_ids(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn field(&self, _d: &str, name: &str) -> Result<Option<FieldDescriptor>> {
            let (last_value, last_update) = *self.cached.lock().unwrap();
            tokio::task::yield_now().await;
            Ok(Some(FieldDescriptor {
                last_value,
                last_update,
                ..FieldDescriptor::numeric(name, None)
            }))
        }

        async fn store_field_cache(
            &self,
            _d: &str,
            _f: &str,
            value: f64,
            timestamp: DateTime<FixedOffset>,
        ) -> Result<bool> {
            tokio::task::yield_now().await;
            *self.cached.lock().unwrap() = (Some(value), Some(timestamp));
            Ok(true)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reconciles_keep_latest() {
        let registry = Arc::new(BlindRegistry::default());
        let sync = CacheSynchronizer::new(registry.clone());
        let base = Utc::now().fixed_offset();

        let mut offsets: Vec<i64> = (0..64).collect();
        offsets.shuffle(&mut rand::thread_rng());

        let handles: Vec<_> = offsets
            .into_iter()
            .map(|i| {
                let sync = sync.clone();
                tokio::spawn(async move {
                    sync.reconcile("d1", "Temp", i as f64, base + ChronoDuration::seconds(i))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let (value, ts) = *registry.cached.lock().unwrap();
        assert_eq!(value, Some(63.0));
        assert_eq!(ts, Some(base + ChronoDuration::seconds(63)));
    }
}
