use super::{DashboardRegistry, ReadingStore, SeriesQuery};
use crate::errors::Result;
use crate::model::{Dashboard, FieldDescriptor, NewReading, Reading};
use crate::timestamp::is_newer;
use crate::validate::validate;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-process store holding dashboards and readings behind one lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    dashboards: BTreeMap<String, Dashboard>,
    readings: Vec<Reading>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a dashboard.
    pub async fn insert_dashboard(&self, dashboard: Dashboard) {
        let mut state = self.state.write().await;
        state.dashboards.insert(dashboard.id.clone(), dashboard);
    }

    /// Removes a dashboard together with all of its readings.
    pub async fn remove_dashboard(&self, dashboard_id: &str) -> bool {
        let mut state = self.state.write().await;
        state.readings.retain(|r| r.dashboard_id != dashboard_id);
        state.dashboards.remove(dashboard_id).is_some()
    }

    /// Snapshot of every stored reading in append order.
    pub async fn readings(&self) -> Vec<Reading> {
        self.state.read().await.readings.clone()
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn append(&self, reading: &NewReading, _deadline: Option<Duration>) -> Result<Uuid> {
        validate(reading)?;
        let id = Uuid::new_v4();
        let mut state = self.state.write().await;
        state.readings.push(Reading::from_new(id, reading.clone()));
        Ok(id)
    }

    async fn query(&self, query: &SeriesQuery) -> Result<Vec<Reading>> {
        let state = self.state.read().await;
        let mut matching: Vec<Reading> = state
            .readings
            .iter()
            .filter(|r| {
                r.dashboard_id == query.dashboard_id
                    && r.field_name == query.field_name
                    && r.timestamp >= query.from
                    && r.timestamp <= query.to
            })
            .cloned()
            .collect();

        // Stable sort keeps append order among equal timestamps
        matching.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let skip = matching.len().saturating_sub(query.limit);
        Ok(matching.split_off(skip))
    }

    async fn latest(&self, dashboard_id: &str, field_name: &str) -> Result<Option<Reading>> {
        let state = self.state.read().await;
        Ok(state
            .readings
            .iter()
            .filter(|r| r.dashboard_id == dashboard_id && r.field_name == field_name)
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp))
            .cloned())
    }

    async fn count(&self, dashboard_id: &str, field_name: Option<&str>) -> Result<u64> {
        let state = self.state.read().await;
        let count = state
            .readings
            .iter()
            .filter(|r| r.dashboard_id == dashboard_id)
            .filter(|r| field_name.map_or(true, |f| r.field_name == f))
            .count();
        Ok(count as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl DashboardRegistry for MemoryStore {
    async fn dashboard(&self, dashboard_id: &str) -> Result<Option<Dashboard>> {
        Ok(self.state.read().await.dashboards.get(dashboard_id).cloned())
    }

    async fn dashboard_by_api_key(&self, api_key: &str) -> Result<Option<Dashboard>> {
        let state = self.state.read().await;
        Ok(state
            .dashboards
            .values()
            .find(|d| d.api_key == api_key)
            .cloned())
    }

    async fn dashboard_ids(&self) -> Result<Vec<String>> {
        Ok(self.state.read().await.dashboards.keys().cloned().collect())
    }

    async fn field(&self, dashboard_id: &str, field_name: &str) -> Result<Option<FieldDescriptor>> {
        let state = self.state.read().await;
        Ok(state
            .dashboards
            .get(dashboard_id)
            .and_then(|d| d.field(field_name))
            .cloned())
    }

    async fn store_field_cache(
        &self,
        dashboard_id: &str,
        field_name: &str,
        value: f64,
        timestamp: DateTime<FixedOffset>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(dashboard) = state.dashboards.get_mut(dashboard_id) else {
            return Ok(false);
        };
        let Some(field) = dashboard.fields.iter_mut().find(|f| f.name == field_name) else {
            return Ok(false);
        };
        if !is_newer(&timestamp, field.last_update.as_ref()) {
            return Ok(false);
        }

        field.last_value = Some(value);
        field.last_update = Some(timestamp);
        dashboard.updated_at = Utc::now().fixed_offset();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReadingSource;
    use chrono::Duration;
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
            fields: vec![FieldDescriptor::numeric("Temp", Some("C"))],
            updated_at: Utc::now().fixed_offset(),
        }
    }

    fn reading(value: f64, timestamp: DateTime<FixedOffset>) -> NewReading {
        NewReading {
            dashboard_id: "d1".to_string(),
            field_name: "Temp".to_string(),
            value,
            timestamp,
            source: ReadingSource::Device,
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_append_never_dedups() {
        let store = MemoryStore::new();
        let ts = Utc::now().fixed_offset();

        let first = store.append(&reading(1.0, ts), None).await.unwrap();
        let second = store.append(&reading(1.0, ts), None).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(store.count("d1", Some("Temp")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_query_keeps_newest_in_chronological_order() {
        let store = MemoryStore::new();
        let now = Utc::now().fixed_offset();
        // Appended out of order on purpose
        for (value, mins) in [(3.0, 30), (1.0, 50), (5.0, 10), (2.0, 40), (4.0, 20)] {
            store
                .append(&reading(value, now - Duration::minutes(mins)), None)
                .await
                .unwrap();
        }

        let series = store
            .query(&SeriesQuery {
                dashboard_id: "d1".to_string(),
                field_name: "Temp".to_string(),
                from: now - Duration::hours(1),
                to: now,
                limit: 2,
            })
            .await
            .unwrap();

        let values: Vec<f64> = series.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![4.0, 5.0]);
    }

    #[tokio::test]
    async fn test_cache_only_moves_forward() {
        let store = MemoryStore::new();
        store.insert_dashboard(dashboard()).await;
        let now = Utc::now().fixed_offset();

        assert!(store.store_field_cache("d1", "Temp", 26.0, now).await.unwrap());
        assert!(!store
            .store_field_cache("d1", "Temp", 20.0, now - Duration::hours(10))
            .await
            .unwrap());
        assert!(!store.store_field_cache("d1", "Temp", 27.0, now).await.unwrap());

        let field = store.field("d1", "Temp").await.unwrap().unwrap();
        assert_eq!(field.last_value, Some(26.0));
        assert_eq!(field.last_update, Some(now));
    }

    #[tokio::test]
    async fn test_unknown_field_cache_write_is_noop() {
        let store = MemoryStore::new();
        store.insert_dashboard(dashboard()).await;
        let now = Utc::now().fixed_offset();

        assert!(!store.store_field_cache("d1", "Level", 1.0, now).await.unwrap());
        assert!(!store.store_field_cache("d9", "Temp", 1.0, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_dashboard_cascades() {
        let store = MemoryStore::new();
        store.insert_dashboard(dashboard()).await;
        store.append(&reading(1.0, Utc::now().fixed_offset()), None).await.unwrap();

        assert!(store.remove_dashboard("d1").await);
        assert_eq!(store.count("d1", None).await.unwrap(), 0);
        assert!(store.dashboard("d1").await.unwrap().is_none());
    }
}
