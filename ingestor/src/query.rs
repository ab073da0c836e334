use crate::errors::{Error, Result};
use crate::model::{Dashboard, FieldDescriptor, Reading, TimeRange};
use crate::store::{ReadingStore, SeriesQuery};
use chrono::{Duration, FixedOffset};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DEFAULT_HOURS: u32 = 24;
pub const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Serialize)]
pub struct DashboardSeries {
    pub dashboard_id: String,
    pub dashboard_name: String,
    pub time_range: TimeRange,
    pub fields: BTreeMap<String, Vec<Reading>>,
}

#[derive(Debug, Serialize)]
pub struct DashboardStats {
    pub dashboard_id: String,
    pub dashboard_name: String,
    pub fields: Vec<String>,
    pub data_counts: BTreeMap<String, u64>,
    pub total_data_points: u64,
}

/// Read side for charting. Callers have already checked access.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn ReadingStore>,
    display_offset: FixedOffset,
    max_limit: usize,
}

impl QueryService {
    pub fn new(store: Arc<dyn ReadingStore>, display_offset: FixedOffset, max_limit: usize) -> Self {
        Self {
            store,
            display_offset,
            max_limit,
        }
    }

    /// Window ending now, rendered in the display offset. Lookbacks reaching
    /// past the representable calendar are a validation error.
    pub fn last_hours(&self, hours: u32) -> Result<TimeRange> {
        let end = crate::timestamp::now_in(self.display_offset);
        let start = end
            .checked_sub_signed(Duration::hours(i64::from(hours)))
            .ok_or_else(|| Error::Validation(format!("hours={} reaches too far back", hours)))?;
        Ok(TimeRange { start, end, hours })
    }

    /// The most recent `limit` readings of one field inside `window`,
    /// oldest first. Older readings past the limit are left out.
    pub async fn series_for(
        &self,
        dashboard_id: &str,
        field_name: &str,
        window: &TimeRange,
        limit: usize,
    ) -> Result<Vec<Reading>> {
        let readings = self
            .store
            .query(&SeriesQuery {
                dashboard_id: dashboard_id.to_string(),
                field_name: field_name.to_string(),
                from: window.start,
                to: window.end,
                limit: limit.min(self.max_limit),
            })
            .await?;

        Ok(readings
            .into_iter()
            .map(|r| r.with_offset(self.display_offset))
            .collect())
    }

    /// `series_for` applied to every declared field, `limit` per field.
    pub async fn series_for_all(
        &self,
        dashboard: &Dashboard,
        window: TimeRange,
        limit: usize,
    ) -> Result<DashboardSeries> {
        let mut fields = BTreeMap::new();
        for field in &dashboard.fields {
            let series = self
                .series_for(&dashboard.id, &field.name, &window, limit)
                .await?;
            fields.insert(field.name.clone(), series);
        }

        Ok(DashboardSeries {
            dashboard_id: dashboard.id.clone(),
            dashboard_name: dashboard.name.clone(),
            time_range: window,
            fields,
        })
    }

    /// Cached current values straight from the field registry.
    pub fn current_values(&self, dashboard: &Dashboard) -> Vec<FieldDescriptor> {
        dashboard
            .fields
            .iter()
            .cloned()
            .map(|mut f| {
                f.last_update = f.last_update.map(|ts| ts.with_timezone(&self.display_offset));
                f
            })
            .collect()
    }

    pub async fn stats(&self, dashboard: &Dashboard) -> Result<DashboardStats> {
        let mut data_counts = BTreeMap::new();
        for field in &dashboard.fields {
            let count = self.store.count(&dashboard.id, Some(&field.name)).await?;
            data_counts.insert(field.name.clone(), count);
        }

        Ok(DashboardStats {
            dashboard_id: dashboard.id.clone(),
            dashboard_name: dashboard.name.clone(),
            fields: dashboard.fields.iter().map(|f| f.name.clone()).collect(),
            data_counts,
            total_data_points: self.store.count(&dashboard.id, None).await?,
        })
    }
}
