use super::{deadline_before_commit, DashboardRegistry, ReadingStore, SeriesQuery};
use crate::errors::{Error, Result};
use crate::model::{Dashboard, FieldDescriptor, NewReading, Reading, ReadingSource};
use crate::validate::validate;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Postgres-backed reading store and dashboard registry.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn load_fields(&self, dashboard_id: &str) -> Result<Vec<FieldDescriptor>> {
        let rows = sqlx::query_as::<_, FieldRow>(
            r#"
            SELECT name, declared_type, unit, last_value, last_update
            FROM dashboard_fields
            WHERE dashboard_id = $1
            ORDER BY position, name
            "#,
        )
        .bind(dashboard_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FieldDescriptor::from).collect())
    }

    async fn hydrate(&self, row: Option<DashboardRow>) -> Result<Option<Dashboard>> {
        let Some(row) = row else {
            return Ok(None);
        };
        let fields = self.load_fields(&row.id).await?;
        Ok(Some(row.into_dashboard(fields)))
    }
}

const DASHBOARD_COLUMNS: &str =
    "id, name, api_key, privileged, is_public, created_by, assigned_users, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct DashboardRow {
    id: String,
    name: String,
    api_key: String,
    privileged: bool,
    is_public: bool,
    created_by: Option<String>,
    assigned_users: Vec<String>,
    updated_at: DateTime<Utc>,
}

impl DashboardRow {
    fn into_dashboard(self, fields: Vec<FieldDescriptor>) -> Dashboard {
        Dashboard {
            id: self.id,
            name: self.name,
            api_key: self.api_key,
            privileged: self.privileged,
            is_public: self.is_public,
            created_by: self.created_by,
            assigned_users: self.assigned_users,
            fields,
            updated_at: self.updated_at.fixed_offset(),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FieldRow {
    name: String,
    declared_type: String,
    unit: Option<String>,
    last_value: Option<f64>,
    last_update: Option<DateTime<Utc>>,
}

impl From<FieldRow> for FieldDescriptor {
    fn from(row: FieldRow) -> Self {
        Self {
            name: row.name,
            declared_type: row.declared_type,
            unit: row.unit,
            last_value: row.last_value,
            last_update: row.last_update.map(|ts| ts.fixed_offset()),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReadingRow {
    id: Uuid,
    dashboard_id: String,
    field_name: String,
    value: f64,
    ts: DateTime<Utc>,
    source: String,
    metadata: Json<Value>,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = Error;

    fn try_from(row: ReadingRow) -> Result<Self> {
        let source = ReadingSource::parse(&row.source)
            .ok_or_else(|| Error::Validation(format!("Unknown reading source '{}'", row.source)))?;
        let metadata = match row.metadata.0 {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        Ok(Reading {
            id: row.id,
            dashboard_id: row.dashboard_id,
            field_name: row.field_name,
            value: row.value,
            timestamp: row.ts.fixed_offset(),
            source,
            metadata,
        })
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn append(&self, reading: &NewReading, deadline: Option<Duration>) -> Result<Uuid> {
        validate(reading)?;
        let id = Uuid::new_v4();

        // A deadline hit drops the open transaction, which rolls the insert back
        let insert = async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO readings (id, dashboard_id, field_name, value, ts, source, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(id)
            .bind(&reading.dashboard_id)
            .bind(&reading.field_name)
            .bind(reading.value)
            .bind(reading.timestamp.with_timezone(&Utc))
            .bind(reading.source.as_str())
            .bind(Json(&reading.metadata))
            .execute(&mut *tx)
            .await?;
            Ok::<_, Error>(tx)
        };

        deadline_before_commit(deadline, insert, |tx| async move {
            tx.commit().await?;
            Ok(id)
        })
        .await
    }

    async fn query(&self, query: &SeriesQuery) -> Result<Vec<Reading>> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT id, dashboard_id, field_name, value, ts, source, metadata
            FROM readings
            WHERE dashboard_id = $1 AND field_name = $2 AND ts >= $3 AND ts <= $4
            ORDER BY ts DESC
            LIMIT $5
            "#,
        )
        .bind(&query.dashboard_id)
        .bind(&query.field_name)
        .bind(query.from.with_timezone(&Utc))
        .bind(query.to.with_timezone(&Utc))
        .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut readings = rows
            .into_iter()
            .map(Reading::try_from)
            .collect::<Result<Vec<_>>>()?;
        readings.reverse();
        Ok(readings)
    }

    async fn latest(&self, dashboard_id: &str, field_name: &str) -> Result<Option<Reading>> {
        let row = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT id, dashboard_id, field_name, value, ts, source, metadata
            FROM readings
            WHERE dashboard_id = $1 AND field_name = $2
            ORDER BY ts DESC
            LIMIT 1
            "#,
        )
        .bind(dashboard_id)
        .bind(field_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Reading::try_from).transpose()
    }

    async fn count(&self, dashboard_id: &str, field_name: Option<&str>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM readings
            WHERE dashboard_id = $1 AND ($2::text IS NULL OR field_name = $2)
            "#,
        )
        .bind(dashboard_id)
        .bind(field_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DashboardRegistry for PgStore {
    async fn dashboard(&self, dashboard_id: &str) -> Result<Option<Dashboard>> {
        let row = sqlx::query_as::<_, DashboardRow>(&format!(
            "SELECT {} FROM dashboards WHERE id = $1",
            DASHBOARD_COLUMNS
        ))
        .bind(dashboard_id)
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate(row).await
    }

    async fn dashboard_by_api_key(&self, api_key: &str) -> Result<Option<Dashboard>> {
        let row = sqlx::query_as::<_, DashboardRow>(&format!(
            "SELECT {} FROM dashboards WHERE api_key = $1",
            DASHBOARD_COLUMNS
        ))
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate(row).await
    }

    async fn dashboard_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM dashboards ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn field(&self, dashboard_id: &str, field_name: &str) -> Result<Option<FieldDescriptor>> {
        let row = sqlx::query_as::<_, FieldRow>(
            r#"
            SELECT name, declared_type, unit, last_value, last_update
            FROM dashboard_fields
            WHERE dashboard_id = $1 AND name = $2
            "#,
        )
        .bind(dashboard_id)
        .bind(field_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FieldDescriptor::from))
    }

    async fn store_field_cache(
        &self,
        dashboard_id: &str,
        field_name: &str,
        value: f64,
        timestamp: DateTime<FixedOffset>,
    ) -> Result<bool> {
        // Compare-and-set in one statement: other writers (other processes
        // included) can never move the cache backwards in event time.
        let result = sqlx::query(
            r#"
            WITH updated AS (
                UPDATE dashboard_fields
                SET last_value = $3, last_update = $4
                WHERE dashboard_id = $1
                  AND name = $2
                  AND (last_update IS NULL OR last_update < $4)
                RETURNING dashboard_id
            )
            UPDATE dashboards
            SET updated_at = now()
            WHERE id IN (SELECT dashboard_id FROM updated)
            "#,
        )
        .bind(dashboard_id)
        .bind(field_name)
        .bind(value)
        .bind(timestamp.with_timezone(&Utc))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

pub(crate) fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
