use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Which ingestion path produced a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadingSource {
    Device,
    Mqtt,
    Manual,
    AdminBackfill,
}

impl ReadingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingSource::Device => "device",
            ReadingSource::Mqtt => "mqtt",
            ReadingSource::Manual => "manual",
            ReadingSource::AdminBackfill => "admin-backfill",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "device" => Some(ReadingSource::Device),
            "mqtt" => Some(ReadingSource::Mqtt),
            "manual" => Some(ReadingSource::Manual),
            "admin-backfill" => Some(ReadingSource::AdminBackfill),
            _ => None,
        }
    }
}

impl fmt::Display for ReadingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reading as handed to the store, before it has an identity.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub dashboard_id: String,
    pub field_name: String,
    pub value: f64,
    pub timestamp: DateTime<FixedOffset>,
    pub source: ReadingSource,
    pub metadata: Map<String, Value>,
}

/// One persisted, immutable measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub id: Uuid,
    pub dashboard_id: String,
    pub field_name: String,
    pub value: f64,
    pub timestamp: DateTime<FixedOffset>,
    pub source: ReadingSource,
    pub metadata: Map<String, Value>,
}

impl Reading {
    pub fn from_new(id: Uuid, new: NewReading) -> Self {
        Self {
            id,
            dashboard_id: new.dashboard_id,
            field_name: new.field_name,
            value: new.value,
            timestamp: new.timestamp,
            source: new.source,
            metadata: new.metadata,
        }
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.timestamp = self.timestamp.with_timezone(&offset);
        self
    }
}

/// Element of a dashboard's field registry. `last_value`/`last_update` are a
/// cache of the newest accepted reading, never the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub declared_type: String,
    pub unit: Option<String>,
    pub last_value: Option<f64>,
    pub last_update: Option<DateTime<FixedOffset>>,
}

impl FieldDescriptor {
    pub fn numeric(name: impl Into<String>, unit: Option<&str>) -> Self {
        Self {
            name: name.into(),
            declared_type: "numeric".to_string(),
            unit: unit.map(str::to_string),
            last_value: None,
            last_update: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Device calls against a privileged dashboard may carry their own timestamps.
    pub privileged: bool,
    pub is_public: bool,
    pub created_by: Option<String>,
    pub assigned_users: Vec<String>,
    pub fields: Vec<FieldDescriptor>,
    pub updated_at: DateTime<FixedOffset>,
}

impl Dashboard {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn is_visible_to(&self, user_id: &str, is_admin: bool) -> bool {
        is_admin
            || self.is_public
            || self.created_by.as_deref() == Some(user_id)
            || self.assigned_users.iter().any(|u| u == user_id)
    }
}

/// Whether `Reconcile` touched the field descriptor for an ingested reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Updated,
    Unchanged,
    /// The reading is stored but the cached value could not be refreshed.
    Failed,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Updated => "updated",
            CacheOutcome::Unchanged => "unchanged",
            CacheOutcome::Failed => "failed",
        }
    }
}

/// Result of a successful `Ingest`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReceipt {
    pub reading_id: Uuid,
    pub value: f64,
    pub timestamp: DateTime<FixedOffset>,
    pub cache: CacheOutcome,
}

/// JSON body of the device gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceIngestRequest {
    pub dashboard_id: String,
    pub field_name: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub value: f64,
    #[serde(default, deserialize_with = "crate::timestamp::deserialize_optional")]
    pub timestamp: Option<DateTime<FixedOffset>>,
}

/// JSON body of the manual (backfill) gateway; the target comes from the path.
#[derive(Debug, Clone, Deserialize)]
pub struct ManualIngestRequest {
    #[serde(deserialize_with = "lenient_f64")]
    pub value: f64,
    #[serde(default, deserialize_with = "crate::timestamp::deserialize_optional")]
    pub timestamp: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

/// Accepts a JSON number or a string holding a decimal literal.
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(f64),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(v) => Ok(v),
        NumberOrString::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("'{}' is not a number", s))),
    }
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub message: &'static str,
    pub data_point_id: Uuid,
    pub value: f64,
    pub timestamp: String,
    pub cache: CacheOutcome,
}

impl From<IngestReceipt> for IngestResponse {
    fn from(receipt: IngestReceipt) -> Self {
        Self {
            message: "Data point ingested successfully",
            data_point_id: receipt.reading_id,
            value: receipt.value,
            timestamp: receipt.timestamp.to_rfc3339(),
            cache: receipt.cache,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TimeRange {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub hours: u32,
}
