//! The three ingestion entry points.
//!
//! Each one settles its own credential, resolves the target dashboard and
//! field, decides the reading's timestamp and then hands the reading to the
//! shared [`IngestPipeline`]. Nothing here knows about HTTP or MQTT framing.

use crate::auth::Caller;
use crate::errors::IngestError;
use crate::metrics::REJECTIONS_TOTAL;
use crate::model::{
    Dashboard, DeviceIngestRequest, IngestReceipt, ManualIngestRequest, NewReading, ReadingSource,
};
use crate::mqtt::MqttReading;
use crate::pipeline::IngestPipeline;
use crate::store::DashboardRegistry;
use crate::timestamp::now_in;
use chrono::FixedOffset;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type GatewayResult = Result<IngestReceipt, IngestError>;

#[derive(Clone)]
pub struct Gateways {
    registry: Arc<dyn DashboardRegistry>,
    pipeline: IngestPipeline,
    display_offset: FixedOffset,
    request_timeout: Option<Duration>,
}

impl Gateways {
    pub fn new(
        registry: Arc<dyn DashboardRegistry>,
        pipeline: IngestPipeline,
        display_offset: FixedOffset,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            pipeline,
            display_offset,
            request_timeout,
        }
    }

    /// Device gateway: API key authenticated, server-assigned time unless the
    /// key belongs to a privileged dashboard.
    pub async fn ingest_device(&self, api_key: Option<&str>, request: DeviceIngestRequest) -> GatewayResult {
        record_rejection(self.device(api_key, request).await)
    }

    /// Manual gateway: administrators backfilling historical readings.
    pub async fn ingest_manual(
        &self,
        caller: &Caller,
        dashboard_id: &str,
        field_name: &str,
        request: ManualIngestRequest,
    ) -> GatewayResult {
        record_rejection(self.manual(caller, dashboard_id, field_name, request).await)
    }

    /// MQTT gateway: addressed by topic, always stamped on receipt.
    pub async fn ingest_mqtt(&self, message: MqttReading) -> GatewayResult {
        record_rejection(self.mqtt(message).await)
    }

    async fn device(&self, api_key: Option<&str>, request: DeviceIngestRequest) -> GatewayResult {
        let api_key = api_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| IngestError::Unauthenticated("Missing API key".to_string()))?;

        let dashboard = self
            .registry
            .dashboard_by_api_key(api_key)
            .await?
            .ok_or_else(|| IngestError::Unauthenticated("Invalid API key".to_string()))?;

        if dashboard.id != request.dashboard_id {
            return Err(IngestError::Unauthorized(
                "Provided dashboard ID does not match the API key's associated dashboard".to_string(),
            ));
        }
        if request.timestamp.is_some() && !dashboard.privileged {
            return Err(IngestError::Unauthorized(
                "Only privileged dashboards may supply their own timestamp".to_string(),
            ));
        }
        require_field(&dashboard, &request.field_name)?;

        let (timestamp, source) = match request.timestamp {
            Some(ts) => (ts, ReadingSource::AdminBackfill),
            None => (now_in(self.display_offset), ReadingSource::Device),
        };

        let mut metadata = Map::new();
        metadata.insert("api_key_hint".to_string(), Value::String(key_hint(api_key)));

        self.pipeline
            .ingest(
                NewReading {
                    dashboard_id: dashboard.id,
                    field_name: request.field_name,
                    value: request.value,
                    timestamp,
                    source,
                    metadata,
                },
                self.request_timeout,
            )
            .await
    }

    async fn manual(
        &self,
        caller: &Caller,
        dashboard_id: &str,
        field_name: &str,
        request: ManualIngestRequest,
    ) -> GatewayResult {
        if !caller.is_admin {
            return Err(IngestError::Unauthorized(
                "Only admins can add previous data points".to_string(),
            ));
        }

        let dashboard = self
            .registry
            .dashboard(dashboard_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("Dashboard '{}' not found", dashboard_id)))?;
        require_field(&dashboard, field_name)?;

        let timestamp = request.timestamp.ok_or_else(|| {
            IngestError::InvalidValue("A timestamp is required for manual insertion".to_string())
        })?;

        let mut metadata = request.metadata.unwrap_or_default();
        metadata.insert("user_id".to_string(), Value::String(caller.user_id.clone()));

        self.pipeline
            .ingest(
                NewReading {
                    dashboard_id: dashboard.id,
                    field_name: field_name.to_string(),
                    value: request.value,
                    timestamp,
                    source: ReadingSource::Manual,
                    metadata,
                },
                self.request_timeout,
            )
            .await
    }

    async fn mqtt(&self, message: MqttReading) -> GatewayResult {
        let dashboard = self
            .registry
            .dashboard(&message.dashboard_id)
            .await?
            .ok_or_else(|| {
                IngestError::NotFound(format!("Dashboard '{}' not found", message.dashboard_id))
            })?;
        require_field(&dashboard, &message.field_name)?;

        let mut metadata = Map::new();
        metadata.insert("topic".to_string(), Value::String(message.topic));

        // No deadline: nobody is waiting on the other end
        self.pipeline
            .ingest(
                NewReading {
                    dashboard_id: dashboard.id,
                    field_name: message.field_name,
                    value: message.value,
                    timestamp: message.received_at,
                    source: ReadingSource::Mqtt,
                    metadata,
                },
                None,
            )
            .await
    }
}

fn require_field(dashboard: &Dashboard, field_name: &str) -> Result<(), IngestError> {
    if dashboard.has_field(field_name) {
        Ok(())
    } else {
        Err(IngestError::NotFound(format!(
            "Field '{}' not found in dashboard '{}'",
            field_name, dashboard.id
        )))
    }
}

fn record_rejection(result: GatewayResult) -> GatewayResult {
    if let Err(e) = &result {
        debug!("Ingestion rejected: {}", e);
        REJECTIONS_TOTAL.with_label_values(&[e.code()]).inc();
    }
    result
}

/// Last four characters of a key, enough to tell keys apart in audit data.
fn key_hint(api_key: &str) -> String {
    let chars: Vec<char> = api_key.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("***{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CacheOutcome, FieldDescriptor};
    use crate::store::{MemoryStore, ReadingStore};
    use crate::sync::CacheSynchronizer;
    use chrono::{Duration as ChronoDuration, Utc};

    fn dashboard(id: &str, api_key: &str, privileged: bool) -> Dashboard {
        Dashboard {
            id: id.to_string(),
            name: format!("Tank {}", id),
            api_key: api_key.to_string(),
            privileged,
            is_public: false,
            created_by: None,
            assigned_users: vec![],
            fields: vec![FieldDescriptor::numeric("Temp", Some("C"))],
            updated_at: Utc::now().fixed_offset(),
        }
    }

    async fn gateways() -> (Arc<MemoryStore>, Gateways) {
        let store = Arc::new(MemoryStore::new());
        store.insert_dashboard(dashboard("d1", "key-d1", false)).await;
        store.insert_dashboard(dashboard("admin", "key-admin", true)).await;
        let pipeline = IngestPipeline::new(store.clone(), CacheSynchronizer::new(store.clone()));
        let offset = FixedOffset::east_opt(19_800).unwrap();
        let gateways = Gateways::new(store.clone(), pipeline, offset, None);
        (store, gateways)
    }

    fn device_request(dashboard_id: &str, with_ts: bool) -> DeviceIngestRequest {
        DeviceIngestRequest {
            dashboard_id: dashboard_id.to_string(),
            field_name: "Temp".to_string(),
            value: 25.4,
            timestamp: with_ts.then(|| Utc::now().fixed_offset() - ChronoDuration::hours(3)),
        }
    }

    fn admin() -> Caller {
        Caller {
            user_id: "root".to_string(),
            is_admin: true,
        }
    }

    #[tokio::test]
    async fn test_device_ingest_assigns_server_time() {
        let (store, gw) = gateways().await;
        let before = Utc::now().fixed_offset();

        let receipt = gw
            .ingest_device(Some("key-d1"), device_request("d1", false))
            .await
            .unwrap();

        assert!(receipt.timestamp >= before);
        assert_eq!(receipt.timestamp.offset().local_minus_utc(), 19_800);
        let stored = store.readings().await;
        assert_eq!(stored[0].source, ReadingSource::Device);
        assert_eq!(stored[0].metadata["api_key_hint"], "***y-d1");
    }

    #[tokio::test]
    async fn test_device_missing_or_unknown_key() {
        let (_store, gw) = gateways().await;

        let missing = gw.ingest_device(None, device_request("d1", false)).await;
        assert!(matches!(missing, Err(IngestError::Unauthenticated(_))));

        let unknown = gw.ingest_device(Some("nope"), device_request("d1", false)).await;
        assert!(matches!(unknown, Err(IngestError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn test_device_key_for_other_dashboard() {
        let (store, gw) = gateways().await;
        let res = gw.ingest_device(Some("key-d1"), device_request("admin", false)).await;

        assert!(matches!(res, Err(IngestError::Unauthorized(_))));
        assert!(store.readings().await.is_empty());
    }

    #[tokio::test]
    async fn test_device_timestamp_requires_privileged_dashboard() {
        let (store, gw) = gateways().await;

        let res = gw.ingest_device(Some("key-d1"), device_request("d1", true)).await;
        assert!(matches!(res, Err(IngestError::Unauthorized(_))));
        assert!(store.readings().await.is_empty());

        let receipt = gw
            .ingest_device(Some("key-admin"), device_request("admin", true))
            .await
            .unwrap();
        assert_eq!(receipt.cache, CacheOutcome::Updated);
        assert_eq!(store.readings().await[0].source, ReadingSource::AdminBackfill);
    }

    #[tokio::test]
    async fn test_device_unknown_field() {
        let (_store, gw) = gateways().await;
        let mut request = device_request("d1", false);
        request.field_name = "Level".to_string();

        let res = gw.ingest_device(Some("key-d1"), request).await;
        assert!(matches!(res, Err(IngestError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_manual_requires_admin_and_timestamp() {
        let (store, gw) = gateways().await;
        let user = Caller {
            user_id: "alice".to_string(),
            is_admin: false,
        };
        let request = ManualIngestRequest {
            value: 20.0,
            timestamp: Some(Utc::now().fixed_offset()),
            metadata: None,
        };

        let res = gw.ingest_manual(&user, "d1", "Temp", request.clone()).await;
        assert!(matches!(res, Err(IngestError::Unauthorized(_))));

        let no_ts = ManualIngestRequest {
            timestamp: None,
            ..request.clone()
        };
        let res = gw.ingest_manual(&admin(), "d1", "Temp", no_ts).await;
        assert!(matches!(res, Err(IngestError::InvalidValue(_))));

        let res = gw.ingest_manual(&admin(), "d404", "Temp", request.clone()).await;
        assert!(matches!(res, Err(IngestError::NotFound(_))));

        assert!(store.readings().await.is_empty());
    }

    #[tokio::test]
    async fn test_manual_backfill_merges_metadata() {
        let (store, gw) = gateways().await;
        let mut extra = Map::new();
        extra.insert("note".to_string(), Value::String("paper log".to_string()));

        gw.ingest_manual(
            &admin(),
            "d1",
            "Temp",
            ManualIngestRequest {
                value: 20.0,
                timestamp: Some(Utc::now().fixed_offset() - ChronoDuration::hours(10)),
                metadata: Some(extra),
            },
        )
        .await
        .unwrap();

        let stored = store.readings().await;
        assert_eq!(stored[0].source, ReadingSource::Manual);
        assert_eq!(stored[0].metadata["user_id"], "root");
        assert_eq!(stored[0].metadata["note"], "paper log");
    }

    #[tokio::test]
    async fn test_mqtt_unknown_dashboard_and_field() {
        let (store, gw) = gateways().await;
        let message = |dashboard: &str, field: &str| MqttReading {
            dashboard_id: dashboard.to_string(),
            field_name: field.to_string(),
            value: 1.0,
            received_at: Utc::now().fixed_offset(),
            topic: format!("tankmanage/{}/{}", dashboard, field),
        };

        assert!(matches!(
            gw.ingest_mqtt(message("d9", "Temp")).await,
            Err(IngestError::NotFound(_))
        ));
        assert!(matches!(
            gw.ingest_mqtt(message("d1", "ph")).await,
            Err(IngestError::NotFound(_))
        ));
        gw.ingest_mqtt(message("d1", "Temp")).await.unwrap();

        assert_eq!(store.count("d1", Some("Temp")).await.unwrap(), 1);
    }

    #[test]
    fn test_key_hint() {
        assert_eq!(key_hint("abcdefgh"), "***efgh");
        assert_eq!(key_hint("ab"), "***ab");
    }
}
