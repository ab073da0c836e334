use crate::errors::IngestError;
use crate::gateway::Gateways;
use crate::metrics::MQTT_DROPPED_TOTAL;
use crate::mqtt::MqttReading;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Single consumer of the MQTT channel. Runs inside the async runtime so MQTT
/// readings share the pipeline, and its per-field locking, with HTTP ingestion.
///
/// Failures are logged and the message dropped; there is no redelivery.
pub async fn run_writer(mut rx: mpsc::Receiver<MqttReading>, gateways: Gateways) {
    info!("Starting MQTT writer");
    let mut written: u64 = 0;

    while let Some(message) = rx.recv().await {
        let topic = message.topic.clone();

        match gateways.ingest_mqtt(message).await {
            Ok(receipt) => {
                written += 1;
                debug!(
                    "Stored data point {} from {} (cache {})",
                    receipt.reading_id,
                    topic,
                    receipt.cache.as_str()
                );
            }
            Err(e) => {
                match &e {
                    IngestError::StoreUnavailable { .. } => {
                        error!("Dropping MQTT reading on {}: {}", topic, e)
                    }
                    _ => warn!("Dropping MQTT reading on {}: {}", topic, e),
                }
                MQTT_DROPPED_TOTAL.with_label_values(&[e.code()]).inc();
            }
        }
    }

    info!("Channel closed, MQTT writer stopped after {} readings", written);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dashboard, FieldDescriptor, ReadingSource};
    use crate::pipeline::IngestPipeline;
    use crate::store::{DashboardRegistry, MemoryStore};
    use crate::sync::CacheSynchronizer;
    use chrono::{Duration, FixedOffset, Utc};
    use std::sync::Arc;

    fn message(dashboard_id: &str, field_name: &str, value: f64) -> MqttReading {
        MqttReading {
            dashboard_id: dashboard_id.to_string(),
            field_name: field_name.to_string(),
            value,
            received_at: Utc::now().fixed_offset(),
            topic: format!("tankmanage/{}/{}", dashboard_id, field_name),
        }
    }

    #[test]
    fn test_writer_drains_channel_and_skips_bad_targets() {
        tokio_test::block_on(async {
            let store = Arc::new(MemoryStore::new());
            store
                .insert_dashboard(Dashboard {
                    id: "d1".to_string(),
                    name: "Tank".to_string(),
                    api_key: "key-1".to_string(),
                    privileged: false,
                    is_public: false,
                    created_by: None,
                    assigned_users: vec![],
                    fields: vec![FieldDescriptor::numeric("Temp", Some("C"))],
                    updated_at: Utc::now().fixed_offset(),
                })
                .await;
            let pipeline =
                IngestPipeline::new(store.clone(), CacheSynchronizer::new(store.clone()));
            let gateways = Gateways::new(
                store.clone(),
                pipeline,
                FixedOffset::east_opt(0).unwrap(),
                None,
            );

            let (tx, rx) = mpsc::channel(10);
            tx.send(message("d1", "Temp", 24.0)).await.unwrap();
            tx.send(message("d9", "Temp", 99.0)).await.unwrap();
            tx.send(message("d1", "Level", 99.0)).await.unwrap();
            let mut last = message("d1", "Temp", 24.5);
            last.received_at = last.received_at + Duration::seconds(1);
            tx.send(last).await.unwrap();
            drop(tx);

            run_writer(rx, gateways).await;

            let stored = store.readings().await;
            assert_eq!(stored.len(), 2);
            assert!(stored.iter().all(|r| r.source == ReadingSource::Mqtt));
            assert_eq!(stored[0].metadata["topic"], "tankmanage/d1/Temp");

            let field = store.field("d1", "Temp").await.unwrap().unwrap();
            assert_eq!(field.last_value, Some(24.5));
        });
    }
}
