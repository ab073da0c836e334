use crate::errors::{Error, Result};
use crate::metrics::{CHANNEL_FULL_TOTAL, MQTT_DROPPED_TOTAL, MQTT_MESSAGES_TOTAL};
use crate::timestamp::now_in;
use crate::validate::{validate_identifier, validate_value};
use chrono::{DateTime, FixedOffset};
use rumqttc::{Client, Event, MqttOptions, Packet, Publish, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

pub const TOPIC_PREFIX: &str = "tankmanage";

/// A reading lifted off the broker, addressed but not yet resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttReading {
    pub dashboard_id: String,
    pub field_name: String,
    pub value: f64,
    pub received_at: DateTime<FixedOffset>,
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub topics: Vec<String>,
    pub display_offset: FixedOffset,
}

/// Splits `tankmanage/{dashboard_id}/{field_name}[/suffix]`.
pub fn parse_topic(topic: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        [prefix, dashboard_id, field_name] | [prefix, dashboard_id, field_name, _]
            if *prefix == TOPIC_PREFIX =>
        {
            validate_identifier("Dashboard ID", dashboard_id)?;
            validate_identifier("Field name", field_name)?;
            Ok((dashboard_id.to_string(), field_name.to_string()))
        }
        _ => Err(Error::Validation(format!(
            "Topic '{}' is not {}/<dashboard_id>/<field_name>",
            topic, TOPIC_PREFIX
        ))),
    }
}

/// Payloads are bare UTF-8 decimal literals, no envelope.
pub fn parse_payload(payload: &[u8]) -> Result<f64> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| Error::Validation("Payload is not valid UTF-8".to_string()))?;
    let value = text
        .trim()
        .parse::<f64>()
        .map_err(|_| Error::Validation(format!("Invalid payload format: {:?}", text)))?;
    validate_value(value)?;
    Ok(value)
}

pub fn parse_message(
    topic: &str,
    payload: &[u8],
    received_at: DateTime<FixedOffset>,
) -> Result<MqttReading> {
    let (dashboard_id, field_name) = parse_topic(topic)?;
    let value = parse_payload(payload)?;
    Ok(MqttReading {
        dashboard_id,
        field_name,
        value,
        received_at,
        topic: topic.to_string(),
    })
}

#[derive(Debug, PartialEq, Eq)]
pub enum Forwarded {
    Queued,
    Dropped,
    ChannelClosed,
}

/// Parses one publish and queues it for the writer task. Blocks the MQTT
/// thread (never the async runtime) while the channel is full.
pub fn forward(
    topic: &str,
    payload: &[u8],
    received_at: DateTime<FixedOffset>,
    tx: &mpsc::Sender<MqttReading>,
) -> Forwarded {
    MQTT_MESSAGES_TOTAL.inc();
    debug!(
        "Received message on topic {}, size: {} bytes",
        topic,
        payload.len()
    );

    let reading = match parse_message(topic, payload, received_at) {
        Ok(reading) => reading,
        Err(e) => {
            // Malformed input will not improve on redelivery
            warn!("Dropping MQTT message on {}: {}", topic, e);
            MQTT_DROPPED_TOTAL.with_label_values(&["INVALID_VALUE"]).inc();
            return Forwarded::Dropped;
        }
    };

    match tx.try_send(reading) {
        Ok(()) => Forwarded::Queued,
        Err(TrySendError::Full(reading)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Channel full, using blocking send");
            match tx.blocking_send(reading) {
                Ok(()) => Forwarded::Queued,
                Err(_) => Forwarded::ChannelClosed,
            }
        }
        Err(TrySendError::Closed(_)) => Forwarded::ChannelClosed,
    }
}

/// Owns the MQTT connection thread.
pub struct MqttGateway {
    client: Client,
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl MqttGateway {
    /// Connects on a dedicated OS thread with its own client and event loop.
    pub fn spawn(settings: MqttSettings, tx: mpsc::Sender<MqttReading>) -> Result<Self> {
        info!(
            "Connecting to MQTT broker at {}:{}",
            settings.broker, settings.port
        );

        let mut mqtt_options =
            MqttOptions::new(settings.client_id.clone(), settings.broker.clone(), settings.port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_clean_session(false);
        if let Some((username, password)) = &settings.credentials {
            mqtt_options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut connection) = Client::new(mqtt_options, 10);
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_client = client.clone();
        let thread_shutdown = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name("mqtt-gateway".to_string())
            .spawn(move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("Connected to MQTT broker");
                            subscribe_all(&thread_client, &settings.topics);
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if handle_publish(&publish, settings.display_offset, &tx)
                                == Forwarded::ChannelClosed
                            {
                                error!("Channel closed, stopping MQTT gateway");
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if thread_shutdown.load(Ordering::Acquire) {
                                break;
                            }
                            error!("MQTT error: {}", e);
                            // rumqttc reconnects on the next poll
                            std::thread::sleep(Duration::from_secs(1));
                        }
                    }
                    if thread_shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
                info!("MQTT gateway stopped");
            })?;

        Ok(Self {
            client,
            shutdown,
            thread,
        })
    }

    /// Resolves once the gateway thread has exited, e.g. after the writer
    /// side of the channel went away.
    pub async fn stopped(&self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        while !self.thread.is_finished() {
            ticker.tick().await;
        }
    }

    /// Disconnects from the broker and waits for the thread to exit.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.client.try_disconnect() {
            warn!("MQTT disconnect failed: {}", e);
        }
        let thread = self.thread;
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => {}
            _ => error!("MQTT gateway thread did not exit cleanly"),
        }
    }
}

fn subscribe_all(client: &Client, topics: &[String]) {
    for topic in topics {
        // try_ variant: the request queue is drained by this very thread
        match client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
            Ok(()) => info!("Subscribed to {} with QoS 1", topic),
            Err(e) => error!("Failed to subscribe to {}: {}", topic, e),
        }
    }
}

fn handle_publish(
    publish: &Publish,
    display_offset: FixedOffset,
    tx: &mpsc::Sender<MqttReading>,
) -> Forwarded {
    forward(&publish.topic, &publish.payload, now_in(display_offset), tx)
}
