mod sample;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use sample::{payload, FieldProfile};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Publishes fake tank readings to the broker.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    #[arg(long, env = "DASHBOARD_ID")]
    dashboard_id: String,

    #[arg(long, env = "FIELDS", value_delimiter = ',', default_value = "Temp,Level,ph,Pressure")]
    fields: Vec<String>,

    /// Readings per second across all fields.
    #[arg(long, env = "RATE", default_value_t = 10)]
    rate: u64,

    /// Share of payloads deliberately made non-numeric.
    #[arg(long, env = "INVALID_RATIO", default_value_t = 0.0)]
    invalid_ratio: f64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.fields.is_empty() || args.rate == 0 {
        error!("Need at least one field and a positive rate");
        std::process::exit(2);
    }

    info!("Starting TankManage simulator");
    info!(
        "Broker: {}:{}, dashboard: {}, fields: {:?}, rate: {} msg/s",
        args.mqtt_broker, args.mqtt_port, args.dashboard_id, args.fields, args.rate
    );

    let mut rng = rand::thread_rng();
    let client_id = format!("sim-{}", rng.gen::<u32>());

    let mut mqtt_options = MqttOptions::new(&client_id, &args.mqtt_broker, args.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("Connected to MQTT broker, starting to publish readings");

    let profiles: Vec<FieldProfile> = args
        .fields
        .iter()
        .map(|f| FieldProfile::for_field(f.trim()))
        .collect();
    let mut ticker = tokio::time::interval(Duration::from_micros((1_000_000 / args.rate).max(1)));
    let mut counter = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let profile = &profiles[(counter % profiles.len() as u64) as usize];
        let topic = format!("tankmanage/{}/{}", args.dashboard_id, profile.name);
        let body = payload(profile, args.invalid_ratio, &mut rng);

        match client.publish(&topic, QoS::AtLeastOnce, false, body).await {
            Ok(_) => counter += 1,
            Err(e) => warn!("Failed to publish to {}: {}", topic, e),
        }

        if counter > 0 && counter % 1000 == 0 {
            info!("Published {} readings", counter);
        }
    }

    info!("Stopping after {} readings", counter);
    if let Err(e) = client.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
}
