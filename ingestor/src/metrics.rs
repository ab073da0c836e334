use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tracing::warn;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref READINGS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("ingestor_readings_total", "Readings durably appended, by source"),
        &["source"]
    )
    .unwrap();
    pub static ref REJECTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("ingestor_rejections_total", "Ingestion attempts rejected, by reason"),
        &["reason"]
    )
    .unwrap();
    pub static ref CACHE_OUTCOMES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_cache_outcomes_total",
            "Field cache reconciliation outcomes"
        ),
        &["outcome"]
    )
    .unwrap();
    pub static ref MQTT_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_mqtt_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref MQTT_DROPPED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("ingestor_mqtt_dropped_total", "MQTT messages dropped, by reason"),
        &["reason"]
    )
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_ingest_latency_seconds",
            "Time taken to append a reading and reconcile the field cache"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_channel_full_total",
        "Total number of times the MQTT channel was full (backpressure events)"
    ))
    .unwrap();
    pub static ref CACHE_REPAIRED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_cache_repaired_total",
        "Field descriptors moved forward by the periodic cache rebuild"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(READINGS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REJECTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_OUTCOMES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MQTT_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MQTT_DROPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INGEST_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(CHANNEL_FULL_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_REPAIRED_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
