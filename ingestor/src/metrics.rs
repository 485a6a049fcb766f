use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref READINGS_RECEIVED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_received_total",
        "Total readings submitted at the boundary"
    ))
    .unwrap();
    pub static ref READINGS_REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_rejected_total",
        "Total readings rejected before enqueueing"
    ))
    .unwrap();
    pub static ref JOBS_PROCESSED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_jobs_processed_total",
        "Total ingestion jobs completed"
    ))
    .unwrap();
    pub static ref JOBS_RETRIED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_jobs_retried_total",
        "Total ingestion job retries after transient failures"
    ))
    .unwrap();
    pub static ref JOBS_EXHAUSTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_jobs_exhausted_total",
        "Total ingestion jobs dropped after exhausting retries"
    ))
    .unwrap();
    pub static ref SPIKES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_spikes_total",
        "Total readings above their device threshold"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Total transient database failures"
    ))
    .unwrap();
    pub static ref PROCESS_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_process_latency_seconds",
            "Time taken to process one ingestion job"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref QUEUE_DEPTH: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_queue_depth",
        "Jobs waiting in the readings queue"
    ))
    .unwrap();
    pub static ref QUEUE_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_queue_full_total",
        "Total number of times the queue was full (backpressure events)"
    ))
    .unwrap();
    pub static ref PAIRINGS_COMPLETED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_pairings_completed_total",
        "Total devices moved from pending to active"
    ))
    .unwrap();
    pub static ref DEVICES_EXPIRED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_devices_expired_total",
        "Total pending devices removed by the expiry sweep"
    ))
    .unwrap();
    pub static ref WRITE_BACK_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_write_back_failures_total",
        "Total failed refreshes of cached device metrics"
    ))
    .unwrap();
    pub static ref MQTT_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_mqtt_messages_total",
        "Total MQTT messages received"
    ))
    .unwrap();
    pub static ref MQTT_INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_mqtt_invalid_messages_total",
        "Total MQTT messages that could not be queued"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(READINGS_RECEIVED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_REJECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(JOBS_PROCESSED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(JOBS_RETRIED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(JOBS_EXHAUSTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SPIKES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PROCESS_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(QUEUE_FULL_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PAIRINGS_COMPLETED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEVICES_EXPIRED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WRITE_BACK_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MQTT_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MQTT_INVALID_MESSAGES_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
