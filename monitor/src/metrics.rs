use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Once;
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SAMPLES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_samples_total",
        "Total vehicle samples received"
    ))
    .unwrap();
    pub static ref INVALID_SAMPLES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_invalid_samples_total",
        "Total telemetry records rejected at ingestion"
    ))
    .unwrap();
    pub static ref ALERTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("monitor_alerts_total", "Total alerts raised by kind"),
        &["kind"]
    )
    .unwrap();
    pub static ref FETCH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_fetch_failures_total",
        "Total failed sample fetches (cycle skipped)"
    ))
    .unwrap();
    pub static ref NOTIFY_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_notify_failures_total",
        "Total alert notifications that could not be delivered"
    ))
    .unwrap();
    pub static ref CYCLE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "monitor_cycle_latency_seconds",
            "Time taken by one fetch-analyze-commit cycle"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0
        ])
    )
    .unwrap();
    pub static ref TRACKED_VEHICLES: Gauge = Gauge::with_opts(Opts::new(
        "monitor_tracked_vehicles",
        "Vehicles with known state"
    ))
    .unwrap();
    pub static ref MQTT_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_mqtt_messages_total",
        "Total telemetry messages received over MQTT"
    ))
    .unwrap();
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "monitor_batch_size",
        "Size of the sample batch currently being ingested"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_channel_full_total",
        "Total number of times the ingest channel was full (backpressure events)"
    ))
    .unwrap();
}

static INIT: Once = Once::new();

pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(SAMPLES_TOTAL.clone()),
            Box::new(INVALID_SAMPLES_TOTAL.clone()),
            Box::new(ALERTS_TOTAL.clone()),
            Box::new(FETCH_FAILURES_TOTAL.clone()),
            Box::new(NOTIFY_FAILURES_TOTAL.clone()),
            Box::new(CYCLE_LATENCY_SECONDS.clone()),
            Box::new(TRACKED_VEHICLES.clone()),
            Box::new(MQTT_MESSAGES_TOTAL.clone()),
            Box::new(BATCH_SIZE.clone()),
            Box::new(CHANNEL_FULL_TOTAL.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                error!("Failed to register metric: {}", e);
            }
        }
    });
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
