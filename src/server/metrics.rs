//! Prometheus metrics for the HTTP surface
//!
//! Request counters and latency per route, plus a few domain series:
//! live item count, display updates, and a constant build-info gauge.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Registry exposed on `/metrics`
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref HTTP_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("itemkv_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"]
    ).unwrap();

    pub static ref HTTP_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "itemkv_http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["method", "path"]
    ).unwrap();

    pub static ref ITEMS_TOTAL: IntGauge = IntGauge::new(
        "itemkv_items_total",
        "Number of stored items"
    ).unwrap();

    pub static ref DISPLAY_UPDATES: IntCounter = IntCounter::new(
        "itemkv_display_updates_total",
        "Accepted display payload updates"
    ).unwrap();

    pub static ref BUILD_INFO: IntGaugeVec = IntGaugeVec::new(
        Opts::new("itemkv_info", "Build information"),
        &["version"]
    ).unwrap();
}

/// Register every series. Safe to call more than once.
pub fn init_metrics() {
    METRICS_REGISTRY.register(Box::new(HTTP_REQUESTS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(HTTP_DURATION.clone())).ok();
    METRICS_REGISTRY.register(Box::new(ITEMS_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(DISPLAY_UPDATES.clone())).ok();
    METRICS_REGISTRY.register(Box::new(BUILD_INFO.clone())).ok();

    BUILD_INFO.with_label_values(&[crate::VERSION]).set(1);
    info!("Metrics initialized");
}

/// Record one finished request
pub fn observe_request(method: &str, path: &str, status: u16, seconds: f64) {
    HTTP_REQUESTS
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_DURATION
        .with_label_values(&[method, path])
        .observe(seconds);
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}
