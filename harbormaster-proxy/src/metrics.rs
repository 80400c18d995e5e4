//! Prometheus metrics for the proxy's request path.

use prometheus::{Encoder, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::LazyLock;

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Total requests processed
pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("harbormaster_requests_total", "Total number of HTTP requests"),
        &["method", "status", "host"]
    ).expect("metric can be created")
});

/// Request latency in seconds
pub static REQUEST_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "harbormaster_request_duration_seconds",
            "Request duration in seconds"
        ),
        &["method", "status", "host"]
    ).expect("metric can be created")
});

/// Connections accepted per listener (`http` or `https`).
pub static ACTIVE_CONNECTIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("harbormaster_active_connections", "Number of connections accepted"),
        &["listener"]
    ).expect("metric can be created")
});

/// Blue-green deployment lifecycle transitions, one count per event kind
/// (started, traffic_switched, completed, failed, health_check_passed).
pub static DEPLOYMENT_TRANSITIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "harbormaster_deployment_transitions_total",
            "Total number of deployment state machine transitions"
        ),
        &["hostname", "event"]
    ).expect("metric can be created")
});

/// Initialize metrics
pub fn init() {
    // Register metrics
    // We ignore errors in case they are already registered (though typically init is called once)
    let _ = REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(ACTIVE_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(DEPLOYMENT_TRANSITIONS_TOTAL.clone()));
}

/// Records one completed request: method, final status, and which host it
/// routed to (or `-` when the request never resolved to a host).
pub fn record_request(method: &str, status: u16, host: &str, duration_secs: f64) {
    let status = status.to_string();
    REQUESTS_TOTAL.with_label_values(&[method, &status, host]).inc();
    REQUEST_DURATION_SECONDS
        .with_label_values(&[method, &status, host])
        .observe(duration_secs);
}

/// Gather metrics in Prometheus text format
pub fn gather() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_increments_labeled_counter() {
        init();
        record_request("GET", 200, "a.com", 0.01);
        let before = REQUESTS_TOTAL.with_label_values(&["GET", "200", "a.com"]).get();
        record_request("GET", 200, "a.com", 0.02);
        let after = REQUESTS_TOTAL.with_label_values(&["GET", "200", "a.com"]).get();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn gather_includes_registered_metric_names() {
        init();
        record_request("GET", 404, "nope.com", 0.0);
        let text = gather();
        assert!(text.contains("harbormaster_requests_total"));
    }
}
