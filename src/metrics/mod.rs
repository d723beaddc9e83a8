//! Prometheus counters/gauges/histograms, registered the same way the
//! teacher's `proxy::plugin::prometheus` module does: module-level `Lazy`
//! statics built via the `register_*!` macros, gathered on demand by the
//! admin surface rather than pushed anywhere.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramOpts,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};

const LATENCY_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0];

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cdn_requests_total",
        "Total requests handled, by response status and cache outcome",
        &["status", "cache"]
    )
    .unwrap()
});

static REQUEST_DURATION_MS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("cdn_request_duration_ms", "Per-stage request latency in milliseconds")
        .buckets(LATENCY_BUCKETS.to_vec());
    register_histogram_vec!(opts, &["stage"]).unwrap()
});

static CACHE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("cdn_cache_events_total", "Cache hits, misses, evictions, expirations", &["event"]).unwrap()
});

static FILE_RESOLUTION_PROBES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cdn_file_resolution_probes_total",
        "File-resolution probe outcomes",
        &["result"]
    )
    .unwrap()
});

static CIRCUIT_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "cdn_circuit_state",
        "Per-backend circuit state: 0=closed, 1=half-open, 2=open",
        &["backend"]
    )
    .unwrap()
});

pub struct MetricsSink;

impl MetricsSink {
    pub fn record_request(status: u16, cache: &str, duration_ms: f64) {
        REQUESTS_TOTAL.with_label_values(&[&status.to_string(), cache]).inc();
        REQUEST_DURATION_MS.with_label_values(&["total"]).observe(duration_ms);
    }

    pub fn record_stage(stage: &str, duration_ms: f64) {
        REQUEST_DURATION_MS.with_label_values(&[stage]).observe(duration_ms);
    }

    pub fn record_cache_event(event: &str) {
        CACHE_EVENTS.with_label_values(&[event]).inc();
    }

    /// `result` is one of positive/negative/circuit-open/error.
    pub fn record_file_resolution_probe(result: &str) {
        FILE_RESOLUTION_PROBES.with_label_values(&[result]).inc();
    }

    pub fn set_circuit_state(backend: &str, state: u8) {
        CIRCUIT_STATE.with_label_values(&[backend]).set(state as i64);
    }

    /// Renders the current registry in the Prometheus text exposition
    /// format, for the admin surface's `/metrics` endpoint.
    pub fn gather_text() -> String {
        let families = prometheus::gather();
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buf) {
            log::error!("failed to encode metrics: {e}");
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_increments_counter() {
        MetricsSink::record_request(200, "HIT", 12.5);
        let text = MetricsSink::gather_text();
        assert!(text.contains("cdn_requests_total"));
    }

    #[test]
    fn gather_text_includes_circuit_state() {
        MetricsSink::set_circuit_state("origin.example", 1);
        let text = MetricsSink::gather_text();
        assert!(text.contains("cdn_circuit_state"));
    }

    #[test]
    fn gather_text_includes_file_resolution_probes() {
        MetricsSink::record_file_resolution_probe("positive");
        let text = MetricsSink::gather_text();
        assert!(text.contains("cdn_file_resolution_probes_total"));
    }
}
