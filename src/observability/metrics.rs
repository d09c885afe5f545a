use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the edge idempotency layer.
#[derive(Debug, Clone)]
pub struct Metrics {
    initialized: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { initialized: true }
    }

    /// `outcome` is one of proceed, replay, conflict, error.
    pub fn record_begin_outcome(&self, backend: &str, outcome: &str) {
        counter!("idempotency_begin_total", "backend" => backend.to_string(), "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_completion(&self, backend: &str, status_code: u16) {
        counter!("idempotency_completed_total", "backend" => backend.to_string(), "status" => status_code.to_string()).increment(1);
    }

    pub fn record_abort(&self, backend: &str) {
        counter!("idempotency_aborted_total", "backend" => backend.to_string()).increment(1);
    }

    pub fn record_claim_lost(&self, backend: &str) {
        counter!("idempotency_claim_lost_total", "backend" => backend.to_string()).increment(1);
    }

    pub fn record_store_operation(&self, backend: &str, operation: &str, duration_ms: f64, success: bool) {
        counter!("idempotency_store_operations_total", "backend" => backend.to_string(), "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("idempotency_store_duration_ms", "backend" => backend.to_string(), "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_cache_lookup(&self, backend: &str, hit: bool, duration_ms: f64) {
        counter!("response_cache_lookups_total", "backend" => backend.to_string(), "hit" => hit.to_string()).increment(1);
        histogram!("response_cache_lookup_duration_ms", "backend" => backend.to_string()).record(duration_ms);
    }

    pub fn record_http_request(&self, method: &str, status: u16, replayed: bool, duration_ms: f64) {
        counter!("http_requests_total", "method" => method.to_string(), "status" => status.to_string(), "replayed" => replayed.to_string()).increment(1);
        histogram!("http_request_duration_ms", "method" => method.to_string()).record(duration_ms);
    }

    pub fn record_upstream_request(&self, status: u16, duration_ms: f64) {
        counter!("upstream_requests_total", "status" => status.to_string()).increment(1);
        histogram!("upstream_request_duration_ms").record(duration_ms);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Initializes the metrics system and returns the Prometheus handle.
pub fn init_metrics() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    METRICS.get_or_init(Metrics::new);

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

/// Describes all metrics for Prometheus.
fn describe_metrics() {
    describe_counter!("idempotency_begin_total", Unit::Count, "Idempotency claims by outcome");
    describe_counter!("idempotency_completed_total", Unit::Count, "Responses stored for replay");
    describe_counter!("idempotency_aborted_total", Unit::Count, "Claims released after a failed operation");
    describe_counter!("idempotency_claim_lost_total", Unit::Count, "Completions rejected because the claim had been taken over");

    describe_counter!("idempotency_store_operations_total", Unit::Count, "Idempotency store operations");
    describe_histogram!("idempotency_store_duration_ms", Unit::Milliseconds, "Idempotency store latency in milliseconds");

    describe_counter!("response_cache_lookups_total", Unit::Count, "Response cache lookups");
    describe_histogram!("response_cache_lookup_duration_ms", Unit::Milliseconds, "Response cache lookup latency in milliseconds");

    describe_counter!("http_requests_total", Unit::Count, "Total HTTP requests");
    describe_histogram!("http_request_duration_ms", Unit::Milliseconds, "HTTP request latency in milliseconds");

    describe_counter!("upstream_requests_total", Unit::Count, "Requests forwarded upstream");
    describe_histogram!("upstream_request_duration_ms", Unit::Milliseconds, "Upstream latency in milliseconds");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
