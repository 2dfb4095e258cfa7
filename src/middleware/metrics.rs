//! Prometheus metrics for the relay.
//!
//! Everything lives in the global default registry and is scraped from
//! `/metrics`. Labels are fixed small sets, so no cardinality guard is needed.

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_counter, register_counter_vec, register_histogram, Counter, CounterVec,
    Encoder, Histogram, TextEncoder,
};

pub static METRICS: Lazy<RelayMetrics> = Lazy::new(RelayMetrics::new);

pub struct RelayMetrics {
    jobs_submitted_total: Counter,
    jobs_completed_total: CounterVec,
    delivery_attempts_total: CounterVec,
    delivery_duration_seconds: Histogram,
}

impl RelayMetrics {
    fn new() -> Self {
        let jobs_submitted_total = register_counter!(opts!(
            "relay_jobs_submitted_total",
            "Jobs accepted by the submit endpoint"
        ))
        .expect("failed to register relay_jobs_submitted_total");

        let jobs_completed_total = register_counter_vec!(
            opts!("relay_jobs_completed_total", "Jobs that reached a terminal state"),
            &["outcome"]
        )
        .expect("failed to register relay_jobs_completed_total");

        let delivery_attempts_total = register_counter_vec!(
            opts!("relay_delivery_attempts_total", "Outbound delivery attempts"),
            &["result"]
        )
        .expect("failed to register relay_delivery_attempts_total");

        let delivery_duration_seconds = register_histogram!(prometheus::histogram_opts!(
            "relay_delivery_duration_seconds",
            "Outbound delivery latency in seconds",
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        ))
        .expect("failed to register relay_delivery_duration_seconds");

        Self {
            jobs_submitted_total,
            jobs_completed_total,
            delivery_attempts_total,
            delivery_duration_seconds,
        }
    }

    pub fn job_submitted(&self) {
        self.jobs_submitted_total.inc();
    }

    /// `outcome` is `succeeded` or `failed_terminal`.
    pub fn job_completed(&self, outcome: &str) {
        self.jobs_completed_total.with_label_values(&[outcome]).inc();
    }

    /// `result` is `ok` or a delivery error label.
    pub fn delivery_attempt(&self, result: &str, elapsed_secs: f64) {
        self.delivery_attempts_total.with_label_values(&[result]).inc();
        self.delivery_duration_seconds.observe(elapsed_secs);
    }
}

/// Encode all registered metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    Lazy::force(&METRICS);
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_metrics_include_relay_families() {
        METRICS.job_submitted();
        METRICS.job_completed("succeeded");
        METRICS.delivery_attempt("ok", 0.02);

        let output = encode_metrics();
        assert!(output.contains("relay_jobs_submitted_total"));
        assert!(output.contains("relay_jobs_completed_total{outcome=\"succeeded\"}"));
        assert!(output.contains("relay_delivery_attempts_total{result=\"ok\"}"));
        assert!(output.contains("relay_delivery_duration_seconds_bucket"));
    }
}
