//! Prometheus metrics for the delivery engine.
//!
//! ## Available Metrics
//!
//! - `delivery_jobs_processed_total` - Counter of jobs processed by status
//! - `delivery_dispatch_duration_seconds` - Histogram of provider dispatch time
//! - `delivery_queue_depth` - Gauge of ready-stream depth per priority
//! - `delivery_retries_total` - Counter of retry-controller passes
//! - `delivery_rate_gate_wait_seconds` - Histogram of time spent at the rate gate
//! - `delivery_in_flight_jobs` - Gauge of jobs currently being processed

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for metrics export
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency
pub mod names {
    pub const JOBS_PROCESSED: &str = "delivery_jobs_processed_total";
    pub const DISPATCH_DURATION: &str = "delivery_dispatch_duration_seconds";
    pub const QUEUE_DEPTH: &str = "delivery_queue_depth";
    pub const RETRIES: &str = "delivery_retries_total";
    pub const RATE_GATE_WAIT: &str = "delivery_rate_gate_wait_seconds";
    pub const IN_FLIGHT_JOBS: &str = "delivery_in_flight_jobs";
}

/// Job outcome for metrics labeling
#[derive(Debug, Clone, Copy)]
pub enum JobStatus {
    Sent,
    Retried,
    DeadLettered,
    Malformed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Retried => "retried",
            Self::DeadLettered => "dead_lettered",
            Self::Malformed => "malformed",
        }
    }
}

/// Initialize the Prometheus metrics exporter.
///
/// Call once at application startup; returns the handle used by the
/// `/metrics` endpoint.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Get the global Prometheus handle.
///
/// Returns None if metrics haven't been initialized.
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Record a job outcome.
pub fn record_job_processed(provider: &str, status: JobStatus) {
    counter!(
        names::JOBS_PROCESSED,
        "provider" => provider.to_string(),
        "status" => status.as_str().to_string()
    )
    .increment(1);
}

/// Record how long a provider dispatch took.
pub fn record_dispatch_duration(provider: &str, duration: Duration) {
    histogram!(
        names::DISPATCH_DURATION,
        "provider" => provider.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Update a ready-stream depth gauge.
pub fn set_queue_depth(priority: &str, depth: f64) {
    gauge!(
        names::QUEUE_DEPTH,
        "priority" => priority.to_string()
    )
    .set(depth);
}

/// Record a retry-controller pass.
pub fn record_retry(provider: &str, attempt: u32) {
    counter!(
        names::RETRIES,
        "provider" => provider.to_string(),
        "attempt" => attempt.to_string()
    )
    .increment(1);
}

/// Record time spent waiting at the rate gate.
pub fn record_rate_gate_wait(provider: &str, duration: Duration) {
    histogram!(
        names::RATE_GATE_WAIT,
        "provider" => provider.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Update the in-flight jobs gauge.
pub fn set_in_flight_jobs(count: f64) {
    gauge!(names::IN_FLIGHT_JOBS).set(count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_as_str() {
        assert_eq!(JobStatus::Sent.as_str(), "sent");
        assert_eq!(JobStatus::Retried.as_str(), "retried");
        assert_eq!(JobStatus::DeadLettered.as_str(), "dead_lettered");
        assert_eq!(JobStatus::Malformed.as_str(), "malformed");
    }
}
