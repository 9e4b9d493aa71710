//! Prometheus metrics for the admission pipeline.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `guard_rate_limited_total` - Requests rejected by a token bucket (label: rule)
//! - `guard_auth_failures_total` - Rejected tokens (label: kind)
//! - `guard_tokens_issued_total` - Tokens issued via `POST /auth`
//! - `guard_request_timeouts_total` - Requests that hit their deadline
//! - `guard_faults_recovered_total` - Panics converted into 500 responses
//! - `guard_alert_failures_total` - Fault alerts that could not be delivered
//!
//! ## Gauges
//! - `guard_rate_limit_buckets` - Live token buckets in the registry
//!
//! ## Histograms
//! - `guard_request_duration_seconds` - Request duration (label: status)
//!
//! Recording functions are no-ops until [`init_metrics`] installs an exporter.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const RATE_LIMITED_TOTAL: &str = "guard_rate_limited_total";
    pub const AUTH_FAILURES_TOTAL: &str = "guard_auth_failures_total";
    pub const TOKENS_ISSUED_TOTAL: &str = "guard_tokens_issued_total";
    pub const REQUEST_TIMEOUTS_TOTAL: &str = "guard_request_timeouts_total";
    pub const FAULTS_RECOVERED_TOTAL: &str = "guard_faults_recovered_total";
    pub const ALERT_FAILURES_TOTAL: &str = "guard_alert_failures_total";
    pub const RATE_LIMIT_BUCKETS: &str = "guard_rate_limit_buckets";
    pub const REQUEST_DURATION_SECONDS: &str = "guard_request_duration_seconds";
}

/// Install the Prometheus exporter and describe all metrics.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Requests rejected because their token bucket was empty"
    );
    describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Requests rejected by bearer token validation"
    );
    describe_counter!(names::TOKENS_ISSUED_TOTAL, "Authentication tokens issued");
    describe_counter!(
        names::REQUEST_TIMEOUTS_TOTAL,
        "Requests aborted because the handler exceeded its deadline"
    );
    describe_counter!(
        names::FAULTS_RECOVERED_TOTAL,
        "Unhandled faults caught by the recovery middleware"
    );
    describe_counter!(
        names::ALERT_FAILURES_TOTAL,
        "Fault alerts that failed to reach the alert sink"
    );
    describe_gauge!(
        names::RATE_LIMIT_BUCKETS,
        "Token buckets currently held by the registry"
    );
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

pub fn record_rate_limited(rule: &str) {
    counter!(names::RATE_LIMITED_TOTAL, "rule" => rule.to_string()).increment(1);
}

pub fn record_auth_failure(kind: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "kind" => kind).increment(1);
}

pub fn record_token_issued() {
    counter!(names::TOKENS_ISSUED_TOTAL).increment(1);
}

pub fn record_request_timeout() {
    counter!(names::REQUEST_TIMEOUTS_TOTAL).increment(1);
}

pub fn record_fault_recovered() {
    counter!(names::FAULTS_RECOVERED_TOTAL).increment(1);
}

pub fn record_alert_failure() {
    counter!(names::ALERT_FAILURES_TOTAL).increment(1);
}

pub fn set_bucket_count(count: usize) {
    gauge!(names::RATE_LIMIT_BUCKETS).set(count as f64);
}

pub fn record_request_duration(status: u16, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "status" => status.to_string()).record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder these are no-ops; they must not panic.

    #[test]
    fn test_counters_without_recorder() {
        record_rate_limited("/api");
        record_auth_failure("expired");
        record_token_issued();
        record_request_timeout();
        record_fault_recovered();
        record_alert_failure();
    }

    #[test]
    fn test_gauge_and_histogram_without_recorder() {
        set_bucket_count(3);
        record_request_duration(200, 0.01);
    }
}
