//! Metrics definitions for the signaling service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `signaling_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by code, never by client input:
//! - `outcome`: accepted/rejected, established/rolled_back/timeout/cancelled
//! - `reason`: stop, disconnect, rollback
//! - `kind`: bounded by the inbound message kinds (~7 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Establishment spans several engine round trips plus candidate flushing
        .set_buckets_for_metric(
            Matcher::Prefix("signaling_establishment".to_string()),
            &[
                0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000, 30.000,
            ],
        )
        .map_err(|e| format!("Failed to set establishment duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Set the number of registered sessions.
///
/// Metric: `signaling_sessions_registered`
pub fn set_sessions_registered(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("signaling_sessions_registered").set(count as f64);
}

/// Record a registration attempt.
///
/// Metric: `signaling_registrations_total`
/// Labels: `outcome` (accepted, rejected)
pub fn record_registration(outcome: &'static str) {
    counter!("signaling_registrations_total", "outcome" => outcome).increment(1);
}

/// Record the end of an establishment attempt.
///
/// Metrics: `signaling_establishments_total`, `signaling_establishment_duration_seconds`
/// Labels: `outcome`
pub fn record_establishment(outcome: &'static str, duration: Duration) {
    counter!("signaling_establishments_total", "outcome" => outcome).increment(1);
    histogram!("signaling_establishment_duration_seconds", "outcome" => outcome)
        .record(duration.as_secs_f64());
}

/// Record a pair teardown.
///
/// Metric: `signaling_teardowns_total`
/// Labels: `reason` (stop, disconnect, rollback)
pub fn record_teardown(reason: &'static str) {
    counter!("signaling_teardowns_total", "reason" => reason).increment(1);
}

/// Record an inbound signaling message.
///
/// Metric: `signaling_messages_total`
/// Labels: `kind`
pub fn record_message(kind: &'static str) {
    counter!("signaling_messages_total", "kind" => kind).increment(1);
}
