//! Prometheus metrics for the live runtime.
//!
//! Naming follows Prometheus conventions: `rt_` prefix, `_total` suffix for
//! counters, `_seconds` suffix for duration histograms.
//!
//! # Cardinality
//!
//! - `message_type`: bounded by the client message enum (~25 values)
//! - `mode`: `multipart`, `single_object` or `simple`
//! - `reason`: bounded abort reasons (`stale`, `flush_failed`, `finalize_failed`)
//! - `error_code`: bounded by `RuntimeError::error_code`

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the global Prometheus recorder.
///
/// # Errors
///
/// Returns error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("rt_message".to_string()),
            &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("rt_recording_part".to_string()),
            &[0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000],
        )
        .map_err(|e| format!("Failed to set recording part buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Metric: `rt_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rt_connections_active").set(count as f64);
}

/// Metric: `rt_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rt_rooms_active").set(count as f64);
}

/// Events dropped because a connection's outbound mailbox was full.
///
/// Metric: `rt_events_dropped_total`
pub fn record_event_dropped() {
    counter!("rt_events_dropped_total").increment(1);
}

/// Side effects dropped because the dispatcher mailbox was full.
///
/// Metric: `rt_dispatch_dropped_total`
pub fn record_dispatch_dropped() {
    counter!("rt_dispatch_dropped_total").increment(1);
}

/// Client message handling latency.
///
/// Metric: `rt_message_latency_seconds`
/// Labels: `message_type`
pub fn record_message_latency(message_type: &'static str, duration: Duration) {
    histogram!("rt_message_latency_seconds", "message_type" => message_type)
        .record(duration.as_secs_f64());
}

/// One multipart part uploaded.
///
/// Metrics: `rt_recording_parts_total`, `rt_recording_part_upload_seconds`
pub fn record_recording_part(bytes: usize, duration: Duration) {
    counter!("rt_recording_parts_total").increment(1);
    #[allow(clippy::cast_precision_loss)]
    histogram!("rt_recording_part_bytes").record(bytes as f64);
    histogram!("rt_recording_part_upload_seconds").record(duration.as_secs_f64());
}

/// A recording finalized.
///
/// Metric: `rt_recording_finalized_total`
/// Labels: `mode`
pub fn record_recording_finalized(mode: &'static str) {
    counter!("rt_recording_finalized_total", "mode" => mode).increment(1);
}

/// A multipart upload aborted.
///
/// Metric: `rt_recording_aborted_total`
/// Labels: `reason`
pub fn record_recording_aborted(reason: &'static str) {
    counter!("rt_recording_aborted_total", "reason" => reason).increment(1);
}

/// Uploads removed by one sweep pass.
///
/// Metric: `rt_recording_swept_total`
pub fn record_recording_swept(count: usize) {
    counter!("rt_recording_swept_total").increment(count as u64);
}

/// Error returned to a client.
///
/// Metric: `rt_errors_total`
/// Labels: `operation`, `error_code`
pub fn record_error(operation: &'static str, error_code: &'static str) {
    counter!("rt_errors_total",
        "operation" => operation,
        "error_code" => error_code
    )
    .increment(1);
}
