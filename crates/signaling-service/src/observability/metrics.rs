//! Metrics definitions for the signaling service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sig_` prefix for the signaling service
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `action`: 10 values (protocol actions plus `unknown`)
//! - `status`: 2 values (success, error)
//! - `error_type`: bounded by `SignalingError` variants
//! - `event`: 4 values (peerCount, newProducer, producerClosed, peerLeft)
//! - `actor_type`: 3 values (registry, room, connection)
//! - `resource`: 4 values (consumer, producer, transport, router)
//!
//! Room ids and peer ids are never used as labels.

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
        // Request latency buckets - includes media engine round trips
        .set_buckets_for_metric(
            Matcher::Prefix("sig_request".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set request latency buckets: {e}"))?
        // Connection lifetime buckets - minutes to hours
        .set_buckets_for_metric(
            Matcher::Full("sig_connection_duration_seconds".to_string()),
            &[
                1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0,
            ],
        )
        .map_err(|e| format!("Failed to set connection duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Connection, Room & Peer Metrics (Gauges)
// ============================================================================

/// Set the number of open WebSocket connections.
///
/// Metric: `sig_connections_active`
pub fn set_connections_active(count: usize) {
    // usize to f64 conversion is safe for realistic connection counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("sig_connections_active").set(count as f64);
}

/// Set the number of live rooms.
///
/// Metric: `sig_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sig_rooms_active").set(count as f64);
}

/// Set the number of joined peers across all rooms.
///
/// Metric: `sig_peers_active`
pub fn set_peers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sig_peers_active").set(count as f64);
}

/// Record how long a connection stayed open.
///
/// Metric: `sig_connection_duration_seconds`
pub fn record_connection_duration(duration: Duration) {
    histogram!("sig_connection_duration_seconds").record(duration.as_secs_f64());
}

// ============================================================================
// Actor Mailbox Metrics (Gauges)
// ============================================================================

/// Set the mailbox depth for an actor type.
///
/// Metric: `sig_actor_mailbox_depth`
/// Labels: `actor_type` (registry, room, connection)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sig_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

/// Record an actor panic event.
///
/// Metric: `sig_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &str) {
    counter!("sig_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

// ============================================================================
// Request Metrics
// ============================================================================

/// Record one handled request.
///
/// Metrics: `sig_requests_total` (labels: `action`, `status`) and
/// `sig_request_duration_seconds` (labels: `action`)
///
/// `action` must already be bounded (see `protocol::actions::metric_label`).
pub fn record_request(action: &str, status: &str, duration: Duration) {
    counter!("sig_requests_total",
        "action" => action.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("sig_request_duration_seconds", "action" => action.to_string())
        .record(duration.as_secs_f64());
}

/// Record a request error by category.
///
/// Metric: `sig_errors_total`
/// Labels: `action`, `error_type`
pub fn record_error(action: &str, error_type: &str) {
    counter!("sig_errors_total",
        "action" => action.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

// ============================================================================
// Dispatcher Metrics (Counters)
// ============================================================================

/// Record room events placed on outbound queues.
///
/// Metric: `sig_events_sent_total`
/// Labels: `event`
pub fn record_event_sent(event: &str, recipients: usize) {
    counter!("sig_events_sent_total", "event" => event.to_string()).increment(recipients as u64);
}

/// Record an event dropped for one recipient.
///
/// Metric: `sig_events_dropped_total`
/// Labels: `reason` (queue_full, closed)
///
/// Sustained `queue_full` drops indicate clients that cannot keep up.
pub fn record_event_dropped(reason: &str) {
    counter!("sig_events_dropped_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Cleanup Metrics (Counters)
// ============================================================================

/// Record a media engine object that failed to close during cleanup.
///
/// Metric: `sig_cleanup_failures_total`
/// Labels: `resource` (consumer, producer, transport, router)
pub fn record_cleanup_failure(resource: &str) {
    counter!("sig_cleanup_failures_total", "resource" => resource.to_string()).increment(1);
}
