//! Prometheus Metrics Module
//!
//! Exposes proxy metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Frames**: inbound frames by kind, protocol errors, correlation misses
//! - **Requests**: correlated request outcomes and round-trip latency
//! - **Session**: link state and reconnect attempts
//! - **Fan-out**: consumers, subscribed instruments, deliveries and drops
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op, so library code and tests can call the
//! recorders unconditionally.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the already installed handle.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Inbound frames
    describe_counter!(
        "deribit_proxy_frames_received_total",
        "Total frames received from the venue by kind"
    );
    describe_counter!(
        "deribit_proxy_protocol_errors_total",
        "Total inbound frames that could not be decoded"
    );
    describe_counter!(
        "deribit_proxy_correlation_misses_total",
        "Total responses whose id matched no pending request"
    );

    // Requests
    describe_counter!(
        "deribit_proxy_requests_total",
        "Total correlated requests by method and outcome"
    );
    describe_histogram!(
        "deribit_proxy_request_duration_seconds",
        "Round-trip time of correlated requests"
    );

    // Session
    describe_gauge!(
        "deribit_proxy_session_state",
        "Current upstream link state (1 for the active state)"
    );
    describe_counter!(
        "deribit_proxy_reconnects_total",
        "Total upstream reconnection attempts by result"
    );
    describe_counter!(
        "deribit_proxy_upstream_subscriptions_total",
        "Total upstream subscribe/unsubscribe requests by result"
    );

    // Fan-out
    describe_gauge!(
        "deribit_proxy_consumers",
        "Number of connected downstream consumers"
    );
    describe_gauge!(
        "deribit_proxy_subscribed_instruments",
        "Number of instruments with at least one subscriber"
    );
    describe_counter!(
        "deribit_proxy_snapshots_delivered_total",
        "Total snapshot deliveries to consumers"
    );
    describe_counter!(
        "deribit_proxy_snapshots_dropped_total",
        "Total snapshots overwritten in slow consumers' queues"
    );
    describe_counter!(
        "deribit_proxy_consumers_removed_total",
        "Total consumers removed by reason"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

/// Inbound frame classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Response to a correlated request.
    Response,
    /// Subscription push.
    Subscription,
    /// Venue heartbeat.
    Heartbeat,
    /// Transport pong.
    Pong,
}

impl FrameKind {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Response => "response",
            Self::Subscription => "subscription",
            Self::Heartbeat => "heartbeat",
            Self::Pong => "pong",
        }
    }
}

/// Outcome of a correlated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Venue returned a result.
    Success,
    /// Venue returned an error.
    Rejected,
    /// No response within the request timeout.
    Timeout,
    /// Session closed or the write failed.
    Failed,
}

impl RequestOutcome {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
        }
    }
}

/// Upstream subscription direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    /// `public/subscribe`.
    Subscribe,
    /// `public/unsubscribe`.
    Unsubscribe,
}

impl SubscriptionAction {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Why a consumer was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The consumer disconnected.
    Disconnected,
    /// Its outbound queue was gone during a broadcast.
    DeliveryFailed,
}

impl RemovalReason {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::DeliveryFailed => "delivery_failed",
        }
    }
}

const SESSION_STATES: [&str; 5] = [
    "disconnected",
    "connecting",
    "authenticating",
    "ready",
    "closed",
];

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record an inbound frame.
pub fn record_frame_received(kind: FrameKind) {
    counter!(
        "deribit_proxy_frames_received_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record an inbound frame that failed to decode.
pub fn record_protocol_error() {
    counter!("deribit_proxy_protocol_errors_total").increment(1);
}

/// Record a response whose id matched no pending request.
pub fn record_correlation_miss() {
    counter!("deribit_proxy_correlation_misses_total").increment(1);
}

/// Record a completed correlated request.
pub fn record_request(method: &str, outcome: RequestOutcome, duration: Duration) {
    counter!(
        "deribit_proxy_requests_total",
        "method" => method.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    histogram!(
        "deribit_proxy_request_duration_seconds",
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Publish the current link state; every other state is set to zero.
pub fn set_session_state(state: &str) {
    for candidate in SESSION_STATES {
        let value = if candidate == state { 1.0 } else { 0.0 };
        gauge!("deribit_proxy_session_state", "state" => candidate).set(value);
    }
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect(success: bool) {
    counter!(
        "deribit_proxy_reconnects_total",
        "result" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// Record an upstream subscribe/unsubscribe request.
pub fn record_upstream_subscription(action: SubscriptionAction, success: bool) {
    counter!(
        "deribit_proxy_upstream_subscriptions_total",
        "action" => action.as_str(),
        "result" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// Update the connected consumer count.
pub fn set_consumers(count: f64) {
    gauge!("deribit_proxy_consumers").set(count);
}

/// Update the subscribed instrument count.
pub fn set_subscribed_instruments(count: f64) {
    gauge!("deribit_proxy_subscribed_instruments").set(count);
}

/// Record deliveries of one broadcast snapshot.
pub fn record_snapshot_broadcast(deliveries: u64) {
    counter!("deribit_proxy_snapshots_delivered_total").increment(deliveries);
}

/// Record snapshots overwritten in a slow consumer's queue.
pub fn record_snapshots_dropped(count: u64) {
    counter!("deribit_proxy_snapshots_dropped_total").increment(count);
}

/// Record a consumer removal.
pub fn record_consumer_removed(reason: RemovalReason) {
    counter!(
        "deribit_proxy_consumers_removed_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
