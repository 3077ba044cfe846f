//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for session status and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status of the upstream session and the fan-out
//! - `GET /healthz` - liveness check (always OK while the process serves)
//! - `GET /readyz` - readiness check (OK only while the session is `Ready`)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::SharedFanOut;
use crate::infrastructure::deribit::{LinkState, UpstreamLink};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Proxy version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream session.
    pub session: SessionStatus,
    /// Downstream fan-out.
    pub fanout: FanOutStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Session ready.
    Healthy,
    /// Session being (re-)established.
    Degraded,
    /// No session.
    Unhealthy,
}

impl From<LinkState> for HealthStatus {
    fn from(state: LinkState) -> Self {
        match state {
            LinkState::Ready => Self::Healthy,
            LinkState::Connecting | LinkState::Authenticating => Self::Degraded,
            LinkState::Disconnected | LinkState::Closed => Self::Unhealthy,
        }
    }
}

/// Upstream session status.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Link state.
    pub state: LinkState,
    /// Authentication state.
    pub auth: &'static str,
    /// Connections established since startup.
    pub generation: u64,
    /// Outstanding correlated requests.
    pub pending_requests: usize,
}

/// Fan-out status.
#[derive(Debug, Clone, Serialize)]
pub struct FanOutStatus {
    /// Connected consumers.
    pub consumers: usize,
    /// Instruments with at least one subscriber.
    pub instruments: usize,
    /// Instruments with a cached snapshot.
    pub cached_snapshots: usize,
    /// Snapshots broadcast since startup.
    pub snapshots_broadcast: u64,
    /// Consumers removed after a failed delivery.
    pub consumers_dropped: u64,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
#[derive(Debug)]
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    link: UpstreamLink,
    fanout: SharedFanOut,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, link: UpstreamLink, fanout: SharedFanOut) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            link,
            fanout,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
#[derive(Debug)]
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.link.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let link_state = state.link.state();
    let stats = state.fanout.stats();

    HealthResponse {
        status: link_state.into(),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        session: SessionStatus {
            state: link_state,
            auth: link_state.auth_state().as_str(),
            generation: state.link.generation(),
            pending_requests: state.link.pending_requests(),
        },
        fanout: FanOutStatus {
            consumers: stats.consumers,
            instruments: stats.instruments,
            cached_snapshots: stats.cached_snapshots,
            snapshots_broadcast: stats.snapshots_broadcast,
            consumers_dropped: stats.consumers_dropped,
        },
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::application::ports::MockUpstreamPort;
    use crate::application::services::{FanOut, FanOutConfig};
    use crate::infrastructure::config::Credentials;
    use crate::infrastructure::deribit::{LinkConfig, MemoryConnector};

    fn state() -> HealthServerState {
        let (connector, _listener) = MemoryConnector::new();
        let (events, _rx) = mpsc::channel(1);
        let link = UpstreamLink::new(
            LinkConfig {
                connect_timeout: Duration::from_millis(100),
                ..LinkConfig::default()
            },
            Credentials::new("id".to_string(), "secret".to_string()),
            connector,
            events,
        );
        let fanout = Arc::new(FanOut::new(
            FanOutConfig::default(),
            Arc::new(MockUpstreamPort::new()),
        ));
        HealthServerState::new("0.1.0".to_string(), link, fanout)
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn status_follows_link_state() {
        assert_eq!(HealthStatus::from(LinkState::Ready), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from(LinkState::Authenticating), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from(LinkState::Closed), HealthStatus::Unhealthy);
    }

    #[test]
    fn response_reports_disconnected_session() {
        let state = state();
        let (_consumer, _rx) = state.fanout.on_connect();

        let response = build_health_response(&state);
        assert_eq!(response.status, HealthStatus::Unhealthy);
        assert_eq!(response.session.state, LinkState::Disconnected);
        assert_eq!(response.session.auth, "unauthenticated");
        assert_eq!(response.fanout.consumers, 1);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["session"]["state"], "disconnected");
        assert_eq!(json["version"], "0.1.0");
    }
}
