//! Session Supervisor
//!
//! Drains the link's event stream: snapshots go to the fan-out, and a closed
//! session is replaced by a new one.
//!
//! On `Closed` the supervisor drops every cached snapshot (they belong to the
//! dead session), then reconnects with exponential backoff. Once the new
//! session is `Ready` it re-issues the upstream subscription for every
//! instrument that still has local subscribers. A credential rejection stops
//! the supervisor, since retrying cannot succeed.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::link::UpstreamLink;
use super::reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
use crate::application::services::SharedFanOut;
use crate::domain::streaming::StreamEvent;
use crate::infrastructure::metrics;

/// Routes session events and owns reconnection.
#[derive(Debug)]
pub struct SessionSupervisor {
    link: UpstreamLink,
    fanout: SharedFanOut,
    reconnect: Option<ReconnectConfig>,
    cancel: CancellationToken,
}

impl SessionSupervisor {
    /// Create a supervisor. `reconnect: None` leaves a closed session closed.
    #[must_use]
    pub const fn new(
        link: UpstreamLink,
        fanout: SharedFanOut,
        reconnect: Option<ReconnectConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            link,
            fanout,
            reconnect,
            cancel,
        }
    }

    /// Run until cancelled or the event stream ends.
    ///
    /// # Errors
    ///
    /// Returns [`ReconnectError`] when reconnection gives up.
    pub async fn run(self, mut events: mpsc::Receiver<StreamEvent>) -> Result<(), ReconnectError> {
        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!("Session supervisor cancelled");
                    return Ok(());
                }
                event = events.recv() => event,
            };

            let Some(event) = event else {
                tracing::info!("Event stream ended");
                return Ok(());
            };

            match event {
                StreamEvent::OrderBook(snapshot) => {
                    self.fanout.update(snapshot);
                }
                StreamEvent::Connected => {
                    tracing::info!(generation = self.link.generation(), "Upstream session ready");
                }
                StreamEvent::Closed { reason } => {
                    // Failed reconnect attempts close their own session too;
                    // those events arrive after a later attempt succeeded.
                    if self.link.is_ready() {
                        tracing::debug!(reason = %reason, "Ignoring close of a superseded session");
                        continue;
                    }

                    let dropped = self.fanout.invalidate_snapshots();
                    tracing::warn!(reason = %reason, dropped, "Upstream session closed");

                    let Some(config) = self.reconnect.clone() else {
                        tracing::warn!("Reconnect disabled, session stays closed");
                        continue;
                    };

                    if !self.reconnect(config).await? {
                        return Ok(());
                    }

                    let fanout = self.fanout.clone();
                    tokio::spawn(async move {
                        fanout.resubscribe_all().await;
                    });
                }
            }
        }
    }

    /// Reconnect with backoff. Returns `false` when cancelled.
    async fn reconnect(&self, config: ReconnectConfig) -> Result<bool, ReconnectError> {
        let mut policy = ReconnectPolicy::new(config);

        loop {
            let Some(delay) = policy.next_delay() else {
                let attempts = policy.attempt_count();
                tracing::error!(attempts, "Giving up on reconnecting");
                return Err(ReconnectError::MaxAttemptsExceeded(attempts));
            };
            let attempt = policy.attempt_count();
            tracing::info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to venue"
            );

            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!("Session supervisor cancelled during reconnect delay");
                    return Ok(false);
                }
                () = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                () = self.cancel.cancelled() => return Ok(false),
                result = self.link.connect() => result,
            };

            match result {
                Ok(()) => {
                    metrics::record_reconnect(true);
                    tracing::info!(attempt, "Reconnected to venue");
                    return Ok(true);
                }
                Err(e) if e.is_credential_rejection() => {
                    metrics::record_reconnect(false);
                    tracing::error!(error = %e, "Venue rejected credentials, not retrying");
                    return Err(ReconnectError::AuthenticationRejected(e.to_string()));
                }
                Err(e) => {
                    metrics::record_reconnect(false);
                    tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                }
            }
        }
    }
}
