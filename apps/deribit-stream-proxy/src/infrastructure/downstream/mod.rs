//! Consumer WebSocket Endpoint
//!
//! `GET /ws` upgrades to a WebSocket; each connection is one consumer of the
//! fan-out.
//!
//! # Protocol
//!
//! Inbound commands:
//!
//! ```json
//! {"action": "subscribe", "instrument": "BTC-PERPETUAL"}
//! {"action": "unsubscribe", "instrument": "BTC-PERPETUAL"}
//! ```
//!
//! Outbound frames are either order-book snapshots
//! (`{"instrument", "bids", "asks", "timestamp"}`) or notices tagged by
//! `event` (`subscribed`, `unsubscribed`, `error`).
//!
//! A consumer that falls behind loses its oldest snapshots, never the
//! connection. Closing the socket releases every instrument it held.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{Router, extract::State, response::IntoResponse, routing::get};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::application::services::{ConsumerMessage, SharedFanOut};
use crate::domain::streaming::Instrument;
use crate::domain::subscription::ConsumerId;
use crate::infrastructure::metrics;

// =============================================================================
// Protocol
// =============================================================================

/// Command sent by a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConsumerCommand {
    /// Start receiving snapshots for an instrument.
    Subscribe {
        /// Instrument name.
        instrument: Instrument,
    },
    /// Stop receiving snapshots for an instrument.
    Unsubscribe {
        /// Instrument name.
        instrument: Instrument,
    },
}

/// Notice sent to a consumer in reply to a command, or unprompted when a
/// subscription is lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConsumerNotice {
    /// Subscription active.
    Subscribed {
        /// Instrument name.
        instrument: Instrument,
    },
    /// Subscription released (or was never held).
    Unsubscribed {
        /// Instrument name.
        instrument: Instrument,
    },
    /// The command failed, or a held subscription was lost upstream.
    Error {
        /// Instrument the command named, if it parsed.
        #[serde(skip_serializing_if = "Option::is_none")]
        instrument: Option<Instrument>,
        /// What went wrong.
        message: String,
    },
}

impl ConsumerNotice {
    fn error(instrument: Option<Instrument>, message: impl Into<String>) -> Self {
        Self::Error {
            instrument,
            message: message.into(),
        }
    }
}

/// Apply one command for `consumer` and build the reply.
pub async fn handle_command(
    fanout: &SharedFanOut,
    consumer: ConsumerId,
    command: ConsumerCommand,
) -> ConsumerNotice {
    match command {
        ConsumerCommand::Subscribe { instrument } => {
            match fanout.subscribe(consumer, &instrument).await {
                Ok(_) => ConsumerNotice::Subscribed { instrument },
                Err(e) => ConsumerNotice::error(Some(instrument), e.to_string()),
            }
        }
        ConsumerCommand::Unsubscribe { instrument } => {
            match fanout.unsubscribe(consumer, &instrument).await {
                Ok(_) => ConsumerNotice::Unsubscribed { instrument },
                Err(e) => ConsumerNotice::error(Some(instrument), e.to_string()),
            }
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// HTTP server hosting the consumer WebSocket endpoint.
#[derive(Debug)]
pub struct ConsumerServer {
    port: u16,
    fanout: SharedFanOut,
    cancel: CancellationToken,
}

#[derive(Clone)]
struct ConsumerState {
    fanout: SharedFanOut,
    cancel: CancellationToken,
}

impl ConsumerServer {
    /// Create a consumer server.
    #[must_use]
    pub const fn new(port: u16, fanout: SharedFanOut, cancel: CancellationToken) -> Self {
        Self {
            port,
            fanout,
            cancel,
        }
    }

    /// Serve consumers until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerServerError` if binding fails or the server stops
    /// with an error.
    pub async fn run(self) -> Result<(), ConsumerServerError> {
        let state = ConsumerState {
            fanout: self.fanout,
            cancel: self.cancel.clone(),
        };
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ConsumerServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Consumer server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ConsumerServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Consumer server stopped");
        Ok(())
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ConsumerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ConsumerState) {
    let ConsumerState { fanout, cancel } = state;
    let (consumer, mut snapshots) = fanout.on_connect();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            outbound = snapshots.recv() => match outbound {
                Ok(message) => {
                    let Some(text) = outbound_frame(message) else {
                        continue;
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(consumer, skipped, "Consumer lagging, oldest snapshots dropped");
                    metrics::record_snapshots_dropped(skipped);
                }
                // Outlet removed by the fan-out.
                Err(RecvError::Closed) => break,
            },
            message = socket.recv() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };

                let notice = match serde_json::from_str::<ConsumerCommand>(text.as_str()) {
                    Ok(command) => handle_command(&fanout, consumer, command).await,
                    Err(e) => ConsumerNotice::error(None, format!("invalid command: {e}")),
                };
                let Ok(reply) = serde_json::to_string(&notice) else {
                    continue;
                };
                if socket.send(Message::Text(reply.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    fanout.on_disconnect(consumer).await;
    tracing::info!(consumer, "Consumer disconnected");
}

/// Text frame for an entry of the consumer's outbound queue.
fn outbound_frame(message: ConsumerMessage) -> Option<String> {
    match message {
        ConsumerMessage::Snapshot(snapshot) => serde_json::to_string(&*snapshot).ok(),
        ConsumerMessage::SubscriptionLost { instrument, reason } => serde_json::to_string(
            &ConsumerNotice::error(Some(instrument), format!("subscription lost: {reason}")),
        )
        .ok(),
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Consumer server errors.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerServerError {
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
    use std::sync::Arc;

    use serde_json::json;
    use test_case::test_case;

    use super::*;
    use crate::application::ports::{MockUpstreamPort, UpstreamError};
    use crate::application::services::{FanOut, FanOutConfig};

    fn fanout(upstream: MockUpstreamPort) -> SharedFanOut {
        Arc::new(FanOut::new(FanOutConfig::default(), Arc::new(upstream)))
    }

    #[test_case(r#"{"action":"subscribe","instrument":"BTC-PERPETUAL"}"#,
        ConsumerCommand::Subscribe { instrument: "BTC-PERPETUAL".to_string() }; "subscribe")]
    #[test_case(r#"{"action":"unsubscribe","instrument":"ETH-PERPETUAL"}"#,
        ConsumerCommand::Unsubscribe { instrument: "ETH-PERPETUAL".to_string() }; "unsubscribe")]
    fn parses_commands(raw: &str, expected: ConsumerCommand) {
        assert_eq!(serde_json::from_str::<ConsumerCommand>(raw).unwrap(), expected);
    }

    #[test_case(r#"{"action":"refresh","instrument":"BTC-PERPETUAL"}"#; "unknown action")]
    #[test_case(r#"{"action":"subscribe"}"#; "missing instrument")]
    #[test_case("subscribe BTC"; "not json")]
    fn rejects_malformed_commands(raw: &str) {
        assert!(serde_json::from_str::<ConsumerCommand>(raw).is_err());
    }

    #[test]
    fn notices_are_tagged_by_event() {
        let subscribed = ConsumerNotice::Subscribed {
            instrument: "BTC-PERPETUAL".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&subscribed).unwrap(),
            json!({"event": "subscribed", "instrument": "BTC-PERPETUAL"})
        );

        let error = ConsumerNotice::error(None, "invalid command");
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"event": "error", "message": "invalid command"})
        );
    }

    #[test]
    fn lost_subscription_is_framed_as_error_notice() {
        let frame = outbound_frame(ConsumerMessage::SubscriptionLost {
            instrument: "BTC-PERPETUAL".to_string(),
            reason: "venue rejected request: not found".to_string(),
        })
        .unwrap();

        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&frame).unwrap(),
            json!({
                "event": "error",
                "instrument": "BTC-PERPETUAL",
                "message": "subscription lost: venue rejected request: not found"
            })
        );
    }

    #[tokio::test]
    async fn subscribe_command_reaches_upstream_once() {
        let mut upstream = MockUpstreamPort::new();
        upstream
            .expect_subscribe_book()
            .times(1)
            .returning(|_| Ok(()));
        let fanout = fanout(upstream);
        let (a, _rx_a) = fanout.on_connect();
        let (b, _rx_b) = fanout.on_connect();

        let command = ConsumerCommand::Subscribe {
            instrument: "BTC-PERPETUAL".to_string(),
        };
        for consumer in [a, b] {
            assert_eq!(
                handle_command(&fanout, consumer, command.clone()).await,
                ConsumerNotice::Subscribed {
                    instrument: "BTC-PERPETUAL".to_string()
                }
            );
        }
        assert_eq!(fanout.subscribers("BTC-PERPETUAL").len(), 2);
    }

    #[tokio::test]
    async fn rejected_subscribe_reports_error() {
        let mut upstream = MockUpstreamPort::new();
        upstream
            .expect_subscribe_book()
            .returning(|_| Err(UpstreamError::Rejected("unknown instrument".to_string())));
        let fanout = fanout(upstream);
        let (consumer, _rx) = fanout.on_connect();

        let notice = handle_command(
            &fanout,
            consumer,
            ConsumerCommand::Subscribe {
                instrument: "NOPE".to_string(),
            },
        )
        .await;

        assert!(matches!(
            notice,
            ConsumerNotice::Error { instrument: Some(ref i), .. } if i == "NOPE"
        ));
        assert!(fanout.consumer_instruments(consumer).is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_without_subscription_is_acknowledged() {
        let fanout = fanout(MockUpstreamPort::new());
        let (consumer, _rx) = fanout.on_connect();

        let notice = handle_command(
            &fanout,
            consumer,
            ConsumerCommand::Unsubscribe {
                instrument: "BTC-PERPETUAL".to_string(),
            },
        )
        .await;
        assert_eq!(
            notice,
            ConsumerNotice::Unsubscribed {
                instrument: "BTC-PERPETUAL".to_string()
            }
        );
    }
}
