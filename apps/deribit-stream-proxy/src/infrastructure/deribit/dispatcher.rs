//! Inbound Frame Dispatcher
//!
//! Single consumer of the link's frame queue. Frames are handled strictly in
//! arrival order:
//!
//! - responses resolve their pending request in the [`Correlator`]
//! - `book.*` pushes become [`StreamEvent::OrderBook`]
//! - venue `test_request` heartbeats are handed to the link's responder task
//! - anything else is logged, counted and discarded
//!
//! The dispatcher never writes to the transport itself, so a slow write can
//! never stall response routing.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::codec::{InboundFrame, JsonCodec};
use super::correlator::Correlator;
use super::messages::BookChannel;
use crate::domain::streaming::{Instrument, StreamEvent};
use crate::infrastructure::metrics::{self, FrameKind};

/// Heartbeat type that requires an answer.
pub const TEST_REQUEST: &str = "test_request";

/// Item on the link's internal frame queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    /// Inbound text frame.
    Frame(String),
    /// The transport ended; no frames follow.
    Closed(String),
}

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Response resolved pending request `id`.
    Resolved(u64),
    /// Response matched no pending request.
    Missed(u64),
    /// Order-book snapshot emitted.
    Snapshot(Instrument),
    /// Push on a channel this proxy does not route.
    Ignored(String),
    /// Venue `test_request`, forwarded to the responder.
    TestRequest,
    /// Plain venue heartbeat.
    Heartbeat,
    /// Malformed or unrecognized frame.
    Discarded,
}

/// Routes inbound frames to the correlator and the event stream.
pub struct Dispatcher {
    codec: JsonCodec,
    correlator: Arc<Correlator>,
    events: mpsc::Sender<StreamEvent>,
    test_requests: mpsc::UnboundedSender<()>,
}

impl Dispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub const fn new(
        correlator: Arc<Correlator>,
        events: mpsc::Sender<StreamEvent>,
        test_requests: mpsc::UnboundedSender<()>,
    ) -> Self {
        Self {
            codec: JsonCodec::new(),
            correlator,
            events,
            test_requests,
        }
    }

    /// Drain the queue until the transport-closed marker (or the queue's end).
    ///
    /// Returns the close reason.
    pub async fn run(self, mut queue: mpsc::UnboundedReceiver<QueueItem>) -> String {
        while let Some(item) = queue.recv().await {
            match item {
                QueueItem::Frame(text) => {
                    self.dispatch(&text).await;
                }
                QueueItem::Closed(reason) => return reason,
            }
        }
        "frame queue closed".to_string()
    }

    /// Handle one inbound frame.
    pub async fn dispatch(&self, text: &str) -> DispatchOutcome {
        let frame = match self.codec.decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed frame");
                metrics::record_protocol_error();
                return DispatchOutcome::Discarded;
            }
        };

        match frame {
            InboundFrame::Response { id, outcome } => {
                metrics::record_frame_received(FrameKind::Response);
                if self.correlator.resolve(id, outcome) {
                    DispatchOutcome::Resolved(id)
                } else {
                    DispatchOutcome::Missed(id)
                }
            }
            InboundFrame::Subscription { channel, data } => {
                metrics::record_frame_received(FrameKind::Subscription);
                if BookChannel::parse(&channel).is_none() {
                    tracing::debug!(channel = %channel, "Ignoring push on unrouted channel");
                    return DispatchOutcome::Ignored(channel);
                }

                match self.codec.decode_book(data) {
                    Ok(snapshot) => {
                        let instrument = snapshot.instrument.clone();
                        tracing::trace!(instrument = %instrument, timestamp = snapshot.timestamp, "Book snapshot");
                        if self.events.send(StreamEvent::OrderBook(snapshot)).await.is_err() {
                            tracing::debug!("Event receiver gone, snapshot dropped");
                        }
                        DispatchOutcome::Snapshot(instrument)
                    }
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "Discarding malformed book payload");
                        metrics::record_protocol_error();
                        DispatchOutcome::Discarded
                    }
                }
            }
            InboundFrame::Heartbeat { kind } => {
                metrics::record_frame_received(FrameKind::Heartbeat);
                if kind == TEST_REQUEST {
                    let _ = self.test_requests.send(());
                    DispatchOutcome::TestRequest
                } else {
                    DispatchOutcome::Heartbeat
                }
            }
        }
    }
}
