//! Request Correlator
//!
//! Pairs outbound requests with their responses. Every request gets an id
//! from a process-wide monotonic counter and a one-shot slot; the dispatcher
//! resolves the slot when the response with that id arrives.
//!
//! # Guarantees
//!
//! - Ids start at 1 and are never reused, including across reconnects.
//! - Each slot is fulfilled at most once. A late or duplicate response finds
//!   no slot and is counted as a correlation miss.
//! - [`Correlator::fail_all`] fulfils every outstanding slot with an error and
//!   refuses new allocations until [`Correlator::reopen`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use super::link::LinkState;
use super::messages::RpcError;
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// Failure of one correlated request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    /// The link is not in the `Ready` state.
    #[error("session not ready (state: {0})")]
    NotReady(LinkState),

    /// The session was closed before a response arrived.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// The transport failed while the request was outstanding.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The venue answered with an error.
    #[error("venue error: {0}")]
    Upstream(RpcError),

    /// No response arrived within the request timeout.
    #[error("request {id} timed out after {timeout:?}")]
    Timeout {
        /// Request id.
        id: u64,
        /// Configured timeout.
        timeout: Duration,
    },

    /// The request could not be serialized.
    #[error("failed to encode request: {0}")]
    Encode(String),
}

/// Receiving end of a pending request.
pub type ResponseSlot = oneshot::Receiver<Result<Value, RequestError>>;

// =============================================================================
// Correlator
// =============================================================================

#[derive(Debug, Default)]
struct PendingTable {
    slots: HashMap<u64, oneshot::Sender<Result<Value, RequestError>>>,
    closed: Option<String>,
}

/// Pending-request table keyed by correlation id.
#[derive(Debug)]
pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Create an open correlator whose first id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingTable::default()),
        }
    }

    /// Allocate an id and its result slot.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::SessionClosed`] after [`fail_all`](Self::fail_all)
    /// until the correlator is reopened.
    pub fn allocate(&self) -> Result<(u64, ResponseSlot), RequestError> {
        let mut pending = self.pending.lock();
        if let Some(reason) = &pending.closed {
            return Err(RequestError::SessionClosed(reason.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.slots.insert(id, tx);
        Ok((id, rx))
    }

    /// Fulfil the slot for `id`.
    ///
    /// Returns `false` (and counts a correlation miss) when no slot exists.
    pub fn resolve(&self, id: u64, outcome: Result<Value, RpcError>) -> bool {
        let slot = self.pending.lock().slots.remove(&id);
        let Some(tx) = slot else {
            tracing::warn!(id, "Response matched no pending request");
            metrics::record_correlation_miss();
            return false;
        };

        if tx.send(outcome.map_err(RequestError::Upstream)).is_err() {
            tracing::debug!(id, "Requester gone before response arrived");
        }
        true
    }

    /// Remove a slot without fulfilling it.
    pub fn cancel(&self, id: u64) -> bool {
        self.pending.lock().slots.remove(&id).is_some()
    }

    /// Fail every outstanding slot with `error` and close the correlator.
    ///
    /// Returns the number of requests failed.
    pub fn fail_all(&self, error: &RequestError) -> usize {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.closed = Some(error.to_string());
            pending.slots.drain().collect()
        };

        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        if count > 0 {
            tracing::warn!(count, error = %error, "Failed pending requests");
        }
        count
    }

    /// Accept allocations again for a new session.
    pub fn reopen(&self) {
        self.pending.lock().closed = None;
    }

    /// Whether the correlator refuses allocations.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed.is_some()
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().slots.len()
    }
}
