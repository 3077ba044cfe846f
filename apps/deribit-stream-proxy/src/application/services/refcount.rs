//! Upstream Subscription Reference Counter
//!
//! Serializes subscribe/unsubscribe work per instrument so the upstream
//! request for an instrument is issued exactly once per transition between
//! zero and one-or-more local subscribers.
//!
//! Callers take an [`InstrumentGate`] for the instrument, mutate the
//! membership table, and issue the upstream request through the gate while
//! still holding it. A second subscriber arriving during the first
//! subscriber's upstream request waits on the gate and then sees a non-empty
//! subscriber set, so it never fires a second request. The last unsubscriber
//! likewise finishes its upstream unsubscribe before a new first subscriber
//! can issue the next subscribe.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::application::ports::{UpstreamError, UpstreamPort};
use crate::domain::streaming::Instrument;
use crate::infrastructure::metrics::{self, SubscriptionAction};

// =============================================================================
// Reference Counter
// =============================================================================

/// Per-instrument serialization of upstream subscription requests.
pub struct ReferenceCounter {
    upstream: Arc<dyn UpstreamPort>,
    gates: Mutex<HashMap<Instrument, Arc<AsyncMutex<()>>>>,
    subscribes_issued: AtomicU64,
    unsubscribes_issued: AtomicU64,
}

impl std::fmt::Debug for ReferenceCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceCounter")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ReferenceCounter {
    /// Create a reference counter issuing requests through `upstream`.
    #[must_use]
    pub fn new(upstream: Arc<dyn UpstreamPort>) -> Self {
        Self {
            upstream,
            gates: Mutex::new(HashMap::new()),
            subscribes_issued: AtomicU64::new(0),
            unsubscribes_issued: AtomicU64::new(0),
        }
    }

    /// Acquire the gate for an instrument, waiting for any holder to finish.
    pub async fn lock(&self, instrument: &str) -> InstrumentGate<'_> {
        let gate = Arc::clone(
            self.gates
                .lock()
                .entry(instrument.to_string())
                .or_default(),
        );
        let guard = Arc::clone(&gate).lock_owned().await;

        InstrumentGate {
            owner: self,
            instrument: instrument.to_string(),
            gate,
            guard: Some(guard),
        }
    }

    /// Number of gates currently allocated (held or awaited).
    #[must_use]
    pub fn gate_count(&self) -> usize {
        self.gates.lock().len()
    }

    /// Upstream request counters.
    #[must_use]
    pub fn stats(&self) -> RefCountStats {
        RefCountStats {
            subscribes_issued: self.subscribes_issued.load(Ordering::Relaxed),
            unsubscribes_issued: self.unsubscribes_issued.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Instrument Gate
// =============================================================================

/// Exclusive hold on one instrument's subscription transitions.
///
/// Upstream requests can only be issued through a gate, so they are always
/// serialized with the membership change that triggered them.
pub struct InstrumentGate<'a> {
    owner: &'a ReferenceCounter,
    instrument: Instrument,
    gate: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl InstrumentGate<'_> {
    /// The instrument this gate covers.
    #[must_use]
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Issue the upstream subscribe for the 0→1 transition.
    ///
    /// # Errors
    ///
    /// Returns the upstream error unchanged; the caller decides whether to
    /// roll back the membership change.
    pub async fn subscribe_upstream(&self) -> Result<(), UpstreamError> {
        self.owner.subscribes_issued.fetch_add(1, Ordering::Relaxed);
        let result = self.owner.upstream.subscribe_book(&self.instrument).await;
        metrics::record_upstream_subscription(SubscriptionAction::Subscribe, result.is_ok());

        match &result {
            Ok(()) => tracing::info!(instrument = %self.instrument, "Upstream subscribed"),
            Err(e) => tracing::warn!(
                instrument = %self.instrument,
                error = %e,
                "Upstream subscribe failed"
            ),
        }
        result
    }

    /// Issue the upstream unsubscribe for the 1→0 transition.
    ///
    /// Best effort: a failure is logged and the local state stays released.
    pub async fn unsubscribe_upstream(&self) {
        self.owner.unsubscribes_issued.fetch_add(1, Ordering::Relaxed);
        let result = self.owner.upstream.unsubscribe_book(&self.instrument).await;
        metrics::record_upstream_subscription(SubscriptionAction::Unsubscribe, result.is_ok());

        match result {
            Ok(()) => tracing::info!(instrument = %self.instrument, "Upstream unsubscribed"),
            Err(e) => tracing::warn!(
                instrument = %self.instrument,
                error = %e,
                "Upstream unsubscribe failed"
            ),
        }
    }
}

impl Drop for InstrumentGate<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        // Prune the gate when nobody else holds or awaits it. Clones are only
        // taken under the map lock, so the count cannot grow while we check.
        let mut gates = self.owner.gates.lock();
        if Arc::strong_count(&self.gate) == 2 {
            gates.remove(&self.instrument);
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counts of upstream subscription requests issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefCountStats {
    /// Upstream subscribe requests issued.
    pub subscribes_issued: u64,
    /// Upstream unsubscribe requests issued.
    pub unsubscribes_issued: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::application::ports::MockUpstreamPort;

    #[tokio::test]
    async fn subscribe_through_gate_reaches_upstream() {
        let mut upstream = MockUpstreamPort::new();
        upstream
            .expect_subscribe_book()
            .times(1)
            .returning(|_| Ok(()));

        let counter = ReferenceCounter::new(Arc::new(upstream));
        let gate = counter.lock("BTC-PERPETUAL").await;
        assert_eq!(gate.instrument(), "BTC-PERPETUAL");
        gate.subscribe_upstream().await.unwrap();
        drop(gate);

        assert_eq!(counter.stats().subscribes_issued, 1);
        assert_eq!(counter.gate_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_failure_is_returned() {
        let mut upstream = MockUpstreamPort::new();
        upstream
            .expect_subscribe_book()
            .times(1)
            .returning(|_| Err(UpstreamError::Rejected("unknown instrument".to_string())));

        let counter = ReferenceCounter::new(Arc::new(upstream));
        let gate = counter.lock("NOPE").await;
        let err = gate.subscribe_upstream().await.unwrap_err();
        assert_eq!(err, UpstreamError::Rejected("unknown instrument".to_string()));
    }

    #[tokio::test]
    async fn unsubscribe_failure_is_swallowed() {
        let mut upstream = MockUpstreamPort::new();
        upstream
            .expect_unsubscribe_book()
            .times(1)
            .returning(|_| Err(UpstreamError::Unavailable("closed".to_string())));

        let counter = ReferenceCounter::new(Arc::new(upstream));
        counter.lock("BTC-PERPETUAL").await.unsubscribe_upstream().await;
        assert_eq!(counter.stats().unsubscribes_issued, 1);
    }

    #[tokio::test]
    async fn gate_excludes_second_holder() {
        let counter = Arc::new(ReferenceCounter::new(Arc::new(MockUpstreamPort::new())));
        let first = counter.lock("BTC-PERPETUAL").await;

        let waiter = {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let _gate = counter.lock("BTC-PERPETUAL").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.gate_count(), 0);
    }

    #[tokio::test]
    async fn different_instruments_do_not_block() {
        let counter = ReferenceCounter::new(Arc::new(MockUpstreamPort::new()));
        let _btc = counter.lock("BTC-PERPETUAL").await;

        let eth = tokio::time::timeout(Duration::from_millis(100), counter.lock("ETH-PERPETUAL"))
            .await;
        assert!(eth.is_ok());
    }
}
