//! Subscription Fan-out
//!
//! Owns the downstream consumer registry, the consumer/instrument membership
//! table and the latest snapshot per instrument. Upstream subscription
//! transitions go through the [`ReferenceCounter`].
//!
//! # Delivery
//!
//! Every consumer gets its own bounded `tokio::sync::broadcast` queue of
//! [`ConsumerMessage`]s. A full queue overwrites its oldest entry (the
//! consumer sees `RecvError::Lagged` and continues with the newest), so a
//! slow consumer never stalls the broadcast loop. A queue whose receiver is
//! gone is treated as an implicit disconnect.
//!
//! # Session replacement
//!
//! After a new session replaced a closed one, [`FanOut::resubscribe_all`]
//! restores every instrument that still has subscribers. An instrument the
//! venue refuses to restore is released locally: each of its subscribers is
//! dropped from it and told so with [`ConsumerMessage::SubscriptionLost`],
//! and the next subscriber starts a fresh upstream subscription.
//!
//! # Locking
//!
//! Locks are never held across an `.await` or across delivery: `update`
//! copies the recipient list, releases every lock, then sends.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::refcount::{InstrumentGate, RefCountStats, ReferenceCounter};
use crate::application::ports::{UpstreamError, UpstreamPort};
use crate::domain::streaming::{Instrument, OrderBookSnapshot};
use crate::domain::subscription::{
    ConsumerId, SubscribeOutcome, SubscriptionManager, UnknownConsumer, UnsubscribeOutcome,
};
use crate::infrastructure::config::FanOutSettings;
use crate::infrastructure::metrics::{self, RemovalReason};

/// Entry on a consumer's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerMessage {
    /// Latest snapshot of a subscribed instrument.
    Snapshot(Arc<OrderBookSnapshot>),
    /// The consumer no longer holds `instrument`: the venue refused to
    /// restore it on a new session.
    SubscriptionLost {
        /// Instrument that was released.
        instrument: Instrument,
        /// Upstream failure.
        reason: String,
    },
}

impl ConsumerMessage {
    /// The snapshot carried by this message, if any.
    #[must_use]
    pub fn into_snapshot(self) -> Option<Arc<OrderBookSnapshot>> {
        match self {
            Self::Snapshot(snapshot) => Some(snapshot),
            Self::SubscriptionLost { .. } => None,
        }
    }
}

/// Receiving half of a consumer's outbound queue.
pub type ConsumerReceiver = broadcast::Receiver<ConsumerMessage>;

type ConsumerSender = broadcast::Sender<ConsumerMessage>;

// =============================================================================
// Configuration
// =============================================================================

/// Fan-out configuration.
#[derive(Debug, Clone, Copy)]
pub struct FanOutConfig {
    /// Snapshots buffered per consumer before the oldest is dropped.
    pub consumer_buffer: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            consumer_buffer: 256,
        }
    }
}

impl From<FanOutSettings> for FanOutConfig {
    fn from(settings: FanOutSettings) -> Self {
        Self {
            consumer_buffer: settings.consumer_buffer,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors returned to a consumer's subscribe/unsubscribe call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FanOutError {
    /// The consumer is not (or no longer) connected.
    #[error(transparent)]
    UnknownConsumer(#[from] UnknownConsumer),

    /// The venue did not accept the subscription; the consumer was rolled
    /// back out of the instrument.
    #[error("upstream subscribe for {instrument} failed: {source}")]
    Upstream {
        /// Instrument that failed.
        instrument: Instrument,
        /// Upstream failure.
        source: UpstreamError,
    },
}

// =============================================================================
// Fan-out
// =============================================================================

/// Consumer registry, snapshot cache and broadcast.
pub struct FanOut {
    config: FanOutConfig,
    next_consumer: AtomicU64,
    outlets: RwLock<HashMap<ConsumerId, ConsumerSender>>,
    subscriptions: SubscriptionManager,
    snapshots: RwLock<HashMap<Instrument, Arc<OrderBookSnapshot>>>,
    refcount: ReferenceCounter,
    snapshots_broadcast: AtomicU64,
    deliveries: AtomicU64,
    consumers_dropped: AtomicU64,
}

impl std::fmt::Debug for FanOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOut")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Shared fan-out handle.
pub type SharedFanOut = Arc<FanOut>;

impl FanOut {
    /// Create a fan-out whose upstream transitions go through `upstream`.
    #[must_use]
    pub fn new(config: FanOutConfig, upstream: Arc<dyn UpstreamPort>) -> Self {
        Self {
            config,
            next_consumer: AtomicU64::new(1),
            outlets: RwLock::new(HashMap::new()),
            subscriptions: SubscriptionManager::new(),
            snapshots: RwLock::new(HashMap::new()),
            refcount: ReferenceCounter::new(upstream),
            snapshots_broadcast: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            consumers_dropped: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Consumer lifecycle
    // -------------------------------------------------------------------------

    /// Register a new consumer.
    ///
    /// Returns its identifier and the receiving half of its outbound queue.
    pub fn on_connect(&self) -> (ConsumerId, ConsumerReceiver) {
        let consumer = self.next_consumer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = broadcast::channel(self.config.consumer_buffer.max(1));

        let count = {
            let mut outlets = self.outlets.write();
            outlets.insert(consumer, tx);
            outlets.len()
        };
        self.subscriptions.register(consumer);

        #[allow(clippy::cast_precision_loss)]
        metrics::set_consumers(count as f64);
        tracing::info!(consumer, "Consumer connected");

        (consumer, rx)
    }

    /// Handle a consumer disconnect. Same as [`remove_consumer`](Self::remove_consumer).
    pub async fn on_disconnect(&self, consumer: ConsumerId) {
        let _ = self.remove_consumer(consumer).await;
    }

    /// Remove a consumer and release every instrument it held.
    ///
    /// Idempotent and safe to call while a broadcast touching the consumer is
    /// in flight. Returns how many instruments lost their last subscriber.
    pub async fn remove_consumer(&self, consumer: ConsumerId) -> usize {
        self.remove_consumer_with(consumer, RemovalReason::Disconnected)
            .await
    }

    async fn remove_consumer_with(&self, consumer: ConsumerId, reason: RemovalReason) -> usize {
        let (outlet, remaining) = {
            let mut outlets = self.outlets.write();
            let outlet = outlets.remove(&consumer);
            (outlet, outlets.len())
        };
        let held = self.subscriptions.deregister(consumer);

        if outlet.is_none() && held.is_empty() {
            return 0;
        }

        let mut released = 0;
        for instrument in &held {
            let gate = self.refcount.lock(instrument).await;
            if self.subscriptions.remove(consumer, instrument) == UnsubscribeOutcome::LastSubscriber
            {
                self.release(&gate).await;
                released += 1;
            }
        }

        #[allow(clippy::cast_precision_loss)]
        metrics::set_consumers(remaining as f64);
        metrics::record_consumer_removed(reason);
        self.publish_instrument_gauge();
        tracing::info!(
            consumer,
            reason = reason.as_str(),
            instruments = held.len(),
            released,
            "Consumer removed"
        );

        released
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Subscribe a consumer to an instrument.
    ///
    /// The first subscriber triggers the upstream subscribe; if the venue
    /// refuses it the consumer is rolled back out and the error returned.
    /// Later subscribers receive the cached snapshot right away.
    ///
    /// # Errors
    ///
    /// Returns [`FanOutError::UnknownConsumer`] for a consumer that is not
    /// connected and [`FanOutError::Upstream`] when the upstream subscribe
    /// fails.
    pub async fn subscribe(
        &self,
        consumer: ConsumerId,
        instrument: &str,
    ) -> Result<SubscribeOutcome, FanOutError> {
        let gate = self.refcount.lock(instrument).await;
        let outcome = self.subscriptions.add(consumer, instrument)?;

        match outcome {
            SubscribeOutcome::FirstSubscriber => {
                // Anything cached now predates this subscription interval.
                self.snapshots.write().remove(instrument);

                if let Err(source) = gate.subscribe_upstream().await {
                    let _ = self.subscriptions.remove(consumer, instrument);
                    self.publish_instrument_gauge();
                    return Err(FanOutError::Upstream {
                        instrument: instrument.to_string(),
                        source,
                    });
                }
            }
            SubscribeOutcome::AdditionalSubscriber => {
                if let Some(snapshot) = self.cached(instrument) {
                    self.deliver_to(consumer, snapshot);
                }
            }
            SubscribeOutcome::AlreadySubscribed => {}
        }
        drop(gate);

        self.publish_instrument_gauge();
        tracing::debug!(consumer, instrument, ?outcome, "Consumer subscribed");
        Ok(outcome)
    }

    /// Unsubscribe a consumer from an instrument.
    ///
    /// The last subscriber triggers the upstream unsubscribe.
    ///
    /// # Errors
    ///
    /// Returns [`FanOutError::UnknownConsumer`] for a consumer that is not
    /// connected.
    pub async fn unsubscribe(
        &self,
        consumer: ConsumerId,
        instrument: &str,
    ) -> Result<UnsubscribeOutcome, FanOutError> {
        if !self.subscriptions.is_registered(consumer) {
            return Err(UnknownConsumer(consumer).into());
        }

        let gate = self.refcount.lock(instrument).await;
        let outcome = self.subscriptions.remove(consumer, instrument);
        if outcome == UnsubscribeOutcome::LastSubscriber {
            self.release(&gate).await;
        }
        drop(gate);

        self.publish_instrument_gauge();
        tracing::debug!(consumer, instrument, ?outcome, "Consumer unsubscribed");
        Ok(outcome)
    }

    /// Re-issue the upstream subscribe for every instrument that still has
    /// local subscribers. Used after a new session replaced a closed one.
    ///
    /// An instrument whose subscribe fails loses all of its local
    /// subscribers, each notified with [`ConsumerMessage::SubscriptionLost`].
    /// Returns how many instruments were resubscribed successfully.
    pub async fn resubscribe_all(&self) -> usize {
        let mut restored = 0;
        let mut lost = 0;
        for instrument in self.subscriptions.active_instruments() {
            let gate = self.refcount.lock(&instrument).await;
            if !self.subscriptions.is_active(&instrument) {
                continue;
            }
            match gate.subscribe_upstream().await {
                Ok(()) => restored += 1,
                Err(source) => {
                    let released = self.release_locally(&gate, &source);
                    lost += 1;
                    tracing::warn!(
                        instrument = %instrument,
                        error = %source,
                        released,
                        "Resubscribe failed, subscribers released"
                    );
                }
            }
        }
        if lost > 0 {
            self.publish_instrument_gauge();
        }
        tracing::info!(restored, lost, "Resubscribed active instruments");
        restored
    }

    /// Drop every subscriber of an instrument the venue is not streaming.
    /// No upstream unsubscribe is sent. Returns how many consumers were
    /// released.
    fn release_locally(&self, gate: &InstrumentGate<'_>, source: &UpstreamError) -> usize {
        let instrument = gate.instrument();
        self.snapshots.write().remove(instrument);

        let subscribers = self.subscriptions.subscribers(instrument);
        for &consumer in &subscribers {
            let _ = self.subscriptions.remove(consumer, instrument);
            self.send_to(
                consumer,
                ConsumerMessage::SubscriptionLost {
                    instrument: instrument.to_string(),
                    reason: source.to_string(),
                },
            );
        }
        subscribers.len()
    }

    async fn release(&self, gate: &InstrumentGate<'_>) {
        self.snapshots.write().remove(gate.instrument());
        gate.unsubscribe_upstream().await;
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Replace the cached snapshot and broadcast it to current subscribers.
    ///
    /// A snapshot for an instrument nobody holds is still cached; that only
    /// happens while an unsubscribe is in flight. Consumers whose queue is
    /// gone are removed in the background. Returns the number of consumers
    /// the snapshot was delivered to.
    pub fn update(self: &Arc<Self>, snapshot: OrderBookSnapshot) -> usize {
        let snapshot = Arc::new(snapshot);
        self.snapshots
            .write()
            .insert(snapshot.instrument.clone(), Arc::clone(&snapshot));

        let recipients: Vec<(ConsumerId, ConsumerSender)> = {
            let subscribers = self.subscriptions.subscribers(&snapshot.instrument);
            let outlets = self.outlets.read();
            subscribers
                .into_iter()
                .filter_map(|id| outlets.get(&id).map(|tx| (id, tx.clone())))
                .collect()
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (consumer, tx) in recipients {
            if tx.send(ConsumerMessage::Snapshot(Arc::clone(&snapshot))).is_ok() {
                delivered += 1;
            } else {
                failed.push(consumer);
            }
        }

        self.snapshots_broadcast.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        metrics::record_snapshot_broadcast(delivered as u64);

        for consumer in failed {
            tracing::warn!(consumer, instrument = %snapshot.instrument, "Delivery failed, removing consumer");
            self.consumers_dropped.fetch_add(1, Ordering::Relaxed);
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.remove_consumer_with(consumer, RemovalReason::DeliveryFailed)
                    .await;
            });
        }

        delivered
    }

    /// Latest cached snapshot for an instrument.
    #[must_use]
    pub fn cached(&self, instrument: &str) -> Option<Arc<OrderBookSnapshot>> {
        self.snapshots.read().get(instrument).cloned()
    }

    /// Drop every cached snapshot. Returns how many were dropped.
    pub fn invalidate_snapshots(&self) -> usize {
        let mut snapshots = self.snapshots.write();
        let count = snapshots.len();
        snapshots.clear();
        count
    }

    fn deliver_to(&self, consumer: ConsumerId, snapshot: Arc<OrderBookSnapshot>) {
        if self.send_to(consumer, ConsumerMessage::Snapshot(snapshot)) {
            self.deliveries.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn send_to(&self, consumer: ConsumerId, message: ConsumerMessage) -> bool {
        let outlet = self.outlets.read().get(&consumer).cloned();
        outlet.is_some_and(|tx| tx.send(message).is_ok())
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Consumers currently subscribed to an instrument.
    #[must_use]
    pub fn subscribers(&self, instrument: &str) -> Vec<ConsumerId> {
        self.subscriptions.subscribers(instrument)
    }

    /// Instruments a consumer is subscribed to.
    #[must_use]
    pub fn consumer_instruments(&self, consumer: ConsumerId) -> Vec<Instrument> {
        self.subscriptions.consumer_instruments(consumer)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> FanOutStats {
        let subscriptions = self.subscriptions.stats();
        FanOutStats {
            consumers: self.outlets.read().len(),
            instruments: subscriptions.instrument_count,
            cached_snapshots: self.snapshots.read().len(),
            snapshots_broadcast: self.snapshots_broadcast.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            consumers_dropped: self.consumers_dropped.load(Ordering::Relaxed),
            upstream: self.refcount.stats(),
        }
    }

    fn publish_instrument_gauge(&self) {
        #[allow(clippy::cast_precision_loss)]
        metrics::set_subscribed_instruments(self.subscriptions.stats().instrument_count as f64);
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Fan-out statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutStats {
    /// Connected consumers.
    pub consumers: usize,
    /// Instruments with at least one subscriber.
    pub instruments: usize,
    /// Instruments with a cached snapshot.
    pub cached_snapshots: usize,
    /// Snapshots processed by `update`.
    pub snapshots_broadcast: u64,
    /// Individual snapshot deliveries.
    pub deliveries: u64,
    /// Consumers removed because delivery failed.
    pub consumers_dropped: u64,
    /// Upstream request counters.
    pub upstream: RefCountStats,
}

// =============================================================================
// Tests
// =============================================================================
