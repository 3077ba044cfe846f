//! Subscription Membership
//!
//! Domain types for tracking which consumers are subscribed to which
//! instruments, and detecting the transitions that require an upstream
//! subscribe or unsubscribe.
//!
//! # Design
//!
//! The subscription manager tracks:
//! - Which consumers are registered
//! - Which instruments each consumer is subscribed to
//! - Which consumers are subscribed to each instrument
//!
//! An instrument's subscriber set going from empty to non-empty is reported
//! as [`SubscribeOutcome::FirstSubscriber`]; going from non-empty to empty is
//! reported as [`UnsubscribeOutcome::LastSubscriber`]. Callers turn those
//! outcomes into exactly one upstream request each.
//!
//! Deregistering a consumer removes it from the registry at once but leaves
//! its per-instrument memberships in place; the caller releases them one
//! instrument at a time so each release can be serialized with the upstream
//! request it may trigger.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::domain::streaming::Instrument;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a downstream consumer.
pub type ConsumerId = u64;

/// Result of adding a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The instrument had no subscribers before; upstream subscribe needed.
    FirstSubscriber,
    /// Other consumers already hold the instrument.
    AdditionalSubscriber,
    /// This consumer already held the instrument; nothing changed.
    AlreadySubscribed,
}

/// Result of removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// The consumer was the last one; upstream unsubscribe needed.
    LastSubscriber,
    /// Other consumers still hold the instrument.
    RemainingSubscribers,
    /// The consumer did not hold the instrument; nothing changed.
    NotSubscribed,
}

/// Subscription request from a consumer that is not registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("consumer {0} is not connected")]
pub struct UnknownConsumer(pub ConsumerId);

// =============================================================================
// Subscription State
// =============================================================================

#[derive(Debug, Default)]
struct SubscriptionState {
    /// Registered consumers and their instruments.
    consumer_instruments: HashMap<ConsumerId, HashSet<Instrument>>,
    /// Instruments with at least one subscriber, and who holds them.
    instrument_consumers: HashMap<Instrument, HashSet<ConsumerId>>,
}

impl SubscriptionState {
    fn add(
        &mut self,
        consumer: ConsumerId,
        instrument: &str,
    ) -> Result<SubscribeOutcome, UnknownConsumer> {
        let held = self
            .consumer_instruments
            .get_mut(&consumer)
            .ok_or(UnknownConsumer(consumer))?;

        if !held.insert(instrument.to_string()) {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }

        let subscribers = self
            .instrument_consumers
            .entry(instrument.to_string())
            .or_default();
        subscribers.insert(consumer);

        if subscribers.len() == 1 {
            Ok(SubscribeOutcome::FirstSubscriber)
        } else {
            Ok(SubscribeOutcome::AdditionalSubscriber)
        }
    }

    fn remove(&mut self, consumer: ConsumerId, instrument: &str) -> UnsubscribeOutcome {
        if let Some(held) = self.consumer_instruments.get_mut(&consumer) {
            held.remove(instrument);
        }

        let Some(subscribers) = self.instrument_consumers.get_mut(instrument) else {
            return UnsubscribeOutcome::NotSubscribed;
        };

        if !subscribers.remove(&consumer) {
            return UnsubscribeOutcome::NotSubscribed;
        }

        if subscribers.is_empty() {
            self.instrument_consumers.remove(instrument);
            UnsubscribeOutcome::LastSubscriber
        } else {
            UnsubscribeOutcome::RemainingSubscribers
        }
    }
}

// =============================================================================
// Subscription Manager
// =============================================================================

/// Thread-safe consumer/instrument membership table.
///
/// # Example
///
/// ```rust
/// use deribit_stream_proxy::domain::subscription::{
///     SubscribeOutcome, SubscriptionManager, UnsubscribeOutcome,
/// };
///
/// let manager = SubscriptionManager::new();
/// manager.register(1);
/// manager.register(2);
///
/// // First subscriber triggers an upstream subscribe
/// assert_eq!(manager.add(1, "BTC-PERPETUAL"), Ok(SubscribeOutcome::FirstSubscriber));
///
/// // Second subscriber shares it
/// assert_eq!(manager.add(2, "BTC-PERPETUAL"), Ok(SubscribeOutcome::AdditionalSubscriber));
///
/// // Consumer 1 leaves, consumer 2 still holds it
/// assert_eq!(manager.remove(1, "BTC-PERPETUAL"), UnsubscribeOutcome::RemainingSubscribers);
///
/// // Last subscriber leaves, upstream unsubscribe needed
/// assert_eq!(manager.remove(2, "BTC-PERPETUAL"), UnsubscribeOutcome::LastSubscriber);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    state: RwLock<SubscriptionState>,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer so it can subscribe.
    ///
    /// Registering an already registered consumer keeps its subscriptions.
    pub fn register(&self, consumer: ConsumerId) {
        self.state
            .write()
            .consumer_instruments
            .entry(consumer)
            .or_default();
    }

    /// Whether a consumer is registered.
    #[must_use]
    pub fn is_registered(&self, consumer: ConsumerId) -> bool {
        self.state.read().consumer_instruments.contains_key(&consumer)
    }

    /// Subscribe a registered consumer to an instrument.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownConsumer`] if the consumer is not registered (never
    /// connected, or already deregistered).
    pub fn add(
        &self,
        consumer: ConsumerId,
        instrument: &str,
    ) -> Result<SubscribeOutcome, UnknownConsumer> {
        self.state.write().add(consumer, instrument)
    }

    /// Remove a consumer from an instrument's subscriber set.
    ///
    /// Works for deregistered consumers too, which is how their leftover
    /// memberships are released.
    pub fn remove(&self, consumer: ConsumerId, instrument: &str) -> UnsubscribeOutcome {
        self.state.write().remove(consumer, instrument)
    }

    /// Deregister a consumer.
    ///
    /// Returns the instruments it held; their memberships stay in place until
    /// released with [`remove`](Self::remove). Returns an empty list if the
    /// consumer was not registered, so concurrent callers release each
    /// instrument at most once.
    pub fn deregister(&self, consumer: ConsumerId) -> Vec<Instrument> {
        self.state
            .write()
            .consumer_instruments
            .remove(&consumer)
            .map(|held| held.into_iter().collect())
            .unwrap_or_default()
    }

    /// Consumers currently subscribed to an instrument.
    #[must_use]
    pub fn subscribers(&self, instrument: &str) -> Vec<ConsumerId> {
        self.state
            .read()
            .instrument_consumers
            .get(instrument)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Instruments a consumer is subscribed to.
    #[must_use]
    pub fn consumer_instruments(&self, consumer: ConsumerId) -> Vec<Instrument> {
        self.state
            .read()
            .consumer_instruments
            .get(&consumer)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Instruments with at least one subscriber.
    #[must_use]
    pub fn active_instruments(&self) -> Vec<Instrument> {
        self.state
            .read()
            .instrument_consumers
            .keys()
            .cloned()
            .collect()
    }

    /// Whether an instrument has at least one subscriber.
    #[must_use]
    pub fn is_active(&self, instrument: &str) -> bool {
        self.state
            .read()
            .instrument_consumers
            .contains_key(instrument)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let state = self.state.read();
        SubscriptionStats {
            consumer_count: state.consumer_instruments.len(),
            instrument_count: state.instrument_consumers.len(),
            membership_count: state.instrument_consumers.values().map(HashSet::len).sum(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Subscription statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Registered consumers.
    pub consumer_count: usize,
    /// Instruments with at least one subscriber.
    pub instrument_count: usize,
    /// Total (consumer, instrument) pairs.
    pub membership_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(consumers: &[ConsumerId]) -> SubscriptionManager {
        let manager = SubscriptionManager::new();
        for consumer in consumers {
            manager.register(*consumer);
        }
        manager
    }

    #[test]
    fn add_subscription_new_instrument() {
        let manager = manager_with(&[1]);
        assert_eq!(
            manager.add(1, "BTC-PERPETUAL"),
            Ok(SubscribeOutcome::FirstSubscriber)
        );
        assert!(manager.is_active("BTC-PERPETUAL"));
    }

    #[test]
    fn add_subscription_existing_instrument() {
        let manager = manager_with(&[1, 2]);
        manager.add(1, "BTC-PERPETUAL").unwrap();

        assert_eq!(
            manager.add(2, "BTC-PERPETUAL"),
            Ok(SubscribeOutcome::AdditionalSubscriber)
        );
    }

    #[test]
    fn add_subscription_duplicate_consumer() {
        let manager = manager_with(&[1]);
        manager.add(1, "BTC-PERPETUAL").unwrap();

        assert_eq!(
            manager.add(1, "BTC-PERPETUAL"),
            Ok(SubscribeOutcome::AlreadySubscribed)
        );
        assert_eq!(manager.subscribers("BTC-PERPETUAL"), vec![1]);
    }

    #[test]
    fn add_rejects_unregistered_consumer() {
        let manager = SubscriptionManager::new();
        assert_eq!(manager.add(7, "BTC-PERPETUAL"), Err(UnknownConsumer(7)));
        assert!(!manager.is_active("BTC-PERPETUAL"));
    }

    #[test]
    fn remove_subscription_with_remaining_consumers() {
        let manager = manager_with(&[1, 2]);
        manager.add(1, "BTC-PERPETUAL").unwrap();
        manager.add(2, "BTC-PERPETUAL").unwrap();

        assert_eq!(
            manager.remove(1, "BTC-PERPETUAL"),
            UnsubscribeOutcome::RemainingSubscribers
        );
        assert_eq!(manager.subscribers("BTC-PERPETUAL"), vec![2]);
    }

    #[test]
    fn remove_subscription_last_consumer() {
        let manager = manager_with(&[1]);
        manager.add(1, "BTC-PERPETUAL").unwrap();

        assert_eq!(
            manager.remove(1, "BTC-PERPETUAL"),
            UnsubscribeOutcome::LastSubscriber
        );
        assert!(!manager.is_active("BTC-PERPETUAL"));
        assert!(manager.consumer_instruments(1).is_empty());
    }

    #[test]
    fn remove_nonexistent_subscription() {
        let manager = manager_with(&[1, 2]);
        manager.add(2, "BTC-PERPETUAL").unwrap();

        assert_eq!(
            manager.remove(1, "BTC-PERPETUAL"),
            UnsubscribeOutcome::NotSubscribed
        );
        assert_eq!(
            manager.remove(1, "ETH-PERPETUAL"),
            UnsubscribeOutcome::NotSubscribed
        );
        assert!(manager.is_active("BTC-PERPETUAL"));
    }

    #[test]
    fn deregister_returns_held_instruments_once() {
        let manager = manager_with(&[1]);
        manager.add(1, "BTC-PERPETUAL").unwrap();
        manager.add(1, "ETH-PERPETUAL").unwrap();

        let mut held = manager.deregister(1);
        held.sort();
        assert_eq!(held, vec!["BTC-PERPETUAL", "ETH-PERPETUAL"]);

        // Second call finds nothing
        assert!(manager.deregister(1).is_empty());
        assert!(!manager.is_registered(1));
    }

    #[test]
    fn deregistered_consumer_memberships_release_individually() {
        let manager = manager_with(&[1, 2]);
        manager.add(1, "BTC-PERPETUAL").unwrap();
        manager.add(2, "BTC-PERPETUAL").unwrap();
        manager.add(1, "ETH-PERPETUAL").unwrap();

        let held = manager.deregister(1);
        assert_eq!(held.len(), 2);

        // Memberships stay until released
        assert!(manager.subscribers("ETH-PERPETUAL").contains(&1));

        assert_eq!(
            manager.remove(1, "BTC-PERPETUAL"),
            UnsubscribeOutcome::RemainingSubscribers
        );
        assert_eq!(
            manager.remove(1, "ETH-PERPETUAL"),
            UnsubscribeOutcome::LastSubscriber
        );
        assert_eq!(manager.subscribers("BTC-PERPETUAL"), vec![2]);
    }

    #[test]
    fn deregistered_consumer_cannot_resubscribe() {
        let manager = manager_with(&[1]);
        let _ = manager.deregister(1);
        assert_eq!(manager.add(1, "BTC-PERPETUAL"), Err(UnknownConsumer(1)));
    }

    #[test]
    fn stats() {
        let manager = manager_with(&[1, 2, 3]);
        manager.add(1, "BTC-PERPETUAL").unwrap();
        manager.add(2, "BTC-PERPETUAL").unwrap();
        manager.add(2, "ETH-PERPETUAL").unwrap();

        let stats = manager.stats();
        assert_eq!(stats.consumer_count, 3);
        assert_eq!(stats.instrument_count, 2);
        assert_eq!(stats.membership_count, 3);
    }

    #[test]
    fn thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let manager = Arc::new(SubscriptionManager::new());
        let mut handles = vec![];

        for i in 0..10 {
            let manager = Arc::clone(&manager);
            handles.push(thread::spawn(move || {
                manager.register(i);
                for j in 0..100 {
                    let instrument = format!("INST-{j}");
                    manager.add(i, &instrument).unwrap();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = manager.stats();
        assert_eq!(stats.consumer_count, 10);
        assert_eq!(stats.instrument_count, 100);
        assert_eq!(stats.membership_count, 1000);
    }
}
