//! Subscription Fan-out Integration Tests
//!
//! Exercises consumer subscribe/unsubscribe/disconnect against a recording
//! upstream, checking that the venue only sees the 0↔1 transitions and that
//! snapshots reach exactly the current subscribers.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use rust_decimal::Decimal;
use tokio::sync::broadcast::error::TryRecvError;

use deribit_stream_proxy::{
    ConsumerId, ConsumerMessage, ConsumerReceiver, FanOut, FanOutConfig, FanOutError,
    OrderBookSnapshot, PriceLevel, SubscribeOutcome, UnsubscribeOutcome, UpstreamError,
    UpstreamPort,
};

/// Upstream call as seen by the venue.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Subscribe(String),
    Unsubscribe(String),
}

/// Upstream that records every call and rejects a configurable set of
/// instruments.
#[derive(Debug, Default)]
struct RecordingUpstream {
    calls: Mutex<Vec<Call>>,
    unknown: HashSet<String>,
    /// Subscribes accepted before every further one fails.
    subscribe_budget: Option<AtomicUsize>,
}

impl RecordingUpstream {
    fn rejecting(instruments: &[&str]) -> Self {
        Self {
            unknown: instruments.iter().map(|i| (*i).to_string()).collect(),
            ..Self::default()
        }
    }

    fn accepting_first(subscribes: usize) -> Self {
        Self {
            subscribe_budget: Some(AtomicUsize::new(subscribes)),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }
}

#[async_trait]
impl UpstreamPort for RecordingUpstream {
    async fn subscribe_book(&self, instrument: &str) -> Result<(), UpstreamError> {
        self.calls.lock().push(Call::Subscribe(instrument.to_string()));
        // Yield so concurrent callers get a chance to interleave.
        tokio::task::yield_now().await;
        if self.unknown.contains(instrument) {
            return Err(UpstreamError::Rejected(format!("unknown instrument {instrument}")));
        }
        if let Some(budget) = &self.subscribe_budget
            && budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        {
            return Err(UpstreamError::Unavailable("session not ready".to_string()));
        }
        Ok(())
    }

    async fn unsubscribe_book(&self, instrument: &str) -> Result<(), UpstreamError> {
        self.calls.lock().push(Call::Unsubscribe(instrument.to_string()));
        tokio::task::yield_now().await;
        Ok(())
    }
}

fn setup(upstream: RecordingUpstream) -> (Arc<FanOut>, Arc<RecordingUpstream>) {
    let upstream = Arc::new(upstream);
    let fanout = Arc::new(FanOut::new(
        FanOutConfig::default(),
        Arc::clone(&upstream) as Arc<dyn UpstreamPort>,
    ));
    (fanout, upstream)
}

fn snapshot(instrument: &str, bid: i64, timestamp: i64) -> OrderBookSnapshot {
    OrderBookSnapshot::new(
        instrument,
        vec![PriceLevel::new(Decimal::new(bid, 0), Decimal::ONE)],
        vec![PriceLevel::new(Decimal::new(bid + 1, 0), Decimal::ONE)],
        timestamp,
    )
}

async fn next_snapshot(rx: &mut ConsumerReceiver) -> Arc<OrderBookSnapshot> {
    rx.recv()
        .await
        .unwrap()
        .into_snapshot()
        .expect("expected a snapshot")
}

fn sub(instrument: &str) -> Call {
    Call::Subscribe(instrument.to_string())
}

fn unsub(instrument: &str) -> Call {
    Call::Unsubscribe(instrument.to_string())
}

#[tokio::test]
async fn second_subscriber_gets_cached_snapshot_without_upstream_call() {
    let (fanout, upstream) = setup(RecordingUpstream::default());
    let (a, mut rx_a) = fanout.on_connect();
    let (b, mut rx_b) = fanout.on_connect();

    assert_eq!(
        fanout.subscribe(a, "BTC-PERPETUAL").await.unwrap(),
        SubscribeOutcome::FirstSubscriber
    );
    assert_eq!(upstream.calls(), vec![sub("BTC-PERPETUAL")]);

    assert_eq!(fanout.update(snapshot("BTC-PERPETUAL", 50_000, 1)), 1);
    assert_eq!(next_snapshot(&mut rx_a).await.timestamp, 1);
    assert_eq!(fanout.cached("BTC-PERPETUAL").unwrap().timestamp, 1);

    assert_eq!(
        fanout.subscribe(b, "BTC-PERPETUAL").await.unwrap(),
        SubscribeOutcome::AdditionalSubscriber
    );
    let cached = next_snapshot(&mut rx_b).await;
    assert_eq!(cached.timestamp, 1);
    assert_eq!(cached.best_bid().unwrap().price(), Decimal::new(50_000, 0));

    assert_eq!(upstream.count(&sub("BTC-PERPETUAL")), 1);

    // Both receive the next update.
    assert_eq!(fanout.update(snapshot("BTC-PERPETUAL", 50_001, 2)), 2);
    assert_eq!(next_snapshot(&mut rx_a).await.timestamp, 2);
    assert_eq!(next_snapshot(&mut rx_b).await.timestamp, 2);
}

#[tokio::test]
async fn last_unsubscribe_releases_upstream_once() {
    let (fanout, upstream) = setup(RecordingUpstream::default());
    let (a, _rx_a) = fanout.on_connect();
    let (b, _rx_b) = fanout.on_connect();

    fanout.subscribe(a, "ETH-PERPETUAL").await.unwrap();
    fanout.subscribe(b, "ETH-PERPETUAL").await.unwrap();
    fanout.update(snapshot("ETH-PERPETUAL", 3_000, 1));

    assert_eq!(
        fanout.unsubscribe(a, "ETH-PERPETUAL").await.unwrap(),
        UnsubscribeOutcome::RemainingSubscribers
    );
    assert_eq!(upstream.count(&unsub("ETH-PERPETUAL")), 0);
    assert!(fanout.cached("ETH-PERPETUAL").is_some());

    assert_eq!(
        fanout.unsubscribe(b, "ETH-PERPETUAL").await.unwrap(),
        UnsubscribeOutcome::LastSubscriber
    );
    assert_eq!(
        upstream.calls(),
        vec![sub("ETH-PERPETUAL"), unsub("ETH-PERPETUAL")]
    );
    assert!(fanout.cached("ETH-PERPETUAL").is_none());

    // Repeating the unsubscribe is a no-op.
    assert_eq!(
        fanout.unsubscribe(b, "ETH-PERPETUAL").await.unwrap(),
        UnsubscribeOutcome::NotSubscribed
    );
    assert_eq!(upstream.count(&unsub("ETH-PERPETUAL")), 1);
}

#[tokio::test]
async fn broadcast_reaches_only_current_subscribers() {
    let (fanout, _upstream) = setup(RecordingUpstream::default());
    let (a, mut rx_a) = fanout.on_connect();
    let (b, mut rx_b) = fanout.on_connect();
    let (_c, mut rx_c) = fanout.on_connect();

    fanout.subscribe(a, "BTC-PERPETUAL").await.unwrap();
    fanout.subscribe(b, "ETH-PERPETUAL").await.unwrap();

    assert_eq!(fanout.update(snapshot("BTC-PERPETUAL", 50_000, 1)), 1);

    assert_eq!(next_snapshot(&mut rx_a).await.instrument, "BTC-PERPETUAL");
    assert!(matches!(rx_b.try_recv(), Err(TryRecvError::Empty)));
    assert!(matches!(rx_c.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn rejected_subscribe_rolls_consumer_back() {
    let (fanout, upstream) = setup(RecordingUpstream::rejecting(&["NOPE-PERPETUAL"]));
    let (a, _rx_a) = fanout.on_connect();

    let err = fanout.subscribe(a, "NOPE-PERPETUAL").await.unwrap_err();
    assert!(matches!(
        err,
        FanOutError::Upstream { ref instrument, source: UpstreamError::Rejected(_) }
            if instrument == "NOPE-PERPETUAL"
    ));
    assert!(fanout.consumer_instruments(a).is_empty());
    assert!(fanout.subscribers("NOPE-PERPETUAL").is_empty());

    // The next attempt is a fresh first subscription.
    assert!(fanout.subscribe(a, "NOPE-PERPETUAL").await.is_err());
    assert_eq!(upstream.count(&sub("NOPE-PERPETUAL")), 2);
    assert_eq!(upstream.count(&unsub("NOPE-PERPETUAL")), 0);
}

#[tokio::test]
async fn disconnect_releases_every_held_instrument() {
    let (fanout, upstream) = setup(RecordingUpstream::default());
    let (a, _rx_a) = fanout.on_connect();
    let (b, _rx_b) = fanout.on_connect();

    fanout.subscribe(a, "BTC-PERPETUAL").await.unwrap();
    fanout.subscribe(a, "ETH-PERPETUAL").await.unwrap();
    fanout.subscribe(b, "ETH-PERPETUAL").await.unwrap();

    assert_eq!(fanout.remove_consumer(a).await, 1);
    assert_eq!(upstream.count(&unsub("BTC-PERPETUAL")), 1);
    assert_eq!(upstream.count(&unsub("ETH-PERPETUAL")), 0);
    assert_eq!(fanout.subscribers("ETH-PERPETUAL"), vec![b]);

    // Removing twice is harmless.
    assert_eq!(fanout.remove_consumer(a).await, 0);
    assert!(matches!(
        fanout.subscribe(a, "BTC-PERPETUAL").await,
        Err(FanOutError::UnknownConsumer(_))
    ));
    assert_eq!(fanout.stats().consumers, 1);
}

#[tokio::test]
async fn consumer_removed_mid_broadcast_is_safe() {
    let (fanout, upstream) = setup(RecordingUpstream::default());
    let mut receivers = Vec::new();
    let mut consumers = Vec::new();
    for _ in 0..8 {
        let (id, rx) = fanout.on_connect();
        fanout.subscribe(id, "BTC-PERPETUAL").await.unwrap();
        consumers.push(id);
        receivers.push(rx);
    }

    let broadcaster = tokio::spawn({
        let fanout = Arc::clone(&fanout);
        async move {
            let mut delivered = 0;
            for ts in 0..200 {
                delivered += fanout.update(snapshot("BTC-PERPETUAL", 50_000 + ts, ts));
                tokio::task::yield_now().await;
            }
            delivered
        }
    });

    for id in consumers.iter().copied().step_by(2) {
        fanout.on_disconnect(id).await;
        tokio::task::yield_now().await;
    }

    let delivered = tokio::time::timeout(Duration::from_secs(5), broadcaster)
        .await
        .unwrap()
        .unwrap();
    assert!(delivered >= 200 * 4);
    assert_eq!(fanout.subscribers("BTC-PERPETUAL").len(), 4);
    assert_eq!(upstream.count(&unsub("BTC-PERPETUAL")), 0);
}

#[tokio::test]
async fn dropped_receiver_counts_as_disconnect() {
    let (fanout, upstream) = setup(RecordingUpstream::default());
    let (a, rx_a) = fanout.on_connect();
    fanout.subscribe(a, "BTC-PERPETUAL").await.unwrap();
    drop(rx_a);

    assert_eq!(fanout.update(snapshot("BTC-PERPETUAL", 50_000, 1)), 0);

    // Removal runs in the background.
    for _ in 0..50 {
        if upstream.count(&unsub("BTC-PERPETUAL")) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(upstream.count(&unsub("BTC-PERPETUAL")), 1);
    assert_eq!(fanout.stats().consumers_dropped, 1);
    assert_eq!(fanout.stats().consumers, 0);
}

#[tokio::test]
async fn slow_consumer_loses_oldest_snapshots_only() {
    let upstream = Arc::new(RecordingUpstream::default());
    let fanout = Arc::new(FanOut::new(
        FanOutConfig { consumer_buffer: 4 },
        Arc::clone(&upstream) as Arc<dyn UpstreamPort>,
    ));
    let (slow, mut rx) = fanout.on_connect();
    fanout.subscribe(slow, "BTC-PERPETUAL").await.unwrap();

    for ts in 0..10 {
        fanout.update(snapshot("BTC-PERPETUAL", 50_000, ts));
    }

    assert!(matches!(
        rx.recv().await,
        Err(tokio::sync::broadcast::error::RecvError::Lagged(6))
    ));
    assert_eq!(next_snapshot(&mut rx).await.timestamp, 6);
    assert_eq!(fanout.stats().consumers, 1);
    assert_eq!(fanout.subscribers("BTC-PERPETUAL"), vec![slow]);
}

#[tokio::test]
async fn failed_resubscribe_lets_next_subscriber_restart_upstream() {
    let (fanout, upstream) = setup(RecordingUpstream::accepting_first(1));
    let (a, mut rx_a) = fanout.on_connect();
    let (b, _rx_b) = fanout.on_connect();

    fanout.subscribe(a, "BTC-PERPETUAL").await.unwrap();
    fanout.update(snapshot("BTC-PERPETUAL", 50_000, 1));
    next_snapshot(&mut rx_a).await;

    // New session: the venue refuses to restore the instrument.
    assert_eq!(fanout.resubscribe_all().await, 0);
    match rx_a.recv().await.unwrap() {
        ConsumerMessage::SubscriptionLost { instrument, reason } => {
            assert_eq!(instrument, "BTC-PERPETUAL");
            assert!(reason.contains("session not ready"));
        }
        other => panic!("expected SubscriptionLost, got {other:?}"),
    }
    assert!(fanout.consumer_instruments(a).is_empty());
    assert!(fanout.cached("BTC-PERPETUAL").is_none());
    assert_eq!(fanout.stats().instruments, 0);

    // B is now the first subscriber and the venue sees a fresh subscribe.
    assert!(matches!(
        fanout.subscribe(b, "BTC-PERPETUAL").await,
        Err(FanOutError::Upstream { ref instrument, .. }) if instrument == "BTC-PERPETUAL"
    ));
    assert_eq!(upstream.count(&sub("BTC-PERPETUAL")), 3);
    assert!(fanout.subscribers("BTC-PERPETUAL").is_empty());
    assert_eq!(upstream.count(&unsub("BTC-PERPETUAL")), 0);
}

#[tokio::test]
async fn resubscribe_restores_instruments_with_subscribers() {
    let (fanout, upstream) = setup(RecordingUpstream::default());
    let (a, mut rx_a) = fanout.on_connect();
    let (b, _rx_b) = fanout.on_connect();

    fanout.subscribe(a, "BTC-PERPETUAL").await.unwrap();
    fanout.subscribe(b, "ETH-PERPETUAL").await.unwrap();
    fanout.unsubscribe(b, "ETH-PERPETUAL").await.unwrap();

    assert_eq!(fanout.resubscribe_all().await, 1);
    assert_eq!(upstream.count(&sub("BTC-PERPETUAL")), 2);
    assert_eq!(upstream.count(&sub("ETH-PERPETUAL")), 1);
    assert!(matches!(rx_a.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(fanout.subscribers("BTC-PERPETUAL"), vec![a]);
}

#[tokio::test]
async fn concurrent_first_subscribers_trigger_one_upstream_call() {
    let (fanout, upstream) = setup(RecordingUpstream::default());
    let consumers: Vec<ConsumerId> = (0..16).map(|_| fanout.on_connect().0).collect();

    let handles: Vec<_> = consumers
        .iter()
        .map(|&id| {
            let fanout = Arc::clone(&fanout);
            tokio::spawn(async move { fanout.subscribe(id, "SOL-PERPETUAL").await })
        })
        .collect();
    let mut first = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() == SubscribeOutcome::FirstSubscriber {
            first += 1;
        }
    }

    assert_eq!(first, 1);
    assert_eq!(upstream.count(&sub("SOL-PERPETUAL")), 1);
    assert_eq!(fanout.subscribers("SOL-PERPETUAL").len(), 16);
}

// =============================================================================
// Property: upstream calls are exactly the 0↔1 transitions
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Subscribe(usize, usize),
    Unsubscribe(usize, usize),
    Disconnect(usize),
}

const INSTRUMENTS: [&str; 3] = ["BTC-PERPETUAL", "ETH-PERPETUAL", "SOL-PERPETUAL"];
const CONSUMERS: usize = 4;

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..CONSUMERS, 0..INSTRUMENTS.len()).prop_map(|(c, i)| Op::Subscribe(c, i)),
        3 => (0..CONSUMERS, 0..INSTRUMENTS.len()).prop_map(|(c, i)| Op::Unsubscribe(c, i)),
        1 => (0..CONSUMERS).prop_map(Op::Disconnect),
    ]
}

type CallLog = HashMap<&'static str, Vec<Call>>;

fn instrument_of(call: &Call) -> &str {
    match call {
        Call::Subscribe(i) | Call::Unsubscribe(i) => i,
    }
}

/// Replay `ops` while tracking the expected subscriber sets alongside.
/// Returns the expected and the recorded upstream calls, per instrument.
async fn replay(ops: Vec<Op>) -> (CallLog, CallLog) {
    let (fanout, upstream) = setup(RecordingUpstream::default());
    let mut ids: Vec<Option<ConsumerId>> = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..CONSUMERS {
        let (id, rx) = fanout.on_connect();
        ids.push(Some(id));
        receivers.push(rx);
    }

    let mut held: HashMap<&'static str, HashSet<usize>> = HashMap::new();
    let mut expected = CallLog::new();

    for op in ops {
        match op {
            Op::Subscribe(c, i) => {
                let Some(id) = ids[c] else { continue };
                let instrument = INSTRUMENTS[i];
                let set = held.entry(instrument).or_default();
                if set.is_empty() {
                    expected.entry(instrument).or_default().push(sub(instrument));
                }
                set.insert(c);
                fanout.subscribe(id, instrument).await.unwrap();
            }
            Op::Unsubscribe(c, i) => {
                let Some(id) = ids[c] else { continue };
                let instrument = INSTRUMENTS[i];
                let set = held.entry(instrument).or_default();
                if set.remove(&c) && set.is_empty() {
                    expected.entry(instrument).or_default().push(unsub(instrument));
                }
                fanout.unsubscribe(id, instrument).await.unwrap();
            }
            Op::Disconnect(c) => {
                let Some(id) = ids[c].take() else { continue };
                for (&instrument, set) in &mut held {
                    if set.remove(&c) && set.is_empty() {
                        expected.entry(instrument).or_default().push(unsub(instrument));
                    }
                }
                fanout.on_disconnect(id).await;
            }
        }
    }

    let mut recorded = CallLog::new();
    for call in upstream.calls() {
        let instrument = INSTRUMENTS
            .into_iter()
            .find(|i| *i == instrument_of(&call))
            .unwrap();
        recorded.entry(instrument).or_default().push(call);
    }
    (expected, recorded)
}

proptest! {
    #[test]
    fn upstream_sees_only_zero_one_transitions(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (expected, recorded) = runtime.block_on(replay(ops));
        prop_assert_eq!(expected, recorded);
    }
}
