//! Order Book Streaming Types
//!
//! Core domain types for streamed market data: order-book snapshots and the
//! events the upstream session produces. These types are codec-agnostic and
//! are what downstream consumers receive verbatim.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// An instrument name as the venue spells it (e.g. `BTC-PERPETUAL`).
pub type Instrument = String;

/// One price level of an order book side, serialized as `[price, amount]`.
///
/// Both values are JSON numbers carried digit for digit: `[100, 1]` is
/// re-emitted as `[100, 1]`, never as `[100.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel(
    #[serde(with = "rust_decimal::serde::arbitrary_precision")] pub Decimal,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")] pub Decimal,
);

impl PriceLevel {
    /// Create a new price level.
    #[must_use]
    pub const fn new(price: Decimal, amount: Decimal) -> Self {
        Self(price, amount)
    }

    /// Level price.
    #[must_use]
    pub const fn price(&self) -> Decimal {
        self.0
    }

    /// Amount resting at this price.
    #[must_use]
    pub const fn amount(&self) -> Decimal {
        self.1
    }
}

/// Latest known order-book state for one instrument.
///
/// Each update replaces the previous snapshot entirely; nothing is merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    /// Instrument name.
    pub instrument: Instrument,
    /// Bid levels, best first.
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best first.
    pub asks: Vec<PriceLevel>,
    /// Venue timestamp in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl OrderBookSnapshot {
    /// Create a new snapshot.
    #[must_use]
    pub fn new(
        instrument: impl Into<Instrument>,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        timestamp: i64,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            bids,
            asks,
            timestamp,
        }
    }

    /// Best bid, if any.
    #[must_use]
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    /// Best ask, if any.
    #[must_use]
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    /// Venue timestamp as a UTC datetime.
    #[must_use]
    pub fn venue_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

// =============================================================================
// Stream Events
// =============================================================================

/// Events produced by the upstream session for the fan-out side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Session authenticated and ready for requests.
    Connected,
    /// Session closed; every pending request has been failed.
    Closed {
        /// Why the session ended.
        reason: String,
    },
    /// A new order-book snapshot was pushed by the venue.
    OrderBook(OrderBookSnapshot),
}

// =============================================================================
// Tests
// =============================================================================
