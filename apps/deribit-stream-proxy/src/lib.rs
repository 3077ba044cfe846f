#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Deribit Stream Proxy - Upstream Session Multiplexer
//!
//! Holds one authenticated JSON-RPC session to Deribit's WebSocket API and
//! shares it among many local consumers: order-book snapshots are fanned
//! out, correlated requests (trading, account queries) are multiplexed over
//! the same connection.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: order-book types and the consumer/instrument membership table
//!   - `streaming`: snapshots and session events
//!   - `subscription`: membership bookkeeping
//!
//! - **Application**: use cases and port definitions
//!   - `ports`: the upstream subscription interface
//!   - `services`: fan-out and upstream reference counting
//!
//! - **Infrastructure**: adapters and external integrations
//!   - `deribit`: session link, dispatcher, supervisor, trading commands
//!   - `downstream`: consumer WebSocket endpoint
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                 ┌──────────────┐  events  ┌────────────┐  snapshots  ┌─────────┐
//! Deribit WS ◄───►│ UpstreamLink │─────────►│ Supervisor │────────────►│ FanOut  │──► Consumer 1
//!                 └──────────────┘          └────────────┘             │         │──► Consumer 2
//!                        ▲                                             └─────────┘──► Consumer N
//!                        └─────── subscribe / unsubscribe (0↔1 transitions) ──┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{Instrument, OrderBookSnapshot, PriceLevel, StreamEvent};
pub use domain::subscription::{
    ConsumerId, SubscribeOutcome, SubscriptionManager, SubscriptionStats, UnsubscribeOutcome,
};

// Application services
pub use application::ports::{UpstreamError, UpstreamPort};
pub use application::services::{
    ConsumerMessage, ConsumerReceiver, FanOut, FanOutConfig, FanOutError, FanOutStats,
    SharedFanOut,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, Credentials, Environment, FanOutSettings, ProxyConfig, ReconnectSettings,
    ServerSettings, UpstreamSettings,
};

// Upstream session
pub use infrastructure::deribit::{
    LinkConfig, LinkError, LinkState, RequestError, SessionSupervisor, TradingApi, UpstreamLink,
};

// Servers
pub use infrastructure::downstream::{ConsumerServer, ConsumerServerError};
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
