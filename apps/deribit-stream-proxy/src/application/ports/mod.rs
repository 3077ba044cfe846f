//! Port Interfaces
//!
//! Defines the interfaces (ports) the application services depend on,
//! following the Hexagonal Architecture pattern. Infrastructure adapters
//! implement them; tests substitute mocks.
//!
//! ## Driven Ports (Outbound)
//!
//! - `UpstreamPort`: order-book channel subscription on the venue session

use async_trait::async_trait;

/// Errors returned by the upstream port.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// The venue answered the request with an error.
    #[error("venue rejected request: {0}")]
    Rejected(String),

    /// The session could not carry the request (not ready, closed, timed out).
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

/// Order-book subscription on the single upstream session.
///
/// Each call is one correlated request; implementations must not batch or
/// deduplicate, the caller already guarantees one call per transition.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamPort: Send + Sync {
    /// Subscribe the session to an instrument's order-book channel.
    async fn subscribe_book(&self, instrument: &str) -> Result<(), UpstreamError>;

    /// Unsubscribe the session from an instrument's order-book channel.
    async fn unsubscribe_book(&self, instrument: &str) -> Result<(), UpstreamError>;
}
