//! Deribit JSON-RPC Message Types
//!
//! Wire types for Deribit's WebSocket API v2.
//!
//! # Envelopes
//!
//! - Request: `{"jsonrpc":"2.0","id":7,"method":"public/auth","params":{...}}`
//! - Response: `{"jsonrpc":"2.0","id":7,"result":{...}}` or
//!   `{"jsonrpc":"2.0","id":7,"error":{"code":13004,"message":"invalid_credentials"}}`
//! - Push: `{"jsonrpc":"2.0","method":"subscription","params":{"channel":"book.BTC-PERPETUAL.none.10.100ms","data":{...}}}`
//! - Heartbeat: `{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"test_request"}}`
//!
//! # References
//!
//! - [JSON-RPC over WebSocket](https://docs.deribit.com/#json-rpc)
//! - [Book channel](https://docs.deribit.com/#book-instrument_name-group-depth-interval)

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::streaming::{Instrument, OrderBookSnapshot, PriceLevel};

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

// =============================================================================
// Requests
// =============================================================================

/// Outbound JSON-RPC request envelope.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Correlation id.
    pub id: u64,
    /// Method name, e.g. `public/subscribe`.
    pub method: &'a str,
    /// Method parameters.
    pub params: &'a Value,
}

impl<'a> RpcRequest<'a> {
    /// Create a request envelope.
    #[must_use]
    pub const fn new(id: u64, method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Error object of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    /// Venue error code.
    pub code: i64,
    /// Venue error message.
    pub message: String,
    /// Optional extra detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Code used for responses that carry neither `result` nor `error`, or an
    /// `error` object that does not parse.
    pub const MALFORMED_RESPONSE: i64 = -32_600;

    /// Create an error with code and message.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Error for a response without `result` or `error`.
    #[must_use]
    pub fn empty_response() -> Self {
        Self::new(
            Self::MALFORMED_RESPONSE,
            "response carried neither result nor error",
        )
    }

    /// Error for an `error` member that is not a valid error object.
    #[must_use]
    pub fn malformed(raw: Value) -> Self {
        Self {
            code: Self::MALFORMED_RESPONSE,
            message: "malformed error object".to_string(),
            data: Some(raw),
        }
    }
}

/// Result of `public/auth`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResult {
    /// Bearer token for private methods.
    pub access_token: String,
    /// Token used to renew the session.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Token lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Granted scope.
    #[serde(default)]
    pub scope: Option<String>,
    /// Token type, normally `bearer`.
    #[serde(default)]
    pub token_type: Option<String>,
}

// =============================================================================
// Pushes
// =============================================================================

/// Parameters of a `subscription` push.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionParams {
    /// Channel name.
    pub channel: String,
    /// Channel payload.
    #[serde(default)]
    pub data: Value,
}

/// Parameters of a `heartbeat` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatParams {
    /// `heartbeat` or `test_request`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// Payload of a grouped `book.*` notification.
#[derive(Debug, Clone, Deserialize)]
pub struct BookData {
    /// Instrument the book belongs to.
    pub instrument_name: Instrument,
    /// Bid levels, best first.
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best first.
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
    /// Venue timestamp in milliseconds.
    pub timestamp: i64,
    /// Venue sequence number.
    #[serde(default)]
    pub change_id: Option<u64>,
}

impl From<BookData> for OrderBookSnapshot {
    fn from(data: BookData) -> Self {
        Self::new(data.instrument_name, data.bids, data.asks, data.timestamp)
    }
}

// =============================================================================
// Channels
// =============================================================================

/// Grouped order-book channel parameters.
///
/// Channels are named `book.{instrument}.none.{depth}.{interval}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookChannel {
    /// Number of levels per side.
    pub depth: u32,
    /// Update interval, e.g. `100ms`.
    pub interval: String,
}

impl Default for BookChannel {
    fn default() -> Self {
        Self {
            depth: 10,
            interval: "100ms".to_string(),
        }
    }
}

impl BookChannel {
    /// Create channel parameters.
    #[must_use]
    pub fn new(depth: u32, interval: impl Into<String>) -> Self {
        Self {
            depth,
            interval: interval.into(),
        }
    }

    /// Channel name for an instrument.
    #[must_use]
    pub fn name(&self, instrument: &str) -> String {
        format!("book.{instrument}.none.{}.{}", self.depth, self.interval)
    }

    /// Extract the instrument from any `book.*` channel name.
    ///
    /// Instrument names never contain dots, so the second segment is the
    /// instrument regardless of grouping, depth or interval.
    #[must_use]
    pub fn parse(channel: &str) -> Option<&str> {
        let mut segments = channel.split('.');
        match (segments.next(), segments.next()) {
            (Some("book"), Some(instrument)) if !instrument.is_empty() => Some(instrument),
            _ => None,
        }
    }
}
