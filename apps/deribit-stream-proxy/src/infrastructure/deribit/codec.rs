//! JSON-RPC Codec
//!
//! Classifies inbound frames and serializes outbound requests.
//!
//! An inbound frame is one of:
//!
//! - a **response**: carries a non-null `id`, plus `result` or `error`
//! - a **subscription push**: `method == "subscription"`
//! - a **heartbeat**: `method == "heartbeat"`
//!
//! Anything else is a [`CodecError`]; the dispatcher logs, counts and
//! discards it.

use serde_json::{Map, Value};

use super::messages::{BookData, HeartbeatParams, RpcError, RpcRequest, SubscriptionParams};
use crate::domain::streaming::OrderBookSnapshot;

/// Codec errors (malformed or unrecognized frames).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown push method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Response to a correlated request.
    Response {
        /// Correlation id.
        id: u64,
        /// `result` or `error` member.
        outcome: Result<Value, RpcError>,
    },
    /// Channel notification.
    Subscription {
        /// Channel name.
        channel: String,
        /// Channel payload.
        data: Value,
    },
    /// Venue heartbeat.
    Heartbeat {
        /// `heartbeat` or `test_request`.
        kind: String,
    },
}

/// JSON codec for the Deribit WebSocket API.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Classify one inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object or matches none of
    /// the known frame shapes.
    pub fn decode(&self, text: &str) -> Result<InboundFrame, CodecError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut object) = value else {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}",
                preview(text)
            )));
        };

        if let Some(id) = object.get("id").filter(|id| !id.is_null()) {
            let id = id.as_u64().ok_or_else(|| {
                CodecError::InvalidFormat(format!("response id is not an unsigned integer: {id}"))
            })?;
            return Ok(InboundFrame::Response {
                id,
                outcome: Self::response_outcome(&mut object),
            });
        }

        let method = object
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let params = object.remove("params").unwrap_or(Value::Null);

        match method.as_deref() {
            Some("subscription") => {
                let params: SubscriptionParams = serde_json::from_value(params)?;
                Ok(InboundFrame::Subscription {
                    channel: params.channel,
                    data: params.data,
                })
            }
            Some("heartbeat") => {
                let params: HeartbeatParams = serde_json::from_value(params)?;
                Ok(InboundFrame::Heartbeat { kind: params.kind })
            }
            Some(other) => Err(CodecError::UnknownMethod(other.to_string())),
            None => Err(CodecError::InvalidFormat(format!(
                "frame has neither id nor method: {}",
                preview(text)
            ))),
        }
    }

    /// A response always resolves its request, even when the error member
    /// is malformed or both members are absent.
    fn response_outcome(object: &mut Map<String, Value>) -> Result<Value, RpcError> {
        if let Some(error) = object.remove("error").filter(|e| !e.is_null()) {
            return Err(serde_json::from_value::<RpcError>(error.clone())
                .unwrap_or_else(|_| RpcError::malformed(error)));
        }
        object
            .remove("result")
            .ok_or_else(RpcError::empty_response)
    }

    /// Decode the payload of a `book.*` notification.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a grouped book.
    pub fn decode_book(&self, data: Value) -> Result<OrderBookSnapshot, CodecError> {
        let data: BookData = serde_json::from_value(data)?;
        Ok(data.into())
    }

    /// Serialize a request envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode_request(&self, id: u64, method: &str, params: &Value) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&RpcRequest::new(id, method, params))?)
    }
}

fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(50)
        .map_or(text.len(), |(index, _)| index);
    &text[..end]
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    fn codec() -> JsonCodec {
        JsonCodec::new()
    }

    #[test]
    fn decode_success_response() {
        let frame = codec()
            .decode(r#"{"jsonrpc":"2.0","id":3,"result":["book.BTC-PERPETUAL.none.10.100ms"]}"#)
            .unwrap();
        assert_eq!(
            frame,
            InboundFrame::Response {
                id: 3,
                outcome: Ok(json!(["book.BTC-PERPETUAL.none.10.100ms"])),
            }
        );
    }

    #[test]
    fn decode_error_response() {
        let frame = codec()
            .decode(r#"{"jsonrpc":"2.0","id":4,"error":{"code":13004,"message":"invalid_credentials"}}"#)
            .unwrap();
        let InboundFrame::Response { id, outcome } = frame else {
            panic!("expected response");
        };
        assert_eq!(id, 4);
        let err = outcome.unwrap_err();
        assert_eq!(err.code, 13004);
        assert_eq!(err.message, "invalid_credentials");
    }

    #[test]
    fn decode_response_without_members_still_resolves() {
        let frame = codec().decode(r#"{"jsonrpc":"2.0","id":5}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Response {
                id: 5,
                outcome: Err(RpcError::empty_response()),
            }
        );
    }

    #[test]
    fn decode_malformed_error_object() {
        let frame = codec().decode(r#"{"id":6,"error":"boom"}"#).unwrap();
        let InboundFrame::Response { outcome, .. } = frame else {
            panic!("expected response");
        };
        let err = outcome.unwrap_err();
        assert_eq!(err.code, RpcError::MALFORMED_RESPONSE);
        assert_eq!(err.data, Some(json!("boom")));
    }

    #[test]
    fn decode_subscription_push() {
        let frame = codec()
            .decode(
                r#"{"jsonrpc":"2.0","method":"subscription","params":{"channel":"book.BTC-PERPETUAL.none.10.100ms","data":{"instrument_name":"BTC-PERPETUAL","bids":[[100.0,1.0]],"asks":[[101.0,2.0]],"timestamp":1}}}"#,
            )
            .unwrap();
        let InboundFrame::Subscription { channel, data } = frame else {
            panic!("expected subscription");
        };
        assert_eq!(channel, "book.BTC-PERPETUAL.none.10.100ms");

        let snapshot = codec().decode_book(data).unwrap();
        assert_eq!(snapshot.instrument, "BTC-PERPETUAL");
        assert_eq!(snapshot.timestamp, 1);
    }

    #[test]
    fn decode_heartbeat() {
        let frame = codec()
            .decode(r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"test_request"}}"#)
            .unwrap();
        assert_eq!(
            frame,
            InboundFrame::Heartbeat {
                kind: "test_request".to_string()
            }
        );
    }

    #[test]
    fn null_id_is_not_a_response() {
        let frame = codec()
            .decode(r#"{"id":null,"method":"heartbeat","params":{"type":"heartbeat"}}"#)
            .unwrap();
        assert!(matches!(frame, InboundFrame::Heartbeat { .. }));
    }

    #[test_case("not json" ; "not json")]
    #[test_case("[1,2,3]" ; "array")]
    #[test_case(r#"{"jsonrpc":"2.0"}"# ; "no id or method")]
    #[test_case(r#"{"method":"announcements","params":{}}"# ; "unknown method")]
    #[test_case(r#"{"id":"abc","result":1}"# ; "string id")]
    #[test_case(r#"{"method":"subscription","params":{"data":{}}}"# ; "subscription without channel")]
    fn decode_rejects(text: &str) {
        assert!(codec().decode(text).is_err());
    }

    #[test]
    fn decode_book_rejects_raw_changes() {
        let raw = json!({
            "instrument_name": "BTC-PERPETUAL",
            "bids": [["new", 100.0, 1.0]],
            "asks": [],
            "timestamp": 1
        });
        assert!(codec().decode_book(raw).is_err());
    }

    #[test]
    fn encode_request_envelope() {
        let text = codec()
            .encode_request(1, "public/test", &json!({}))
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 1);
        assert_eq!(value["method"], "public/test");
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let long = "é".repeat(80);
        assert_eq!(preview(&long).chars().count(), 50);
        assert_eq!(preview("short"), "short");
    }
}
