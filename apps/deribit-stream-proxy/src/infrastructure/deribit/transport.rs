//! Frame Transport
//!
//! The link talks to the venue through three small traits so the same
//! session code runs over a real WebSocket or an in-memory pipe:
//!
//! - [`Connector`]: opens a connection and returns its two halves
//! - [`FrameSink`]: writes text frames, pings, closes
//! - [`FrameSource`]: yields inbound text frames and pongs
//!
//! [`WsConnector`] is the `tokio-tungstenite` implementation.
//! [`MemoryConnector`] plays the venue side over channels; integration tests
//! and local development use it in place of a live venue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

// =============================================================================
// Traits
// =============================================================================

/// Inbound frame as seen by the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Reply to a transport ping.
    Pong,
}

/// Transport-level failures. Always fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading a frame failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// The peer closed the connection.
    #[error("connection closed: {0}")]
    Closed(String),
}

/// Writing half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Write a transport-level ping.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Reading half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next inbound frame; `None` once the connection is gone.
    async fn receive(&mut self) -> Option<Result<TransportFrame, TransportError>>;
}

/// Both halves of an established connection.
pub type TransportPair = (Box<dyn FrameSink>, Box<dyn FrameSource>);

/// Opens connections to the venue.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection to `url`.
    async fn connect(&self, url: &str) -> Result<TransportPair, TransportError>;
}

// =============================================================================
// WebSocket Transport
// =============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `tokio-tungstenite` connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<TransportPair, TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (write, read) = stream.split();

        tracing::info!(url, "WebSocket connected");
        Ok((Box::new(WsSink { inner: write }), Box::new(WsSource { inner: read })))
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.inner
            .send(Message::Ping(vec![].into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn receive(&mut self) -> Option<Result<TransportFrame, TransportError>> {
        loop {
            let frame = match self.inner.next().await? {
                Ok(Message::Text(text)) => TransportFrame::Text(text.as_str().to_owned()),
                // Deribit only sends text; a binary frame is decoded as text
                // and left to the codec to reject.
                Ok(Message::Binary(bytes)) => {
                    TransportFrame::Text(String::from_utf8_lossy(&bytes).into_owned())
                }
                Ok(Message::Pong(_)) => TransportFrame::Pong,
                // Pongs are queued by tungstenite and flushed with the next write.
                Ok(Message::Ping(_) | Message::Frame(_)) => continue,
                Ok(Message::Close(frame)) => {
                    let reason = frame.map_or_else(
                        || "close frame".to_string(),
                        |f| format!("{} {}", f.code, f.reason.as_str()),
                    );
                    return Some(Err(TransportError::Closed(reason)));
                }
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            };
            return Some(Ok(frame));
        }
    }
}

// =============================================================================
// In-Memory Transport
// =============================================================================

/// Frame written by the link, as seen by a [`MemoryVenue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryFrame {
    /// Text frame.
    Text(String),
    /// Transport ping.
    Ping,
    /// Close request.
    Close,
}

/// Channel-backed connector. Every successful `connect` hands a
/// [`MemoryVenue`] to the paired [`MemoryListener`].
#[derive(Debug)]
pub struct MemoryConnector {
    venues: mpsc::UnboundedSender<MemoryVenue>,
    refuse: AtomicBool,
    attempts: AtomicU64,
}

/// Accepts the venue side of connections opened through a [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryListener {
    venues: mpsc::UnboundedReceiver<MemoryVenue>,
}

impl MemoryConnector {
    /// Create a connector and its listener.
    #[must_use]
    pub fn new() -> (Arc<Self>, MemoryListener) {
        let (venues, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            venues,
            refuse: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
        });
        (connector, MemoryListener { venues: rx })
    }

    /// Refuse (or accept again) subsequent connection attempts.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connection attempts so far, refused ones included.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<TransportPair, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("{url}: connection refused")));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let venue = MemoryVenue {
            outbound: outbound_rx,
            inbound: Some(inbound_tx),
            pings: 0,
        };
        self.venues
            .send(venue)
            .map_err(|_| TransportError::Connect(format!("{url}: listener gone")))?;

        Ok((
            Box::new(MemorySink {
                outbound: outbound_tx,
                closed: false,
            }),
            Box::new(MemorySource {
                inbound: inbound_rx,
            }),
        ))
    }
}

impl MemoryListener {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<MemoryVenue> {
        self.venues.recv().await
    }
}

struct MemorySink {
    outbound: mpsc::UnboundedSender<MemoryFrame>,
    closed: bool,
}

impl MemorySink {
    fn write(&self, frame: MemoryFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Send("connection closed".to_string()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Send("venue went away".to_string()))
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.write(MemoryFrame::Text(text))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.write(MemoryFrame::Ping)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let result = self.write(MemoryFrame::Close);
        self.closed = true;
        result
    }
}

struct MemorySource {
    inbound: mpsc::UnboundedReceiver<Result<TransportFrame, TransportError>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn receive(&mut self) -> Option<Result<TransportFrame, TransportError>> {
        self.inbound.recv().await
    }
}

/// Venue side of one in-memory connection.
#[derive(Debug)]
pub struct MemoryVenue {
    outbound: mpsc::UnboundedReceiver<MemoryFrame>,
    inbound: Option<mpsc::UnboundedSender<Result<TransportFrame, TransportError>>>,
    pings: u64,
}

impl MemoryVenue {
    /// Next text frame written by the link. Pings are counted and skipped.
    /// Returns `None` once the link closed or dropped its writer.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.outbound.recv().await? {
                MemoryFrame::Text(text) => return Some(text),
                MemoryFrame::Ping => self.pings += 1,
                MemoryFrame::Close => return None,
            }
        }
    }

    /// Next request written by the link, parsed as JSON.
    pub async fn recv_request(&mut self) -> Option<Value> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text).ok()
    }

    /// Pings received so far.
    #[must_use]
    pub const fn pings(&self) -> u64 {
        self.pings
    }

    /// Push a raw text frame to the link.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.push(Ok(TransportFrame::Text(text.into())))
    }

    /// Push a JSON frame to the link.
    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Answer request `id` with a result.
    pub fn respond(&self, id: u64, result: Value) -> bool {
        self.send_json(&json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }

    /// Answer request `id` with an error.
    pub fn respond_error(&self, id: u64, code: i64, message: &str) -> bool {
        self.send_json(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        }))
    }

    /// Push a `book.*` notification.
    pub fn push_book(&self, channel: &str, data: Value) -> bool {
        self.send_json(&json!({
            "jsonrpc": "2.0",
            "method": "subscription",
            "params": {"channel": channel, "data": data}
        }))
    }

    /// Reply to a transport ping.
    pub fn pong(&self) -> bool {
        self.push(Ok(TransportFrame::Pong))
    }

    /// Fail the connection with a transport error.
    pub fn fail(&self, reason: &str) -> bool {
        self.push(Err(TransportError::Receive(reason.to_string())))
    }

    /// Drop the connection; the link sees end-of-stream.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Stop reading from the link while keeping the inbound side open; every
    /// later write or ping by the link fails.
    pub fn stop_reading(&mut self) {
        self.outbound.close();
    }

    fn push(&self, frame: Result<TransportFrame, TransportError>) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|inbound| inbound.send(frame).is_ok())
    }
}
