//! Upstream Link
//!
//! Owns the single authenticated connection to the venue.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──transport up──▶ Authenticating ──public/auth ok──▶ Ready
//!      ▲                        │                              │                             │
//!      └──── connect failed ────┘                              └──────── auth failed ───────▶ Closed
//!                                                                   transport lost / close() ─┘
//! ```
//!
//! # Tasks
//!
//! Each connection runs four tasks, all cancelled together:
//!
//! - **pump**: reads frames into an unbounded queue; on transport end it
//!   enqueues a close marker so every earlier frame is dispatched first
//! - **dispatcher**: drains the queue (see [`Dispatcher`]) and tears the
//!   session down when it reaches the close marker
//! - **heartbeat**: pings on an interval and closes the session after a
//!   silent period
//! - **responder**: answers venue `test_request` heartbeats with
//!   `public/test`
//!
//! Teardown runs exactly once per connection: state becomes `Closed`, every
//! pending request fails, the writer closes and [`StreamEvent::Closed`] is
//! emitted. The link never reconnects on its own.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::auth::{AUTH_METHOD, AuthError, AuthState, SessionTokens, auth_params, parse_auth_result};
use super::codec::JsonCodec;
use super::correlator::{Correlator, RequestError};
use super::dispatcher::{Dispatcher, QueueItem};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
use super::messages::BookChannel;
use super::transport::{Connector, FrameSink, FrameSource, TransportError, TransportFrame};
use crate::application::ports::{UpstreamError, UpstreamPort};
use crate::domain::streaming::StreamEvent;
use crate::infrastructure::config::{Credentials, UpstreamSettings};
use crate::infrastructure::metrics::{self, FrameKind, RequestOutcome};

/// Bound on the best-effort close frame during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// State
// =============================================================================

/// Connection state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// No connection.
    #[default]
    Disconnected,
    /// Transport being established.
    Connecting,
    /// Transport up, `public/auth` in flight.
    Authenticating,
    /// Authenticated; requests are accepted.
    Ready,
    /// Session torn down.
    Closed,
}

impl LinkState {
    /// State name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Closed => "closed",
        }
    }

    /// Authentication state implied by this link state.
    #[must_use]
    pub const fn auth_state(&self) -> AuthState {
        match self {
            Self::Disconnected | Self::Connecting => AuthState::Unauthenticated,
            Self::Authenticating => AuthState::Authenticating,
            Self::Ready => AuthState::Authenticated,
            Self::Closed => AuthState::Closed,
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Bound on establishing the transport.
    pub connect_timeout: Duration,
    /// Bound on a correlated request (`None` = unbounded).
    pub request_timeout: Option<Duration>,
    /// Transport liveness.
    pub heartbeat: HeartbeatConfig,
    /// Interval for `public/set_heartbeat` (`None` = not requested).
    pub venue_heartbeat: Option<Duration>,
    /// Book channel parameters.
    pub book: BookChannel,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::from(&UpstreamSettings::default())
    }
}

impl From<&UpstreamSettings> for LinkConfig {
    fn from(settings: &UpstreamSettings) -> Self {
        Self {
            url: settings.ws_url.clone(),
            connect_timeout: settings.connect_timeout,
            request_timeout: settings.request_timeout,
            heartbeat: HeartbeatConfig::from_upstream_settings(settings),
            venue_heartbeat: settings.venue_heartbeat,
            book: BookChannel::new(settings.book_depth, settings.book_interval.clone()),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Connection-setup failures.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The transport did not come up in time.
    #[error("connect to {url} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Endpoint.
        url: String,
        /// Configured timeout.
        timeout: Duration,
    },

    /// The transport could not be established.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The handshake failed.
    #[error(transparent)]
    Authentication(#[from] AuthError),

    /// `connect` called while a connection is active or being set up.
    #[error("cannot connect while {0}")]
    InvalidState(LinkState),
}

impl LinkError {
    /// Whether the venue refused the credentials; retrying cannot help.
    #[must_use]
    pub const fn is_credential_rejection(&self) -> bool {
        matches!(
            self,
            Self::Authentication(AuthError::Rejected { .. } | AuthError::InvalidResponse(_))
        )
    }
}

// =============================================================================
// Link
// =============================================================================

type SharedWriter = Arc<AsyncMutex<Box<dyn FrameSink>>>;

struct Connection {
    generation: u64,
    cancel: CancellationToken,
    writer: SharedWriter,
}

struct LinkInner {
    config: LinkConfig,
    credentials: Credentials,
    connector: Arc<dyn Connector>,
    codec: JsonCodec,
    state: RwLock<LinkState>,
    tokens: RwLock<Option<SessionTokens>>,
    correlator: Arc<Correlator>,
    connection: Mutex<Option<Connection>>,
    generation: AtomicU64,
    events: mpsc::Sender<StreamEvent>,
}

/// Handle to the upstream session. Cheap to clone; all clones share it.
#[derive(Clone)]
pub struct UpstreamLink {
    inner: Arc<LinkInner>,
}

impl std::fmt::Debug for UpstreamLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamLink")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish_non_exhaustive()
    }
}

impl UpstreamLink {
    /// Create a disconnected link. Session events are sent to `events`.
    #[must_use]
    pub fn new(
        config: LinkConfig,
        credentials: Credentials,
        connector: Arc<dyn Connector>,
        events: mpsc::Sender<StreamEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                config,
                credentials,
                connector,
                codec: JsonCodec::new(),
                state: RwLock::new(LinkState::Disconnected),
                tokens: RwLock::new(None),
                correlator: Arc::new(Correlator::new()),
                connection: Mutex::new(None),
                generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Establish the transport and authenticate.
    ///
    /// Allowed from `Disconnected` or `Closed`. On success the link is
    /// `Ready` and [`StreamEvent::Connected`] has been emitted.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ConnectTimeout`] or [`LinkError::Transport`] if
    /// the transport fails (state returns to `Disconnected`), and
    /// [`LinkError::Authentication`] if the handshake fails (state becomes
    /// `Closed`).
    pub async fn connect(&self) -> Result<(), LinkError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.write();
            match *state {
                LinkState::Disconnected | LinkState::Closed => *state = LinkState::Connecting,
                other => return Err(LinkError::InvalidState(other)),
            }
        }
        metrics::set_session_state(LinkState::Connecting.as_str());

        let url = inner.config.url.as_str();
        let timeout = inner.config.connect_timeout;
        tracing::info!(url, "Connecting to venue");

        let (sink, source) = match tokio::time::timeout(timeout, inner.connector.connect(url)).await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                tracing::warn!(url, error = %e, "Transport connect failed");
                inner.reset_to_disconnected();
                return Err(e.into());
            }
            Err(_) => {
                tracing::warn!(url, timeout_secs = timeout.as_secs(), "Transport connect timed out");
                inner.reset_to_disconnected();
                return Err(LinkError::ConnectTimeout {
                    url: url.to_string(),
                    timeout,
                });
            }
        };

        let generation = inner.install(sink)?;
        Arc::clone(inner).spawn_tasks(generation, source);

        let tokens = match inner.authenticate().await {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!(error = %e, "Authentication failed");
                inner
                    .mark_closed(
                        generation,
                        RequestError::SessionClosed(format!("authentication failed: {e}")),
                    )
                    .await;
                return Err(e.into());
            }
        };

        if !inner.promote_to_ready(generation, tokens) {
            return Err(TransportError::Closed("session closed during authentication".to_string()).into());
        }
        tracing::info!(url, generation, "Session authenticated");

        if let Some(interval) = inner.config.venue_heartbeat {
            let params = json!({ "interval": interval.as_secs() });
            if let Err(e) = self.request("public/set_heartbeat", params).await {
                tracing::warn!(error = %e, "Failed to enable venue heartbeats");
            }
        }

        if inner.events.send(StreamEvent::Connected).await.is_err() {
            tracing::debug!("Event receiver gone");
        }
        Ok(())
    }

    /// Send a correlated request and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::NotReady`] outside `Ready`, the venue's error
    /// as [`RequestError::Upstream`], [`RequestError::Timeout`] when the
    /// configured timeout expires, and a transport or session-closed error
    /// when the session ends first.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RequestError> {
        let state = self.state();
        if state != LinkState::Ready {
            return Err(RequestError::NotReady(state));
        }
        self.inner
            .call(method, params, self.inner.config.request_timeout)
            .await
    }

    /// Close the session and fail every pending request. Idempotent.
    pub async fn close(&self) {
        let generation = self
            .inner
            .connection
            .lock()
            .as_ref()
            .map(|connection| connection.generation);

        let closed = match generation {
            Some(generation) => {
                self.inner
                    .mark_closed(
                        generation,
                        RequestError::SessionClosed("closed by owner".to_string()),
                    )
                    .await
            }
            None => false,
        };

        if !closed {
            *self.inner.state.write() = LinkState::Closed;
            metrics::set_session_state(LinkState::Closed.as_str());
        }
    }

    /// Current link state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.inner.state.read()
    }

    /// Current authentication state.
    #[must_use]
    pub fn auth_state(&self) -> AuthState {
        self.state().auth_state()
    }

    /// Whether requests are accepted.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == LinkState::Ready
    }

    /// Tokens of the current session.
    #[must_use]
    pub fn tokens(&self) -> Option<SessionTokens> {
        self.inner.tokens.read().clone()
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Number of connections established so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Book channel parameters used for subscriptions.
    #[must_use]
    pub fn book_channel(&self) -> &BookChannel {
        &self.inner.config.book
    }
}

impl LinkInner {
    fn reset_to_disconnected(&self) {
        *self.state.write() = LinkState::Disconnected;
        metrics::set_session_state(LinkState::Disconnected.as_str());
    }

    /// Register a fresh connection unless `close` raced the transport setup.
    fn install(&self, sink: Box<dyn FrameSink>) -> Result<u64, LinkError> {
        let mut state = self.state.write();
        if *state != LinkState::Connecting {
            return Err(TransportError::Closed("closed while connecting".to_string()).into());
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.connection.lock() = Some(Connection {
            generation,
            cancel: CancellationToken::new(),
            writer: Arc::new(AsyncMutex::new(sink)),
        });
        self.correlator.reopen();
        *state = LinkState::Authenticating;
        drop(state);

        metrics::set_session_state(LinkState::Authenticating.as_str());
        Ok(generation)
    }

    fn promote_to_ready(&self, generation: u64, tokens: SessionTokens) -> bool {
        let mut state = self.state.write();
        let current = self
            .connection
            .lock()
            .as_ref()
            .is_some_and(|connection| connection.generation == generation);
        if !current || *state != LinkState::Authenticating {
            return false;
        }

        *self.tokens.write() = Some(tokens);
        *state = LinkState::Ready;
        drop(state);

        metrics::set_session_state(LinkState::Ready.as_str());
        true
    }

    async fn authenticate(&self) -> Result<SessionTokens, AuthError> {
        // The handshake waits for its response without the request timeout;
        // only the transport bounds it.
        let result = self
            .call(AUTH_METHOD, auth_params(&self.credentials), None)
            .await?;
        parse_auth_result(result, Utc::now())
    }

    fn writer(&self) -> Option<(u64, SharedWriter)> {
        self.connection
            .lock()
            .as_ref()
            .map(|connection| (connection.generation, Arc::clone(&connection.writer)))
    }

    fn writer_for(&self, generation: u64) -> Option<SharedWriter> {
        self.writer()
            .filter(|(current, _)| *current == generation)
            .map(|(_, writer)| writer)
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RequestError> {
        let Some((generation, writer)) = self.writer() else {
            return Err(RequestError::SessionClosed("no connection".to_string()));
        };
        let (id, slot) = self.correlator.allocate()?;

        let text = match self.codec.encode_request(id, method, &params) {
            Ok(text) => text,
            Err(e) => {
                self.correlator.cancel(id);
                return Err(RequestError::Encode(e.to_string()));
            }
        };

        let started = Instant::now();
        tracing::debug!(id, method, "Sending request");

        let written = writer.lock().await.send_text(text).await;
        if let Err(e) = written {
            self.correlator.cancel(id);
            let error = RequestError::Transport(e.to_string());
            self.mark_closed(generation, error.clone()).await;
            metrics::record_request(method, RequestOutcome::Failed, started.elapsed());
            return Err(error);
        }

        let received = match timeout {
            Some(limit) => {
                if let Ok(received) = tokio::time::timeout(limit, slot).await {
                    received
                } else {
                    self.correlator.cancel(id);
                    tracing::warn!(
                        id,
                        method,
                        timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                        "Request timed out"
                    );
                    metrics::record_request(method, RequestOutcome::Timeout, started.elapsed());
                    return Err(RequestError::Timeout { id, timeout: limit });
                }
            }
            None => slot.await,
        };

        let result = received.unwrap_or_else(|_| {
            Err(RequestError::SessionClosed("response slot dropped".to_string()))
        });

        let outcome = match &result {
            Ok(_) => RequestOutcome::Success,
            Err(RequestError::Upstream(_)) => RequestOutcome::Rejected,
            Err(_) => RequestOutcome::Failed,
        };
        metrics::record_request(method, outcome, started.elapsed());
        tracing::debug!(id, method, outcome = outcome.as_str(), "Request completed");

        result
    }

    /// Tear down connection `generation`. Returns `false` if it was already
    /// torn down or superseded.
    async fn mark_closed(&self, generation: u64, error: RequestError) -> bool {
        let connection = {
            let mut slot = self.connection.lock();
            if slot
                .as_ref()
                .is_none_or(|connection| connection.generation != generation)
            {
                return false;
            }
            slot.take()
        };
        let Some(connection) = connection else {
            return false;
        };

        *self.state.write() = LinkState::Closed;
        *self.tokens.write() = None;
        metrics::set_session_state(LinkState::Closed.as_str());

        connection.cancel.cancel();
        let failed = self.correlator.fail_all(&error);

        let closing = async { connection.writer.lock().await.close().await };
        match tokio::time::timeout(CLOSE_TIMEOUT, closing).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Close frame not sent"),
            Err(_) => tracing::debug!("Close frame timed out"),
        }

        let reason = error.to_string();
        if matches!(error, RequestError::Transport(_)) {
            tracing::error!(generation, failed, reason = %reason, "Upstream session lost");
        } else {
            tracing::info!(generation, failed, reason = %reason, "Upstream session closed");
        }

        if self.events.send(StreamEvent::Closed { reason }).await.is_err() {
            tracing::debug!("Event receiver gone");
        }
        true
    }

    fn spawn_tasks(self: Arc<Self>, generation: u64, source: Box<dyn FrameSource>) {
        let Some(cancel) = self
            .connection
            .lock()
            .as_ref()
            .filter(|connection| connection.generation == generation)
            .map(|connection| connection.cancel.clone())
        else {
            return;
        };

        let heartbeat = Arc::new(HeartbeatState::new());
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (test_tx, test_rx) = mpsc::unbounded_channel();
        let (beat_tx, beat_rx) = mpsc::channel(4);

        tokio::spawn(pump(source, queue_tx, Arc::clone(&heartbeat), cancel.clone()));

        let dispatcher = Dispatcher::new(Arc::clone(&self.correlator), self.events.clone(), test_tx);
        tokio::spawn({
            let inner = Arc::clone(&self);
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    reason = dispatcher.run(queue_rx) => {
                        inner.mark_closed(generation, RequestError::Transport(reason)).await;
                    }
                }
            }
        });

        tokio::spawn(
            HeartbeatMonitor::new(self.config.heartbeat.clone(), heartbeat, beat_tx, cancel.clone())
                .run(),
        );
        tokio::spawn(Arc::clone(&self).handle_heartbeats(generation, beat_rx));
        tokio::spawn(self.answer_test_requests(test_rx, cancel));
    }

    async fn handle_heartbeats(self: Arc<Self>, generation: u64, mut events: mpsc::Receiver<HeartbeatEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                HeartbeatEvent::SendPing => {
                    let Some(writer) = self.writer_for(generation) else {
                        break;
                    };
                    let pinged = writer.lock().await.ping().await;
                    if let Err(e) = pinged {
                        self.mark_closed(generation, RequestError::Transport(e.to_string()))
                            .await;
                        break;
                    }
                }
                HeartbeatEvent::Timeout(idle) => {
                    let reason = format!("no inbound activity for {}ms", idle.as_millis());
                    self.mark_closed(generation, RequestError::Transport(reason)).await;
                    break;
                }
            }
        }
    }

    async fn answer_test_requests(
        self: Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<()>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                request = requests.recv() => {
                    if request.is_none() {
                        break;
                    }
                    let inner = Arc::clone(&self);
                    tokio::spawn(async move {
                        let timeout = inner.config.request_timeout;
                        if let Err(e) = inner.call("public/test", json!({}), timeout).await {
                            tracing::warn!(error = %e, "Failed to answer venue test_request");
                        }
                    });
                }
            }
        }
    }
}

/// Move inbound frames onto the queue until the transport ends.
async fn pump(
    mut source: Box<dyn FrameSource>,
    queue: mpsc::UnboundedSender<QueueItem>,
    heartbeat: Arc<HeartbeatState>,
    cancel: CancellationToken,
) {
    let reason = loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return,
            frame = source.receive() => frame,
        };

        match frame {
            Some(Ok(TransportFrame::Text(text))) => {
                heartbeat.record_activity();
                if queue.send(QueueItem::Frame(text)).is_err() {
                    return;
                }
            }
            Some(Ok(TransportFrame::Pong)) => {
                heartbeat.record_activity();
                metrics::record_frame_received(FrameKind::Pong);
            }
            Some(Err(e)) => break e.to_string(),
            None => break "connection closed by venue".to_string(),
        }
    };

    tracing::debug!(reason = %reason, "Pump stopped");
    let _ = queue.send(QueueItem::Closed(reason));
}

// =============================================================================
// Upstream Port
// =============================================================================

fn upstream_error(err: RequestError) -> UpstreamError {
    match err {
        RequestError::Upstream(rpc) => UpstreamError::Rejected(rpc.to_string()),
        other => UpstreamError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl UpstreamPort for UpstreamLink {
    async fn subscribe_book(&self, instrument: &str) -> Result<(), UpstreamError> {
        let channel = self.inner.config.book.name(instrument);
        let result = self
            .request("public/subscribe", json!({ "channels": [&channel] }))
            .await
            .map_err(upstream_error)?;

        // The venue answers with the channels it actually subscribed; an
        // unknown instrument comes back as an empty list.
        let confirmed = result
            .as_array()
            .is_some_and(|channels| channels.iter().any(|c| c.as_str() == Some(channel.as_str())));
        if confirmed {
            Ok(())
        } else {
            Err(UpstreamError::Rejected(format!(
                "venue did not confirm channel {channel}"
            )))
        }
    }

    async fn unsubscribe_book(&self, instrument: &str) -> Result<(), UpstreamError> {
        let channel = self.inner.config.book.name(instrument);
        self.request("public/unsubscribe", json!({ "channels": [channel] }))
            .await
            .map(|_| ())
            .map_err(upstream_error)
    }
}
