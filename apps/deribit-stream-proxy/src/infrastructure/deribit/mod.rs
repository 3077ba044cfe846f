//! Deribit WebSocket Adapters
//!
//! Implements the single upstream JSON-RPC session and everything around it:
//!
//! - **Link**: connection lifecycle, authentication, correlated requests
//! - **Dispatcher**: routes responses, book pushes and venue heartbeats
//! - **Supervisor**: snapshot routing and reconnection with backoff
//! - **Trading**: order and account commands over the shared session

pub mod auth;
pub mod codec;
pub mod correlator;
pub mod dispatcher;
pub mod heartbeat;
pub mod link;
pub mod messages;
pub mod reconnect;
pub mod supervisor;
pub mod trading;
pub mod transport;

pub use auth::{AuthError, AuthState, SessionTokens};
pub use codec::{CodecError, InboundFrame, JsonCodec};
pub use correlator::{Correlator, RequestError};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
pub use link::{LinkConfig, LinkError, LinkState, UpstreamLink};
pub use messages::{BookChannel, RpcError};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
pub use supervisor::SessionSupervisor;
pub use trading::{OrderRequest, OrderSide, OrderType, TradingApi};
pub use transport::{
    Connector, MemoryConnector, MemoryListener, MemoryVenue, TransportError, WsConnector,
};
