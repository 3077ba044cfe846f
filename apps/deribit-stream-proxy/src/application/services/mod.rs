//! Application Services
//!
//! - [`FanOut`]: consumer registry, snapshot cache and broadcast
//! - [`ReferenceCounter`]: per-instrument serialization of upstream
//!   subscribe/unsubscribe transitions

mod fanout;
mod refcount;

pub use fanout::{
    ConsumerMessage, ConsumerReceiver, FanOut, FanOutConfig, FanOutError, FanOutStats,
    SharedFanOut,
};
pub use refcount::{InstrumentGate, RefCountStats, ReferenceCounter};
