//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with the venue and consumers.

/// Port interfaces for the upstream venue session.
pub mod ports;

/// Subscription fan-out and upstream reference counting.
pub mod services;
