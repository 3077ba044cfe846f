//! Domain Layer - Core streaming types and subscription bookkeeping.
//!
//! This layer contains the order-book types consumers receive and the
//! membership table that drives upstream subscription transitions. Nothing
//! here performs I/O.

/// Order-book snapshots and upstream stream events.
pub mod streaming;

/// Consumer/instrument membership tracking.
pub mod subscription;
