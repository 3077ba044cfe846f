//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the venue session, the consumer endpoint and the
//! ambient services (configuration, health, metrics, telemetry).

/// Deribit JSON-RPC session adapters.
pub mod deribit;

/// Configuration loading.
pub mod config;

/// Consumer WebSocket endpoint.
pub mod downstream;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry span export.
pub mod telemetry;
