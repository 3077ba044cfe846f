//! Configuration Module
//!
//! Configuration loading for the proxy service.

mod settings;

pub use settings::{
    ConfigError, Credentials, Environment, FanOutSettings, ProxyConfig, ReconnectSettings,
    ServerSettings, UpstreamSettings,
};
