//! Proxy Configuration Settings
//!
//! Configuration types for the proxy, loaded from environment variables.

use std::time::Duration;

/// Venue environment (test network vs production).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Deribit test network.
    #[default]
    Test,
    /// Deribit production.
    Production,
}

impl Environment {
    /// Parse environment from string. Anything unrecognized is `Test`.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "prod" | "production" | "live" => Self::Production,
            _ => Self::Test,
        }
    }

    /// Check if this is the production environment.
    #[must_use]
    pub const fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Production => "prod",
        }
    }

    /// Default WebSocket endpoint for this environment.
    #[must_use]
    pub const fn ws_url(&self) -> &'static str {
        match self {
            Self::Test => "wss://test.deribit.com/ws/api/v2",
            Self::Production => "wss://www.deribit.com/ws/api/v2",
        }
    }
}

/// Deribit API credentials.
#[derive(Clone)]
pub struct Credentials {
    client_id: String,
    client_secret: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
        }
    }

    /// Get the client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Get the client secret.
    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &"[REDACTED]")
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// Upstream session settings.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// WebSocket endpoint.
    pub ws_url: String,
    /// Bound on establishing the transport.
    pub connect_timeout: Duration,
    /// Bound on a correlated request (`None` = unbounded).
    pub request_timeout: Option<Duration>,
    /// Transport ping interval.
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Interval requested through `public/set_heartbeat` (`None` = disabled).
    pub venue_heartbeat: Option<Duration>,
    /// Order-book depth requested on `book.*` channels.
    pub book_depth: u32,
    /// Order-book update interval requested on `book.*` channels.
    pub book_interval: String,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            ws_url: Environment::default().ws_url().to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(30)),
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(40),
            venue_heartbeat: Some(Duration::from_secs(30)),
            book_depth: 10,
            book_interval: "100ms".to_string(),
        }
    }
}

/// Session re-establishment settings.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Re-establish a closed session automatically.
    pub enabled: bool,
    /// Initial reconnection delay.
    pub delay_initial: Duration,
    /// Maximum reconnection delay.
    pub delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_initial: Duration::from_millis(500),
            delay_max: Duration::from_secs(30),
            delay_multiplier: 2.0,
            max_attempts: 0, // Unlimited
        }
    }
}

/// Fan-out buffer settings.
#[derive(Debug, Clone, Copy)]
pub struct FanOutSettings {
    /// Snapshots buffered per consumer before the oldest is overwritten.
    pub consumer_buffer: usize,
    /// Capacity of the link's stream event channel.
    pub event_buffer: usize,
}

impl Default for FanOutSettings {
    fn default() -> Self {
        Self {
            consumer_buffer: 256,
            event_buffer: 4096,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Downstream consumer WebSocket port.
    pub consumer_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            consumer_port: 8000,
            health_port: 8082,
        }
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Venue environment.
    pub environment: Environment,
    /// API credentials.
    pub credentials: Credentials,
    /// Upstream session settings.
    pub upstream: UpstreamSettings,
    /// Session re-establishment settings.
    pub reconnect: ReconnectSettings,
    /// Fan-out buffer settings.
    pub fanout: FanOutSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl ProxyConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials are missing or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let client_id = required_env("DERIBIT_CLIENT_ID")?;
        let client_secret = required_env("DERIBIT_CLIENT_SECRET")?;

        let environment = std::env::var("DERIBIT_ENV")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let defaults = UpstreamSettings::default();
        let upstream = UpstreamSettings {
            ws_url: std::env::var("DERIBIT_WS_URL")
                .ok()
                .filter(|url| !url.is_empty())
                .unwrap_or_else(|| environment.ws_url().to_string()),
            connect_timeout: parse_env_duration_secs(
                "PROXY_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout,
            ),
            request_timeout: parse_env_optional_secs(
                "PROXY_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout,
            ),
            heartbeat_interval: parse_env_duration_secs(
                "PROXY_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_env_duration_secs(
                "PROXY_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            venue_heartbeat: parse_env_optional_secs(
                "PROXY_VENUE_HEARTBEAT_SECS",
                defaults.venue_heartbeat,
            ),
            book_depth: parse_env_u32("PROXY_BOOK_DEPTH", defaults.book_depth),
            book_interval: std::env::var("PROXY_BOOK_INTERVAL")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.book_interval),
        };

        let reconnect = ReconnectSettings {
            enabled: parse_env_bool(
                "PROXY_RECONNECT_ENABLED",
                ReconnectSettings::default().enabled,
            ),
            delay_initial: parse_env_duration_millis(
                "PROXY_RECONNECT_DELAY_INITIAL_MS",
                ReconnectSettings::default().delay_initial,
            ),
            delay_max: parse_env_duration_secs(
                "PROXY_RECONNECT_DELAY_MAX_SECS",
                ReconnectSettings::default().delay_max,
            ),
            delay_multiplier: parse_env_f64(
                "PROXY_RECONNECT_DELAY_MULTIPLIER",
                ReconnectSettings::default().delay_multiplier,
            ),
            max_attempts: parse_env_u32(
                "PROXY_MAX_RECONNECT_ATTEMPTS",
                ReconnectSettings::default().max_attempts,
            ),
        };

        let fanout = FanOutSettings {
            consumer_buffer: parse_env_usize(
                "PROXY_CONSUMER_BUFFER",
                FanOutSettings::default().consumer_buffer,
            ),
            event_buffer: parse_env_usize(
                "PROXY_EVENT_BUFFER",
                FanOutSettings::default().event_buffer,
            ),
        };

        let server = ServerSettings {
            consumer_port: parse_env_u16(
                "PROXY_CONSUMER_PORT",
                ServerSettings::default().consumer_port,
            ),
            health_port: parse_env_u16(
                "PROXY_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        Ok(Self {
            environment,
            credentials: Credentials::new(client_id, client_secret),
            upstream,
            reconnect,
            fanout,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn required_env(key: &str) -> Result<String, ConfigError> {
    let value = std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

/// Seconds where `0` means "off".
fn parse_env_optional_secs(key: &str, default: Option<Duration>) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, secs_or_disabled)
}

fn secs_or_disabled(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
