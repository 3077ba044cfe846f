//! Deribit Stream Proxy Binary
//!
//! Starts the upstream session, the consumer endpoint and the health server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin deribit-stream-proxy
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `DERIBIT_CLIENT_ID`: API client id
//! - `DERIBIT_CLIENT_SECRET`: API client secret
//!
//! ## Optional
//! - `DERIBIT_ENV`: test | prod (default: test)
//! - `DERIBIT_WS_URL`: overrides the environment's endpoint
//! - `PROXY_CONSUMER_PORT`: consumer WebSocket port (default: 8000)
//! - `PROXY_HEALTH_PORT`: health check HTTP port (default: 8082)
//! - `PROXY_RECONNECT_ENABLED`: re-establish a closed session (default: true)
//! - `OTEL_ENABLED`: enable span export (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: log filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use deribit_stream_proxy::infrastructure::deribit::{ReconnectConfig, WsConnector};
use deribit_stream_proxy::infrastructure::telemetry;
use deribit_stream_proxy::{
    ConsumerServer, FanOut, FanOutConfig, HealthServer, HealthServerState, LinkConfig,
    ProxyConfig, SessionSupervisor, SharedFanOut, UpstreamLink, init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bound on closing the upstream session at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init()?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Deribit Stream Proxy");

    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let config = ProxyConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let (event_tx, event_rx) = mpsc::channel(config.fanout.event_buffer);
    let link = UpstreamLink::new(
        LinkConfig::from(&config.upstream),
        config.credentials.clone(),
        Arc::new(WsConnector),
        event_tx,
    );
    let fanout: SharedFanOut = Arc::new(FanOut::new(
        FanOutConfig::from(config.fanout),
        Arc::new(link.clone()),
    ));

    link.connect()
        .await
        .context("failed to establish upstream session")?;

    let reconnect = config
        .reconnect
        .enabled
        .then(|| ReconnectConfig::from(&config.reconnect));
    let supervisor = SessionSupervisor::new(
        link.clone(),
        Arc::clone(&fanout),
        reconnect,
        shutdown_token.clone(),
    );
    let supervisor_shutdown = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = supervisor.run(event_rx).await {
            tracing::error!(error = %e, "Session supervisor stopped");
            supervisor_shutdown.cancel();
        }
    });

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        link.clone(),
        Arc::clone(&fanout),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let consumer_server = ConsumerServer::new(
        config.server.consumer_port,
        Arc::clone(&fanout),
        shutdown_token.clone(),
    );
    let consumer_shutdown = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = consumer_server.run().await {
            tracing::error!(error = %e, "Consumer server error");
            consumer_shutdown.cancel();
        }
    });

    tracing::info!("Stream proxy ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, link.close()).await.is_err() {
        tracing::warn!("Upstream session did not close in time");
    }

    tracing::info!("Stream proxy stopped");
    Ok(())
}

/// Log the parsed configuration. Credentials are never logged.
fn log_config(config: &ProxyConfig) {
    tracing::info!(
        environment = config.environment.as_str(),
        url = %config.upstream.ws_url,
        consumer_port = config.server.consumer_port,
        health_port = config.server.health_port,
        reconnect = config.reconnect.enabled,
        "Configuration loaded"
    );
    tracing::debug!(
        book_depth = config.upstream.book_depth,
        book_interval = %config.upstream.book_interval,
        consumer_buffer = config.fanout.consumer_buffer,
        event_buffer = config.fanout.event_buffer,
        "Fan-out settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for SIGTERM, Ctrl+C or an internal shutdown, then cancel everything.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {
            tracing::warn!("Internal failure, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
