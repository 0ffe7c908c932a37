//! Peerlink Signal Server
//!
//! WebSocket signaling relay for peer discovery and connection setup.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (port 9000, path /myapp, key "peerjs")
//! peerlink-signal
//!
//! # Environment-driven deployment
//! PORT=8080 PEERLINK_KEY=visiocampus ALLOWED_ORIGINS=https://app.example peerlink-signal
//!
//! # Config file plus overrides
//! peerlink-signal --config /etc/peerlink/config.toml --max-peers 500
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use peerlink_core::{Config, OverflowPolicy};
use peerlink_signal::{SignalServer, TracingObserver};

#[derive(Parser, Debug)]
#[command(name = "peerlink-signal")]
#[command(about = "Signaling relay for peer-to-peer connection setup")]
#[command(version)]
struct Args {
    /// TOML config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long, env = "HOST")]
    bind: Option<IpAddr>,

    /// Mount path; the WebSocket endpoint is {path}/peerjs
    #[arg(long, env = "PEERLINK_PATH")]
    path: Option<String>,

    /// Namespace key clients must present
    #[arg(long, env = "PEERLINK_KEY")]
    key: Option<String>,

    /// Comma-separated origins allowed to connect (empty = any)
    #[arg(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Option<Vec<String>>,

    /// Trust X-Forwarded-For from a fronting proxy
    #[arg(long, env = "PEERLINK_PROXIED")]
    proxied: Option<bool>,

    /// Maximum concurrent peers
    #[arg(long, env = "MAX_PEERS")]
    max_peers: Option<usize>,

    /// Expose the peer list over HTTP
    #[arg(long, env = "ALLOW_DISCOVERY")]
    allow_discovery: Option<bool>,

    /// Full send buffer policy: drop_newest or block
    #[arg(long, env = "PEERLINK_OVERFLOW")]
    overflow: Option<OverflowPolicy>,

    /// Idle time before a peer is flagged (ms)
    #[arg(long, env = "EXPIRE_TIMEOUT_MS")]
    expire_timeout_ms: Option<u64>,

    /// Extra idle time before a flagged peer is removed (ms)
    #[arg(long, env = "CLEANUP_GRACE_MS")]
    cleanup_grace_ms: Option<u64>,

    /// Time between liveness sweeps (ms)
    #[arg(long, env = "SWEEP_INTERVAL_MS")]
    sweep_interval_ms: Option<u64>,

    /// Time allowed for connections to close on shutdown (ms)
    #[arg(long, env = "SHUTDOWN_GRACE_MS")]
    shutdown_grace_ms: Option<u64>,

    /// Log as JSON lines
    #[arg(long, env = "PEERLINK_JSON_LOGS")]
    json_logs: bool,

    /// Print a sample config file and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    /// Layer command-line and environment values over the file config
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(path) = &self.path {
            config.server.path = path.clone();
        }
        if let Some(key) = &self.key {
            config.relay.key = key.clone();
        }
        if let Some(origins) = &self.allowed_origins {
            config.server.allowed_origins = origins
                .iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(proxied) = self.proxied {
            config.server.proxied = proxied;
        }
        if let Some(max_peers) = self.max_peers {
            config.relay.max_peers = max_peers;
        }
        if let Some(allow_discovery) = self.allow_discovery {
            config.relay.allow_discovery = allow_discovery;
        }
        if let Some(overflow) = self.overflow {
            config.relay.overflow = overflow;
        }
        if let Some(ms) = self.expire_timeout_ms {
            config.liveness.expire_timeout_ms = ms;
        }
        if let Some(ms) = self.cleanup_grace_ms {
            config.liveness.cleanup_grace_ms = ms;
        }
        if let Some(ms) = self.sweep_interval_ms {
            config.liveness.sweep_interval_ms = ms;
        }
        if let Some(ms) = self.shutdown_grace_ms {
            config.shutdown.grace_ms = ms;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", Config::sample());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(filter)
        .with((!args.json_logs).then(|| fmt::layer()))
        .with(args.json_logs.then(|| fmt::layer().json()))
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    args.apply(&mut config);
    config.validate()?;

    info!("Starting peerlink signal server");
    info!(
        "Namespace key {:?}, max {} peers, expire {:?} + {:?}",
        config.relay.key,
        config.relay.max_peers,
        config.liveness.expire_timeout(),
        config.liveness.cleanup_grace()
    );
    if config.server.allowed_origins.is_empty() {
        warn!("No allowed origins configured, accepting connections from any origin");
    }

    let server = SignalServer::new(config);
    server.coordinator().subscribe(Arc::new(TracingObserver));
    let grace = server.config().shutdown.grace();

    tokio::select! {
        result = server.serve() => result?,
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            let report = server.shutdown(grace).await;
            info!(
                "Closed {} peers ({} did not acknowledge) in {:?}",
                report.removed, report.unacknowledged, report.elapsed
            );
        }
    }

    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
