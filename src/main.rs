use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn, Level};

use querygate::config::QuerygateConfig;
use querygate::ratelimit::{LimitSettings, QueryGate};
use querygate::relay::RelayServer;

/// Query-flood protection sidecar for game servers.
#[derive(Debug, Parser)]
#[command(name = "querygate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the client-facing listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the protected game server address
    #[arg(long)]
    upstream: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Querygate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => QuerygateConfig::from_file(path)?,
        None => QuerygateConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(upstream) = args.upstream {
        config.server.upstream_addr = upstream;
    }
    info!(
        listen = %config.server.listen_addr,
        upstream = %config.server.upstream_addr,
        "Configuration loaded"
    );

    // Initialize the rate limiter
    let gate = Arc::new(QueryGate::new(LimitSettings::from(&config.limits)));
    info!("Rate limiter initialized");

    #[cfg(unix)]
    spawn_reload_handler(Arc::clone(&gate), args.config.clone());

    // Run the relay with graceful shutdown on Ctrl+C
    let server = RelayServer::new(config.server.clone(), Arc::clone(&gate));
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Querygate stopped");
    Ok(())
}

/// Re-read the limit tunables on SIGHUP and apply them to the running
/// limiter without dropping accounting state.
#[cfg(unix)]
fn spawn_reload_handler(gate: Arc<QueryGate>, config_path: Option<PathBuf>) {
    tokio::spawn(async move {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGHUP handler, live reload disabled");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match &config_path {
                Some(path) => match QuerygateConfig::from_file(path) {
                    Ok(config) => {
                        gate.set_limits(LimitSettings::from(&config.limits));
                        info!(path = %path.display(), "Reloaded rate limit settings");
                    }
                    Err(e) => {
                        warn!(error = %e, "Config reload failed, keeping previous settings");
                    }
                },
                None => info!("SIGHUP received but no config file was given, nothing to reload"),
            }
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
