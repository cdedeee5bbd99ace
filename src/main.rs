//! linechat - Entry Point
//!
//! `linechat [start] [CONFIG]` runs the server in the foreground.
//! `linechat info [STATS]` prints the last stats snapshot.

use std::env;
use std::path::{Path, PathBuf};

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use linechat::stats::{read_snapshot, spawn_snapshot_writer};
use linechat::{build_acceptor, shutdown_channel, ChatServer, Config};

/// Default config file path
const DEFAULT_CONFIG: &str = "linechat.toml";

/// Default stats file path for `info`
const DEFAULT_STATS: &str = "linechat-stats.json";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=linechat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("linechat=info")),
        )
        .init();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("info") => {
            let path = args.next().unwrap_or_else(|| DEFAULT_STATS.to_string());
            info_command(Path::new(&path)).await
        }
        Some("start") => start(args.next()).await,
        Some("-h") | Some("--help") => {
            println!("usage: linechat [start] [CONFIG] | linechat info [STATS]");
            Ok(())
        }
        other => start(other.map(str::to_string)).await,
    }
}

async fn info_command(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    match read_snapshot(path).await {
        Ok(snapshot) => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Err(e) => {
            println!("no stats at {}: {}", path.display(), e);
            Ok(())
        }
    }
}

async fn start(config_path: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = PathBuf::from(config_path.unwrap_or_else(|| DEFAULT_CONFIG.to_string()));
    let config = Config::load(&config_path)?;
    info!("Loaded config from {}", config_path.display());

    let server = ChatServer::new(config.settings());
    let (stop_tx, shutdown) = shutdown_channel();

    let mut listeners = Vec::new();

    if config.server.tcp.enabled {
        let addr = (config.bind_address.as_str(), config.server.tcp.port);
        let listener = TcpListener::bind(addr).await?;
        listeners.push((listener, None));
    }

    if config.server.tls.enabled {
        let (Some(cert), Some(key)) = (&config.server.tls.cert, &config.server.tls.key) else {
            return Err("tls enabled but ssl_cert or ssl_key not defined".into());
        };
        let acceptor = build_acceptor(cert, key)?;
        let addr = (config.bind_address.as_str(), config.server.tls.port);
        let listener = TcpListener::bind(addr).await?;
        listeners.push((listener, Some(acceptor)));
    }

    let stats_task = config.stats_file.clone().map(|path| {
        info!("Writing stats to {}", path.display());
        spawn_snapshot_writer(
            server.clone(),
            path,
            config.stats_interval(),
            shutdown.clone(),
        )
    });

    let serve_tasks: Vec<_> = listeners
        .into_iter()
        .map(|(listener, tls)| {
            let server = server.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.serve(listener, tls, shutdown).await })
        })
        .collect();

    info!("{} started", server.settings().name);
    wait_for_signal().await;
    info!("Shutting down");
    signal_shutdown(&stop_tx);

    for task in serve_tasks {
        if let Err(e) = task.await {
            error!("Listener task failed: {}", e);
        }
    }
    if let Some(task) = stats_task {
        let _ = task.await;
    }

    info!(
        "Stopped after {}s, {} messages relayed",
        server.uptime().as_secs(),
        server.total_messages()
    );
    Ok(())
}

fn signal_shutdown(stop_tx: &watch::Sender<bool>) {
    let _ = stop_tx.send(true);
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
