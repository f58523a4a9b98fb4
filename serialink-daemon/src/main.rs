/*!
 * SERIALINK Bluetooth Serial Bridge Daemon
 * One Bluetooth Classic serial connection, managed for a host application
 */

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod bluetooth;
mod bridge;
mod config;
mod error;
mod host;
mod ipc;

use bluetooth::BluezBackend;
use bridge::Bridge;
use config::DaemonConfig;
use ipc::{IpcServer, Request, Response};

#[derive(Parser)]
#[command(name = "serialinkd")]
#[command(about = "SERIALINK Bluetooth Serial Bridge Daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "/etc/serialink/serialinkd.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run,
    /// Check daemon status
    Status,
    /// Stop the daemon
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("serialink_daemon={}", log_level))
        .init();

    // Load configuration
    let config = DaemonConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::Status => check_status(&config).await,
        Commands::Stop => stop_daemon(&config).await,
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!("SERIALINK daemon starting...");

    let backend = Arc::new(
        BluezBackend::connect(&config.bluetooth)
            .await
            .context("Could not reach BlueZ on the system bus")?,
    );

    let (bridge, handle) = Bridge::new(backend, config.clone());
    bridge.initialize().await;
    let bridge_task = tokio::spawn(bridge.run());

    let listener = bind_socket(&config.socket_path)?;
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    let ipc_server = IpcServer::new(listener, handle.clone(), shutdown_tx);

    info!("SERIALINK daemon ready on socket: {}", config.socket_path);

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = ipc_server.run() => {
            if let Err(e) = result {
                error!("IPC server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = sigterm.recv() => info!("Terminated"),
        _ = shutdown_rx.recv() => {}
    }

    if let Err(e) = handle.shutdown().await {
        warn!("Bridge did not shut down cleanly: {}", e);
    }
    let _ = bridge_task.await;

    if let Err(e) = std::fs::remove_file(&config.socket_path) {
        warn!("Could not remove socket {}: {}", config.socket_path, e);
    }
    info!("SERIALINK daemon stopped");
    Ok(())
}

/// Bind the host socket, replacing a stale one left by a previous run.
fn bind_socket(socket_path: &str) -> Result<UnixListener> {
    let path = Path::new(socket_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Could not create {}", parent.display()))?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path).with_context(|| format!("Could not bind {}", socket_path))
}

async fn request(config: &DaemonConfig, request: Request) -> Result<Response> {
    let stream = UnixStream::connect(&config.socket_path)
        .await
        .with_context(|| format!("SERIALINK daemon is not running ({})", config.socket_path))?;
    let (read_half, mut write_half) = stream.into_split();

    let mut line = serde_json::to_string(&request)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;

    // Skip the indicator and outputs broadcast to every client
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        match serde_json::from_str::<Response>(&line)? {
            Response::Output { .. } | Response::Indicator(_) => continue,
            response => return Ok(response),
        }
    }
    bail!("Daemon closed the connection")
}

async fn check_status(config: &DaemonConfig) -> Result<()> {
    match request(config, Request::Status).await? {
        Response::Status { snapshot } => {
            println!("State:     {:?}", snapshot.state);
            println!("Device:    {}", snapshot.device.as_deref().unwrap_or("-"));
            println!("Address:   {}", snapshot.address.as_deref().unwrap_or("-"));
            println!("Adapter:   {}", snapshot.adapter.as_deref().unwrap_or("-"));
            println!("Scanning:  {}", if snapshot.scanning { "yes" } else { "no" });
            println!(
                "Indicator: {} ({})",
                snapshot.indicator.text,
                if snapshot.indicator.is_connected() { "up" } else { "down" }
            );
            println!("Since:     {}", snapshot.since.format("%Y-%m-%d %H:%M:%S UTC"));
            Ok(())
        }
        Response::Error { message } => bail!(message),
        other => bail!("Unexpected response: {:?}", other),
    }
}

async fn stop_daemon(config: &DaemonConfig) -> Result<()> {
    match request(config, Request::Shutdown).await? {
        Response::Success { message } => {
            println!("{}", message);
            Ok(())
        }
        Response::Error { message } => bail!(message),
        other => bail!("Unexpected response: {:?}", other),
    }
}
