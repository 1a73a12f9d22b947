//! ONNX Serving - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use onnx_serving::http::Listener;
use onnx_serving::{Environment, api, config::ServerConfig, grpc, metrics};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "onnx-serving")]
#[command(about = "Serve an ONNX model over HTTP/JSON and gRPC", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the ONNX model file
    #[arg(short = 'm', long)]
    model_path: Option<PathBuf>,

    /// Address to listen on
    #[arg(short = 'a', long)]
    address: Option<String>,

    /// HTTP port
    #[arg(short = 'p', long)]
    http_port: Option<u16>,

    /// gRPC port
    #[arg(long)]
    grpc_port: Option<u16>,

    /// Worker thread count
    #[arg(short = 't', long)]
    num_threads: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (json or pretty)
    #[arg(long)]
    log_format: Option<String>,

    /// Per-request model run timeout in seconds
    #[arg(long)]
    request_timeout_secs: Option<u64>,
}

impl Cli {
    /// CLI flags take precedence over file and environment values
    fn apply(self, config: &mut ServerConfig) {
        if let Some(model_path) = self.model_path {
            config.model_path = model_path;
        }
        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(port) = self.grpc_port {
            config.grpc_port = port;
        }
        if let Some(threads) = self.num_threads {
            config.num_threads = threads;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(timeout) = self.request_timeout_secs {
            config.request_timeout_secs = Some(timeout);
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = ServerConfig::load(cli.config.clone())?;
    cli.apply(&mut config);

    // Setup logging
    match config.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&config.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&config.log_level)
                .json()
                .init();
        }
    }

    config.validate()?;

    tracing::info!(
        model_path = ?config.model_path,
        address = %config.address,
        http_port = config.http_port,
        grpc_port = config.grpc_port,
        num_threads = config.num_threads,
        request_timeout_secs = ?config.request_timeout_secs,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.num_threads)
        .thread_name("onnx-serving-worker")
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    runtime.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> Result<()> {
    tracing::info!("Starting ONNX Serving");

    // Model and allocator; failure here exits before any socket is opened
    let env = Arc::new(Environment::from_config(&config)?);

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    // Setup API
    let app_state = api::AppState::new(env.clone(), prometheus_handle)
        .context("Failed to build route table")?
        .with_request_timeout(config.request_timeout());
    let app = api::create_router(app_state, config.max_message_size_bytes());

    let http_addr = config.http_addr()?;
    let http_listener = Listener::bind(http_addr, app, config.max_connections)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", http_addr))?;

    let grpc_addr = config.grpc_addr()?;
    let grpc_listener = TcpListener::bind(grpc_addr)
        .await
        .with_context(|| format!("Failed to bind gRPC listener on {}", grpc_addr))?;

    tracing::info!(http = %http_addr, grpc = %grpc_addr, "Listening");

    // Graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_handle = tokio::spawn(http_listener.serve(shutdown_requested(shutdown_rx.clone())));
    let grpc_handle = tokio::spawn(grpc::start_grpc_server(
        grpc_listener,
        env,
        config.request_timeout(),
        config.max_message_size_bytes(),
        shutdown_requested(shutdown_rx),
    ));

    shutdown_signal().await;
    tracing::info!("Shutting down...");
    let _ = shutdown_tx.send(true);

    http_handle.await.context("HTTP listener task failed")?;
    grpc_handle
        .await
        .context("gRPC server task failed")?
        .map_err(|e| anyhow::anyhow!("gRPC server error: {}", e))?;

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
