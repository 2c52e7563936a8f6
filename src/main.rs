use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info};

use scadagate::api::{create_api_routes, SharedAppState};
use scadagate::cognitive::{CognitiveSink, HealthScoringSink, NullCognitiveSink};
use scadagate::logbus::LogBus;
use scadagate::logging::init_tracing;
use scadagate::supervisor::Supervisor;

/// Service-mode switch (§6): only `foreground` actually runs the gateway.
/// `service` is a stub matching spec.md's "CLI accepts a mode switch"
/// language — a real OS-service wrapper is out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Foreground,
    Service,
}

#[derive(Debug, Parser)]
#[command(name = "scadagate", about = "Industrial data-acquisition and control gateway")]
struct Cli {
    /// Path to the TOML configuration document (§6).
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Directory for the daily-rotating log file tee; pass an empty value
    /// to disable the file tee and keep only the console and ring buffer.
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// HTTP control-plane bind address (§4.7).
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Run mode (§6).
    #[arg(long, value_enum, default_value = "foreground")]
    mode: Mode,

    /// Per-device bounded write-queue capacity (§4.4).
    #[arg(long, default_value_t = scadagate::routing::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Enables the rolling mean/variance anomaly scorer as the cognitive
    /// sink instead of the allow-all no-op default (§4.6).
    #[arg(long)]
    cognitive_scoring: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logs = LogBus::default();
    let logs = if cli.log_dir.as_os_str().is_empty() {
        logs
    } else {
        logs.with_file_tee(&cli.log_dir)
    };
    init_tracing(logs.clone());

    if cli.mode == Mode::Service {
        info!("service mode requested; no OS-service wrapper is implemented, running in the foreground");
    }

    let cognitive: Arc<dyn CognitiveSink> = if cli.cognitive_scoring {
        Arc::new(HealthScoringSink::new())
    } else {
        Arc::new(NullCognitiveSink)
    };

    let supervisor = match Supervisor::start(cli.config.clone(), logs.clone(), cognitive, cli.queue_capacity).await {
        Ok(s) => s,
        Err(e) => {
            error!(config = ?cli.config, error = %e, "failed to start: configuration could not be loaded");
            std::process::exit(1);
        }
    };

    let state = SharedAppState {
        supervisor: supervisor.clone(),
        start_time: tokio::time::Instant::now(),
    };

    let app = create_api_routes().with_state(state);

    let listener = match tokio::net::TcpListener::bind(cli.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %cli.listen, error = %e, "failed to bind HTTP listener");
            std::process::exit(1);
        }
    };

    info!(addr = %cli.listen, "HTTP control plane listening");

    let shutdown_supervisor = supervisor.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, draining within 5s");
        tokio::time::timeout(Duration::from_secs(5), shutdown_supervisor.shutdown())
            .await
            .ok();
    });

    if let Err(e) = server.await {
        error!(error = %e, "HTTP server exited with an error");
    }
}
