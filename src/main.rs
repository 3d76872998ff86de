//! fishbowl - shared, observable Linux sandboxes over WebSocket.
//!
//! Usage:
//!   fishbowl serve [--port 3001] [--image fishbowl-sandbox:latest]

use anyhow::Context;
use clap::{Parser, Subcommand};
use fishbowl::config::{Config, ServeArgs};
use fishbowl::credentials::{CredentialStore, FileCredentialStore};
use fishbowl::runtime::DockerRuntime;
use fishbowl::terminal::DockerExecPty;
use fishbowl::{http_server, AppState};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fishbowl")]
#[command(about = "Per-user Docker sandboxes with observable terminals")]
struct Args {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP and WebSocket server
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match args.command {
        Commands::Serve(serve_args) => serve(serve_args.into()).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let runtime = DockerRuntime::connect().context("connecting to the Docker daemon")?;
    runtime
        .ping()
        .await
        .context("the Docker daemon is not responding")?;

    let credentials: Arc<dyn CredentialStore> = match &config.credentials_file {
        Some(path) => Arc::new(
            FileCredentialStore::open(path.clone())
                .await
                .with_context(|| format!("loading credentials from {}", path.display()))?,
        ),
        None => {
            warn!("Credentials are kept in memory and will be lost on restart");
            Arc::new(FileCredentialStore::in_memory())
        }
    };

    tokio::fs::create_dir_all(&config.storage_root)
        .await
        .with_context(|| format!("creating {}", config.storage_root.display()))?;

    let state = AppState::new(
        Arc::new(runtime),
        credentials,
        Arc::new(DockerExecPty::new()),
        config,
    );

    match state.lifecycle.adopt_existing().await {
        Ok(adopted) => info!(adopted, "Tracking sandboxes from a previous run"),
        Err(e) => warn!(error = %e, "Could not list existing sandboxes"),
    }

    http_server::run_server(state, shutdown_signal()).await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
