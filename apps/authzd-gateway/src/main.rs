//! authzd-gateway: the multi-tenant front end.
//!
//! Resolves a tenant for every inbound request, keeps one backend process
//! per tenant alive through the supervisor, and forwards commands over
//! per-endpoint gRPC channels.

mod api;
mod config;
mod error;
mod router;
mod supervisor;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use api::{AppState, build_router};
use config::GatewayConfig;
use router::TenantRouter;
use supervisor::Supervisor;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// authzd gateway
#[derive(Parser)]
#[command(name = "authzd-gateway")]
#[command(about = "authzd gateway - tenant routing and backend supervision")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port override for the HTTP server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Spawn backends with in-memory stores
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Run,
    /// Validate configuration and exit
    Check,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = GatewayConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.mock {
        config.supervisor.mock_backends = true;
    }

    if cli.print_config {
        println!("Effective configuration:\n{}", config.to_pretty()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => {
            println!("Configuration is valid");
            Ok(())
        }
        Commands::Run => run_gateway(config).await,
    }
}

async fn run_gateway(config: GatewayConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.bind_host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid bind address {}:{}",
                config.server.bind_host, config.server.port
            )
        })?;

    tracing::info!(%addr, "authzd gateway starting");

    let cancel = CancellationToken::new();
    let cancel_for_signals = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::warn!("failed to listen for ctrl_c");
        }
        cancel_for_signals.cancel();
    });
    #[cfg(unix)]
    {
        let cancel_for_sigterm = cancel.clone();
        tokio::spawn(async move {
            if let Ok(mut sigterm) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            {
                sigterm.recv().await;
                cancel_for_sigterm.cancel();
            }
        });
    }

    let supervisor = Supervisor::new(config.supervisor.clone(), cancel.clone());
    let state = Arc::new(AppState {
        router: TenantRouter::new(Arc::clone(&supervisor), &config.router),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "serving HTTP");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    // Stop every tenant backend and release their ports before exiting.
    supervisor.shutdown().await;
    tracing::info!("authzd gateway stopped");
    Ok(())
}
