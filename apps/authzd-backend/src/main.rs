//! authzd-backend: one process per tenant.
//!
//! Started by the gateway supervisor with `--tenant <id> --port <port>`
//! and the `TENANT_ID` / `GRPC_PORT` / `BASE_CONNECTION_STRING`
//! environment. Hydrates the tenant graph from durable storage, then
//! serves the command gRPC surface while the single-writer loop owns the
//! graph.

mod config;
mod rpc;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use authz_engine::domain::graph::TenantGraph;
use authz_engine::engine::processor::spawn;
use authz_engine::hydration::{self, HydrationError};
use authz_engine::persistence::{MemoryStore, SqliteStore, TenantStore};
use authzd_proto::CommandServiceServer;

use config::{BackendConfig, render_connection_string};
use rpc::CommandRpc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Exit code for a corrupt durable store detected during hydration. The
/// supervisor treats this differently from transient startup failures.
const EXIT_CORRUPT_STORE: i32 = 3;

/// authzd tenant backend
#[derive(Parser)]
#[command(name = "authzd-backend")]
#[command(about = "authzd tenant backend - per-tenant authorization engine")]
#[command(version)]
struct Cli {
    /// Tenant this process serves (falls back to TENANT_ID)
    #[arg(long)]
    tenant: Option<String>,

    /// gRPC listen port (falls back to GRPC_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Use an in-memory store instead of SQLite
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the backend
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

    let config = BackendConfig::load(cli.config.as_deref())?;

    if cli.print_config {
        println!("Effective configuration:\n{}", config.to_pretty()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => {
            println!("Configuration is valid");
            Ok(())
        }
        Commands::Run => {
            if let Err(e) = run_backend(&cli, config).await {
                if matches!(
                    e.downcast_ref::<HydrationError>(),
                    Some(HydrationError::Corrupt(_))
                ) {
                    tracing::error!(error = %e, "tenant store is corrupt, refusing to start");
                    std::process::exit(EXIT_CORRUPT_STORE);
                }
                return Err(e);
            }
            Ok(())
        }
    }
}

fn resolve_tenant(cli: &Cli) -> Result<String> {
    cli.tenant
        .clone()
        .or_else(|| std::env::var("TENANT_ID").ok())
        .filter(|t| !t.is_empty())
        .context("tenant id missing: pass --tenant or set TENANT_ID")
}

fn resolve_port(cli: &Cli, config: &BackendConfig) -> Result<u16> {
    if let Some(port) = cli.port {
        return Ok(port);
    }
    if let Ok(raw) = std::env::var("GRPC_PORT") {
        return raw
            .parse()
            .with_context(|| format!("invalid GRPC_PORT: {raw}"));
    }
    config
        .server
        .port
        .context("port missing: pass --port, set GRPC_PORT or server.port")
}

async fn open_store(cli: &Cli, config: &BackendConfig, tenant: &str) -> Result<Arc<dyn TenantStore>> {
    if cli.mock {
        tracing::info!("mock mode: using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let template = std::env::var("BASE_CONNECTION_STRING")
        .unwrap_or_else(|_| config.database.connection_string.clone());
    let dsn = render_connection_string(&template, tenant);
    tracing::info!(dsn = %dsn, "opening tenant store");
    let store = SqliteStore::open(&dsn)
        .await
        .with_context(|| format!("failed to open tenant store at {dsn}"))?;
    Ok(Arc::new(store))
}

async fn run_backend(cli: &Cli, config: BackendConfig) -> Result<()> {
    let tenant = resolve_tenant(cli)?;
    let port = resolve_port(cli, &config)?;
    let addr: SocketAddr = format!("{}:{port}", config.server.bind_host)
        .parse()
        .with_context(|| format!("invalid bind address {}:{port}", config.server.bind_host))?;

    tracing::info!(tenant = %tenant, %addr, "authzd backend starting");

    // Root cancellation token: OS signals, the Shutdown command and server
    // teardown all flow through it.
    let cancel = CancellationToken::new();
    let cancel_for_signals = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            tracing::warn!(error = %e, "signal waiter failed, falling back to ctrl_c");
            let _ = tokio::signal::ctrl_c().await;
        }
        cancel_for_signals.cancel();
    });

    // Hydrate before the command loop starts consuming: readiness is only
    // announced (the gRPC health endpoint responding) once the graph is up.
    let store = open_store(cli, &config, &tenant).await?;
    let (graph, last_seq): (TenantGraph, u64) = hydration::hydrate(store.as_ref()).await?;

    let (handle, engine_task) = spawn(graph, store, &config.engine, cancel.clone(), last_seq);

    let service = CommandRpc::new(tenant.clone(), handle);
    let shutdown = cancel.clone();
    tracing::info!(tenant = %tenant, %addr, "serving commands");
    tonic::transport::Server::builder()
        .add_service(CommandServiceServer::new(service))
        .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
        .await
        .context("gRPC server failed")?;

    // Server is down; stop the engine and wait for the drain.
    cancel.cancel();
    let _ = engine_task.await;
    tracing::info!(tenant = %tenant, "authzd backend stopped");
    Ok(())
}

/// Wait for termination signals (Ctrl+C, SIGTERM).
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("ctrl_c failed")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("ctrl_c failed")?;
    }
    tracing::info!("shutdown signal received");
    Ok(())
}
