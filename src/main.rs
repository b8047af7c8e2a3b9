mod activity;
mod backend;
mod catalog;
mod config;
mod dataplane;
mod errors;
mod http_api;
mod idle_watcher;
mod lifecycle;
mod settings;
mod tunnel;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::backend::local::{detect_container_runtime, ContainerRuntime, LocalBackend};
use crate::catalog::InMemoryCatalog;
use crate::config::{BackendKind, Config};
use crate::dataplane::{DenyAllMembership, RejectAllSessions};
use crate::http_api::{AppState, NullAssetServer};
use crate::lifecycle::LifecycleController;
use crate::settings::{OverrideStore, SettingsResolver};
use crate::tunnel::TunnelRegistry;

#[derive(Parser)]
#[command(name = "sandboxd")]
#[command(about = "Self-hosted multi-tenant orchestrator for per-user coding-agent sandboxes")]
#[command(version)]
struct Cli {
    /// Path to a sandboxd.toml config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (data plane + management API + tunnel broker).
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
    /// Print the resolved configuration as JSON and exit.
    PrintConfig,
    /// Print the resolved quota/admission settings as JSON and exit.
    PrintSettings,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => {
            let default_path = PathBuf::from("sandboxd.toml");
            if default_path.exists() {
                Config::from_file(&default_path)
            } else {
                Ok(Config::minimal())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Arc::new(load_config(cli.config.as_ref())?);

    match cli.command {
        Commands::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&*config)?);
        }
        Commands::PrintSettings => {
            let resolver = SettingsResolver::new(OverrideStore::new());
            let settings = resolver.effective().await;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "max_workspaces_per_user": settings.max_workspaces_per_user,
                    "max_sandboxes_per_workspace": settings.max_sandboxes_per_workspace,
                    "default_cpu_millicores": settings.default_cpu_millicores,
                    "default_memory_bytes": settings.default_memory_bytes,
                    "default_idle_timeout_seconds": settings.default_idle_timeout_seconds,
                    "workspace_max_total_cpu_millicores": settings.workspace_max_total_cpu_millicores,
                    "workspace_max_total_memory_bytes": settings.workspace_max_total_memory_bytes,
                    "workspace_drive_size_bytes": settings.workspace_drive_size_bytes,
                }))?
            );
        }
        Commands::Serve { host, port } => {
            let addr: SocketAddr = format!("{host}:{port}").parse().context("invalid bind address")?;
            match config.backend {
                BackendKind::Docker => serve_local(addr, config).await?,
                #[cfg(feature = "cluster")]
                BackendKind::Cluster => serve_cluster(addr, config).await?,
                #[cfg(not(feature = "cluster"))]
                BackendKind::Cluster => {
                    anyhow::bail!("cluster backend selected but this binary was built without the `cluster` feature")
                }
            }
        }
    }

    Ok(())
}

async fn serve_local(addr: SocketAddr, config: Arc<Config>) -> Result<()> {
    let runtime = detect_container_runtime()
        .await
        .unwrap_or(ContainerRuntime::Docker);
    let backend = Arc::new(LocalBackend::new(runtime, "sandboxd/agent:latest"));
    run_with_backend(addr, config, backend).await
}

#[cfg(feature = "cluster")]
async fn serve_cluster(addr: SocketAddr, config: Arc<Config>) -> Result<()> {
    let backend = crate::backend::cluster::ClusterBackend::connect(
        "sandboxd",
        "sandboxd/agent:latest",
        std::env::var("SANDBOXD_KUBECONFIG").ok(),
        std::env::var("SANDBOXD_KUBE_CONTEXT").ok(),
    )
    .await
    .context("failed to connect to cluster backend")?;
    run_with_backend(addr, config, Arc::new(backend)).await
}

async fn run_with_backend<B: backend::Backend + 'static>(
    addr: SocketAddr,
    config: Arc<Config>,
    backend: Arc<B>,
) -> Result<()> {
    let catalog = InMemoryCatalog::new();
    let settings = Arc::new(SettingsResolver::new(OverrideStore::new()));
    let tunnels = TunnelRegistry::new();
    let lifecycle = LifecycleController::new(catalog.clone(), backend, settings.clone(), tunnels.clone());

    if let Err(e) = lifecycle.reconcile_orphans().await {
        warn!(error = %e, "orphan reconciliation failed at startup");
    }

    let state = Arc::new(AppState::new(
        config,
        catalog.clone(),
        lifecycle.clone(),
        tunnels,
        Arc::new(RejectAllSessions),
        Arc::new(DenyAllMembership),
        Arc::new(NullAssetServer),
    ));

    tokio::spawn(idle_watcher::run(catalog, settings, lifecycle));

    info!("starting sandboxd");
    http_api::run_server(addr, state).await
}
