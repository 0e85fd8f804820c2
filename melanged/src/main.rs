//! Melange daemon entry point.
//!
//! Brokers structured commands from the web frontend into operations on
//! the running 3D editor and the generative providers, built around the
//! asynchronous job and resource core.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use melange_common::HubConfig;
use melanged::{cleanup, http_api, plugins, services};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "melanged")]
#[command(author, version, about = "Melange daemon - creative hub job and resource core")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Editor project root (overrides config and environment)
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// HTTP listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("starting melanged...");

    let mut config = HubConfig::load(cli.config.as_deref());
    if let Some(project_root) = cli.project_root {
        config.paths.project_root = Some(project_root);
    }
    if let Some(port) = cli.port {
        config.server.listen_port = port;
    }
    let listen_port = config.server.listen_port;
    let jobs_config = config.jobs.clone();

    let services = services::Services::from_config(config).await?;
    info!(
        "services ready (project root: {})",
        services.paths.project_root().display()
    );

    let registry = plugins::standard_registry(&services)?;
    for plugin in registry.plugins() {
        if let Err(err) = plugin.initialize().await {
            warn!(
                "plugin {} failed to initialize: {err}",
                plugin.metadata().tool_id
            );
        }
    }
    let dispatcher = Arc::new(plugins::dispatch::Dispatcher::new(registry));

    let _sweep_handle = cleanup::MaintenanceSweep::new(
        Arc::clone(&services.jobs),
        Arc::clone(&services.session_files),
        jobs_config,
    )
    .start();
    info!("maintenance sweep started");

    let state = http_api::HttpState {
        services,
        dispatcher,
        version: env!("CARGO_PKG_VERSION"),
        started_at: Instant::now(),
    };
    let router = http_api::create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], listen_port));
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
