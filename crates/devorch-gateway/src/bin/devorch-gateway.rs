//! devorch gateway binary
//!
//! Runs the orchestrator and serves it over WebSocket and REST.
//!
//! # Usage
//! ```bash
//! devorch-gateway [--port 8766] [--host 127.0.0.1] [--config devorch.toml] [--verbose]
//! ```

use anyhow::Context;
use clap::Parser;
use devorch_core::config::data_dir;
use devorch_core::{Orchestrator, OrchestratorConfig};
use devorch_gateway::{Gateway, GatewayConfig, DEFAULT_HOST, DEFAULT_PORT};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// devorch gateway - guarded local dev orchestration over WebSocket
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Orchestrator TOML config (defaults to $DEVORCH_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Gateway JSON config
    #[arg(long)]
    gateway_config: Option<PathBuf>,

    /// Keep history in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if verbose {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(args.verbose);

    let mut orchestrator_config = match &args.config {
        Some(path) => OrchestratorConfig::from_file(path)
            .with_context(|| format!("reading {}", path.display()))?
            .apply_env(),
        None => OrchestratorConfig::from_env().context("loading orchestrator config")?,
    };
    if orchestrator_config.storage.database_path.is_none() && !args.ephemeral {
        orchestrator_config = orchestrator_config.with_database(data_dir().join("devorch.db"));
    }

    let mut gateway_config = match &args.gateway_config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(host) = args.host {
        gateway_config = gateway_config.with_host(host);
    }
    if let Some(port) = args.port {
        gateway_config = gateway_config.with_port(port);
    }

    let orchestrator = Orchestrator::start(orchestrator_config)
        .await
        .context("starting orchestrator")?;

    print_banner(&gateway_config.host, gateway_config.port);

    let gateway = Gateway::new(gateway_config, orchestrator.clone());
    let served = gateway
        .start(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await;

    orchestrator.shutdown().await;
    served.context("gateway stopped with an error")?;
    Ok(())
}

fn print_banner(host: &str, port: u16) {
    println!();
    println!("devorch gateway v{}", devorch_gateway::VERSION);
    println!();
    println!("WebSocket");
    println!("   └─ ws://{}:{}/ws", host, port);
    println!();
    println!("HTTP endpoints");
    println!("   ├─ GET    /health");
    println!("   ├─ GET    /status");
    println!("   ├─ GET    /api/state");
    println!("   ├─ POST   /api/commands");
    println!("   ├─ POST   /api/approvals/:id/approve | reject");
    println!("   ├─ GET    /api/services");
    println!("   ├─ POST   /api/services");
    println!("   └─ DELETE /api/services/:id");
    println!();
    if host != DEFAULT_HOST || port != DEFAULT_PORT {
        println!("Note: non-default address, point the CLI at it with --gateway");
        println!();
    }
    println!("Press Ctrl+C to stop the gateway");
    println!();
}
