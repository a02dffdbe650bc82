//! Servin Daemon - cross-platform container runtime
//!
//! Exposes a CRI service and a Docker-compatible REST API on top of a
//! dual-mode execution engine: native Linux kernel isolation, or a managed
//! lightweight VM on every other host.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cmd;

#[derive(Parser)]
#[command(name = "servin-daemon")]
#[command(about = "Cross-platform container runtime daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "servin.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Data root override
    #[arg(long)]
    data_root: Option<String>,

    /// CRI socket override
    #[arg(long)]
    cri_socket: Option<String>,

    /// REST API socket override
    #[arg(long)]
    api_socket: Option<String>,

    /// Optional REST API TCP bind, e.g. 0.0.0.0:2375
    #[arg(long)]
    api_tcp: Option<String>,

    /// Force VM mode even on Linux
    #[arg(long)]
    vm: bool,

    /// Development mode: simulated VM provider, no hypervisor required
    #[arg(long)]
    dev: bool,

    /// Explicit VM provider: applevz, hyperv, kvm, development
    #[arg(long)]
    provider: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("servin_daemon={}", log_level).into()),
        )
        .init();

    info!("Starting Servin Daemon v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(cmd::Commands::Diagnostics) => {
            cmd::diagnostics::run(&cli.config).await?;
        }
        None => {
            let overrides = cmd::root::Overrides {
                data_root: cli.data_root,
                cri_socket: cli.cri_socket,
                api_socket: cli.api_socket,
                api_tcp: cli.api_tcp,
                vm_mode: cli.vm,
                dev_mode: cli.dev,
                provider: cli.provider,
            };
            if let Err(e) = cmd::root::run(&cli.config, overrides).await {
                error!("Daemon error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
