//! Main daemon command - starts the daemon

use anyhow::Result;
use tracing::info;

use servin_daemon::config::Configuration;
use servin_daemon::daemon::Daemon;

/// Flag overrides applied after file and environment configuration
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub data_root: Option<String>,
    pub cri_socket: Option<String>,
    pub api_socket: Option<String>,
    pub api_tcp: Option<String>,
    pub vm_mode: bool,
    pub dev_mode: bool,
    pub provider: Option<String>,
}

/// Run the daemon
pub async fn run(config_path: &str, overrides: Overrides) -> Result<()> {
    info!("loading configuration from {}", config_path);
    let mut config = Configuration::load(config_path)?;

    // Flags win over file and environment
    if let Some(data_root) = overrides.data_root {
        config.system.data_root = data_root.into();
    }
    if let Some(socket) = overrides.cri_socket {
        config.cri.socket = socket.into();
    }
    if let Some(socket) = overrides.api_socket {
        config.api.socket = socket.into();
    }
    if let Some(tcp) = overrides.api_tcp {
        config.api.tcp_bind = Some(tcp);
    }
    if overrides.vm_mode {
        config.vm.enabled = true;
    }
    if overrides.dev_mode {
        config.vm.development = true;
    }
    if let Some(provider) = overrides.provider {
        config.vm.provider = Some(provider);
    }

    info!("  data root: {}", config.system.data_root.display());
    info!("  CRI socket: {}", config.cri.socket.display());
    info!("  API socket: {}", config.api.socket.display());

    let daemon = Daemon::bootstrap(config)?;
    daemon.restore().await?;
    daemon.serve().await
}
