//! VM provider contract and selection

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::VmConfiguration;
use crate::platform::{HostOs, Platform};

use super::agent::{AgentMessage, AgentRequest};

/// Error type for provider operations
#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM not found: {0}")]
    NotFound(String),

    #[error("VM not running: {0}")]
    NotRunning(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Agent protocol error: {0}")]
    Protocol(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type VmResult<T> = Result<T, VmError>;

impl From<VmError> for crate::error::DaemonError {
    fn from(e: VmError) -> Self {
        use crate::error::{DaemonError, ErrorKind};
        let kind = match &e {
            VmError::NotFound(_) => ErrorKind::NotFound,
            VmError::NotRunning(_) | VmError::Unavailable(_) => ErrorKind::Unavailable,
            VmError::Protocol(_) | VmError::Other(_) => ErrorKind::Internal,
            VmError::Timeout => ErrorKind::Timeout,
            VmError::Io(_) => ErrorKind::Io,
        };
        DaemonError::new(kind, "vm", e.to_string())
    }
}

/// VM lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Stopped,
    Booting,
    Running,
    Stopping,
    Failed,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Stopped => write!(f, "stopped"),
            VmState::Booting => write!(f, "booting"),
            VmState::Running => write!(f, "running"),
            VmState::Stopping => write!(f, "stopping"),
            VmState::Failed => write!(f, "failed"),
        }
    }
}

/// Provider variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    AppleVirtualization,
    HyperV,
    Kvm,
    Development,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::AppleVirtualization => write!(f, "applevz"),
            ProviderKind::HyperV => write!(f, "hyperv"),
            ProviderKind::Kvm => write!(f, "kvm"),
            ProviderKind::Development => write!(f, "development"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "applevz" | "virtualization" | "vz" => Ok(ProviderKind::AppleVirtualization),
            "hyperv" | "hyper-v" => Ok(ProviderKind::HyperV),
            "kvm" | "qemu" => Ok(ProviderKind::Kvm),
            "development" | "dev" => Ok(ProviderKind::Development),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// Guest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInstanceConfig {
    pub cpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub ssh_port: u16,
    pub agent_port: u16,
    pub base_image_path: Option<PathBuf>,
}

impl From<&VmConfiguration> for VmInstanceConfig {
    fn from(config: &VmConfiguration) -> Self {
        Self {
            cpus: config.cpus,
            memory_mb: config.memory_mb,
            disk_gb: config.disk_gb,
            ssh_port: config.ssh_port,
            agent_port: config.agent_port,
            base_image_path: config.base_image_path.clone(),
        }
    }
}

/// Provider contract.
///
/// Start and stop are idempotent: starting a running VM and stopping a
/// stopped VM are no-ops.
#[async_trait]
pub trait VmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Allocate a VM; returns its id. Creating twice returns the same id.
    async fn create(&self, config: &VmInstanceConfig) -> VmResult<String>;

    async fn start(&self, vm_id: &str) -> VmResult<()>;

    async fn stop(&self, vm_id: &str, graceful: bool) -> VmResult<()>;

    async fn destroy(&self, vm_id: &str) -> VmResult<()>;

    async fn status(&self, vm_id: &str) -> VmResult<VmState>;

    /// Send one request to the in-guest agent; resolves with the terminal
    /// message.
    async fn dispatch(&self, vm_id: &str, request: AgentRequest) -> VmResult<AgentMessage>;

    /// Send a streaming request; every message for the correlation id flows
    /// through the receiver, terminal message last.
    async fn dispatch_stream(
        &self,
        vm_id: &str,
        request: AgentRequest,
    ) -> VmResult<mpsc::Receiver<AgentMessage>>;
}

/// Choose the provider for this daemon instance.
///
/// Decided once at startup: explicit override, then development flag, then
/// per-host defaults. `None` means native path only (Linux with VM mode
/// disabled).
pub fn select_provider_kind(
    platform: &Platform,
    config: &VmConfiguration,
) -> Result<Option<ProviderKind>, String> {
    if let Some(name) = config.provider.as_deref() {
        return name.parse().map(Some);
    }

    if config.development {
        return Ok(Some(ProviderKind::Development));
    }

    match platform.os {
        HostOs::Macos => Ok(Some(ProviderKind::AppleVirtualization)),
        HostOs::Windows => Ok(Some(ProviderKind::HyperV)),
        HostOs::Linux if config.enabled => Ok(Some(ProviderKind::Kvm)),
        HostOs::Linux => Ok(None),
        HostOs::Other => Ok(Some(ProviderKind::Development)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PrivilegeLevel;

    fn platform(os: HostOs) -> Platform {
        Platform {
            os,
            arch: "x86_64".into(),
            os_version: "test".into(),
            cpus: 4,
            total_memory: 8 << 30,
            virtualization: true,
            privilege: PrivilegeLevel::Privileged,
        }
    }

    #[test]
    fn test_selection_explicit_override_wins() {
        let mut config = VmConfiguration::default();
        config.provider = Some("development".into());
        let kind = select_provider_kind(&platform(HostOs::Macos), &config).unwrap();
        assert_eq!(kind, Some(ProviderKind::Development));
    }

    #[test]
    fn test_selection_dev_flag() {
        let mut config = VmConfiguration::default();
        config.development = true;
        let kind = select_provider_kind(&platform(HostOs::Linux), &config).unwrap();
        assert_eq!(kind, Some(ProviderKind::Development));
    }

    #[test]
    fn test_selection_per_host() {
        let config = VmConfiguration::default();
        assert_eq!(
            select_provider_kind(&platform(HostOs::Macos), &config).unwrap(),
            Some(ProviderKind::AppleVirtualization)
        );
        assert_eq!(
            select_provider_kind(&platform(HostOs::Windows), &config).unwrap(),
            Some(ProviderKind::HyperV)
        );
        assert_eq!(
            select_provider_kind(&platform(HostOs::Linux), &config).unwrap(),
            None
        );

        let mut vm_enabled = VmConfiguration::default();
        vm_enabled.enabled = true;
        assert_eq!(
            select_provider_kind(&platform(HostOs::Linux), &vm_enabled).unwrap(),
            Some(ProviderKind::Kvm)
        );
    }

    #[test]
    fn test_unknown_provider_name() {
        let mut config = VmConfiguration::default();
        config.provider = Some("vmware".into());
        assert!(select_provider_kind(&platform(HostOs::Linux), &config).is_err());
    }
}
