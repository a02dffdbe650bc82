//! Hyper-V provider (Windows)
//!
//! Drives the hypervisor through PowerShell cmdlets; the guest image ships
//! with the agent configured on the forwarded port. Falls back with
//! `Unavailable` when the Hyper-V module is missing so the daemon can pick
//! the WSL2-backed QEMU path instead.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::info;

use crate::vm::agent::{AgentMessage, AgentRequest};
use crate::vm::provider::{
    ProviderKind, VmError, VmInstanceConfig, VmProvider, VmResult, VmState,
};

use super::AgentLink;

const VM_NAME: &str = "servin-vm";
const BOOT_TIMEOUT: Duration = Duration::from_secs(180);

/// Hyper-V-backed provider
pub struct HyperVProvider {
    state: Mutex<VmState>,
    config: Mutex<Option<VmInstanceConfig>>,
    link: AgentLink,
}

impl HyperVProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VmState::Stopped),
            config: Mutex::new(None),
            link: AgentLink::new(),
        }
    }

    async fn powershell(script: &str) -> VmResult<String> {
        if std::env::consts::OS != "windows" {
            return Err(VmError::Unavailable("Hyper-V requires Windows".into()));
        }

        let output = Command::new("powershell.exe")
            .args(["-NoProfile", "-NonInteractive", "-Command", script])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| VmError::Unavailable(format!("powershell: {}", e)))?;

        if !output.status.success() {
            return Err(VmError::Other(format!(
                "powershell failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn wait_for_agent(port: u16) -> VmResult<()> {
        let deadline = tokio::time::Instant::now() + BOOT_TIMEOUT;
        loop {
            if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VmError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

impl Default for HyperVProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VmProvider for HyperVProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::HyperV
    }

    async fn create(&self, config: &VmInstanceConfig) -> VmResult<String> {
        let base_image = config
            .base_image_path
            .as_ref()
            .ok_or_else(|| VmError::Unavailable("no base image configured for Hyper-V".into()))?;

        // Existing VM means create was already done; keep it
        let exists = Self::powershell(&format!(
            "Get-VM -Name '{}' -ErrorAction SilentlyContinue | Select-Object -ExpandProperty Name",
            VM_NAME
        ))
        .await
        .map(|out| out.contains(VM_NAME))
        .unwrap_or(false);

        if !exists {
            Self::powershell(&format!(
                "New-VM -Name '{vm}' -MemoryStartupBytes {mem}MB -Generation 2 -VHDPath '{vhd}'; \
                 Set-VM -Name '{vm}' -ProcessorCount {cpus} -AutomaticStartAction Nothing",
                vm = VM_NAME,
                mem = config.memory_mb,
                cpus = config.cpus,
                vhd = base_image.display(),
            ))
            .await?;
        }

        *self.config.lock() = Some(config.clone());
        Ok(VM_NAME.to_string())
    }

    async fn start(&self, vm_id: &str) -> VmResult<()> {
        {
            let state = self.state.lock();
            if matches!(*state, VmState::Running | VmState::Booting) {
                // Idempotent
                return Ok(());
            }
        }
        *self.state.lock() = VmState::Booting;

        let agent_port = self
            .config
            .lock()
            .as_ref()
            .map(|c| c.agent_port)
            .ok_or_else(|| VmError::NotFound(vm_id.to_string()))?;

        if let Err(e) = Self::powershell(&format!("Start-VM -Name '{}'", VM_NAME)).await {
            *self.state.lock() = VmState::Failed;
            return Err(e);
        }

        match Self::wait_for_agent(agent_port).await {
            Ok(()) => {
                self.link.set_port(agent_port);
                *self.state.lock() = VmState::Running;
                info!("Hyper-V guest {} running, agent on {}", vm_id, agent_port);
                Ok(())
            }
            Err(e) => {
                let _ =
                    Self::powershell(&format!("Stop-VM -Name '{}' -TurnOff -Force", VM_NAME)).await;
                *self.state.lock() = VmState::Failed;
                Err(e)
            }
        }
    }

    async fn stop(&self, vm_id: &str, graceful: bool) -> VmResult<()> {
        if *self.state.lock() == VmState::Stopped {
            // Idempotent
            return Ok(());
        }
        *self.state.lock() = VmState::Stopping;
        self.link.reset();

        let script = if graceful {
            format!("Stop-VM -Name '{}' -Force", VM_NAME)
        } else {
            format!("Stop-VM -Name '{}' -TurnOff -Force", VM_NAME)
        };
        Self::powershell(&script).await?;

        *self.state.lock() = VmState::Stopped;
        info!("Hyper-V guest {} stopped", vm_id);
        Ok(())
    }

    async fn destroy(&self, vm_id: &str) -> VmResult<()> {
        self.stop(vm_id, false).await?;
        Self::powershell(&format!("Remove-VM -Name '{}' -Force", VM_NAME)).await?;
        *self.config.lock() = None;
        Ok(())
    }

    async fn status(&self, _vm_id: &str) -> VmResult<VmState> {
        Ok(*self.state.lock())
    }

    async fn dispatch(&self, _vm_id: &str, request: AgentRequest) -> VmResult<AgentMessage> {
        let dispatcher = self.link.get().await?;
        dispatcher.request(request).await
    }

    async fn dispatch_stream(
        &self,
        _vm_id: &str,
        request: AgentRequest,
    ) -> VmResult<mpsc::Receiver<AgentMessage>> {
        let dispatcher = self.link.get().await?;
        dispatcher.request_stream(request).await
    }
}
