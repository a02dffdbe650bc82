//! VM lifecycle manager
//!
//! Owns the selected provider, the single guest instance, and the
//! `vm-running` marker file that lets a daemon restart resume supervision
//! without rebooting the guest. Tracks the vm-lost window during which
//! restart-policy evaluation is suppressed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{DaemonError, Result};
use crate::events::{EventBus, EventType};

use super::agent::{AgentMessage, AgentOp, AgentRequest};
use super::provider::{VmInstanceConfig, VmProvider, VmState};

/// Manager for the daemon's single VM instance
pub struct VmManager {
    provider: Arc<dyn VmProvider>,
    config: VmInstanceConfig,

    /// `<state_root>/vm-running`
    marker_path: PathBuf,

    vm_id: RwLock<Option<String>>,

    /// Set between a detected VM loss and the next successful start
    lost_window: AtomicBool,

    event_bus: EventBus,
}

impl VmManager {
    pub fn new(
        provider: Arc<dyn VmProvider>,
        config: VmInstanceConfig,
        marker_path: PathBuf,
        event_bus: EventBus,
    ) -> Self {
        Self {
            provider,
            config,
            marker_path,
            vm_id: RwLock::new(None),
            lost_window: AtomicBool::new(false),
            event_bus,
        }
    }

    pub fn provider(&self) -> &Arc<dyn VmProvider> {
        &self.provider
    }

    /// Whether we are between a VM loss and the next start
    pub fn in_lost_window(&self) -> bool {
        self.lost_window.load(Ordering::SeqCst)
    }

    /// Record that the guest disappeared under us
    pub fn mark_lost(&self) {
        if !self.lost_window.swap(true, Ordering::SeqCst) {
            warn!("VM connection lost; suppressing restart policies until next start");
            self.event_bus.emit(EventType::Vm, "lost", "vm");
        }
    }

    fn current_vm_id(&self) -> Result<String> {
        self.vm_id
            .read()
            .clone()
            .ok_or_else(|| DaemonError::unavailable("vm", "no VM instance"))
    }

    /// Create-on-first-demand, then start. Idempotent; a successful start
    /// writes the running marker and closes the lost window.
    pub async fn ensure_started(&self) -> Result<String> {
        let current = self.vm_id.read().clone();
        let vm_id = match current {
            Some(id) => id,
            None => {
                let id = self.provider.create(&self.config).await?;
                *self.vm_id.write() = Some(id.clone());
                id
            }
        };

        self.provider.start(&vm_id).await?;
        std::fs::write(&self.marker_path, vm_id.as_bytes())?;
        self.lost_window.store(false, Ordering::SeqCst);
        self.event_bus.emit(EventType::Vm, "start", &vm_id);
        Ok(vm_id)
    }

    /// Stop the guest and clear the marker. Idempotent.
    pub async fn stop(&self, graceful: bool) -> Result<()> {
        let current = self.vm_id.read().clone();
        let Some(vm_id) = current else {
            let _ = std::fs::remove_file(&self.marker_path);
            return Ok(());
        };

        self.provider.stop(&vm_id, graceful).await?;
        let _ = std::fs::remove_file(&self.marker_path);
        self.event_bus.emit(EventType::Vm, "stop", &vm_id);
        Ok(())
    }

    pub async fn destroy(&self) -> Result<()> {
        let current = self.vm_id.read().clone();
        if let Some(vm_id) = current {
            self.provider.destroy(&vm_id).await?;
        }
        *self.vm_id.write() = None;
        let _ = std::fs::remove_file(&self.marker_path);
        Ok(())
    }

    pub async fn status(&self) -> Result<VmState> {
        let current = self.vm_id.read().clone();
        match current {
            Some(vm_id) => Ok(self.provider.status(&vm_id).await?),
            None => Ok(VmState::Stopped),
        }
    }

    /// Daemon startup: when the marker says the guest should be running,
    /// resume supervision. A guest the provider still reports Running is
    /// adopted without a reboot.
    pub async fn resume_supervision(&self) -> Result<()> {
        if !self.marker_path.exists() {
            return Ok(());
        }

        let recorded = std::fs::read_to_string(&self.marker_path).unwrap_or_default();
        if !recorded.is_empty() {
            *self.vm_id.write() = Some(recorded.trim().to_string());
        }

        match self.status().await? {
            VmState::Running => {
                info!("adopted running VM from marker file");
                Ok(())
            }
            _ => {
                info!("marker present but VM down; booting");
                self.ensure_started().await.map(|_| ())
            }
        }
    }

    /// Forward a unary agent op, translating connection loss into the lost
    /// window.
    pub async fn dispatch(&self, op: AgentOp) -> Result<AgentMessage> {
        let vm_id = self.current_vm_id()?;
        match self.provider.dispatch(&vm_id, AgentRequest::new(op)).await {
            Ok(message) => Ok(message),
            Err(e) => {
                if matches!(e, super::provider::VmError::Unavailable(_)) {
                    self.mark_lost();
                }
                Err(e.into())
            }
        }
    }

    /// Forward a streaming agent op
    pub async fn dispatch_stream(&self, op: AgentOp) -> Result<mpsc::Receiver<AgentMessage>> {
        let vm_id = self.current_vm_id()?;
        match self
            .provider
            .dispatch_stream(&vm_id, AgentRequest::new(op))
            .await
        {
            Ok(rx) => Ok(rx),
            Err(e) => {
                if matches!(e, super::provider::VmError::Unavailable(_)) {
                    self.mark_lost();
                }
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::providers::DevelopmentProvider;
    use tempfile::TempDir;

    fn manager(temp: &TempDir) -> VmManager {
        let provider = Arc::new(DevelopmentProvider::new(temp.path().to_path_buf()));
        VmManager::new(
            provider,
            VmInstanceConfig {
                cpus: 1,
                memory_mb: 512,
                disk_gb: 4,
                ssh_port: 0,
                agent_port: 0,
                base_image_path: None,
            },
            temp.path().join("vm-running"),
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn test_ensure_started_writes_marker() {
        let temp = TempDir::new().unwrap();
        let vm = manager(&temp);

        vm.ensure_started().await.unwrap();
        assert!(temp.path().join("vm-running").exists());
        assert_eq!(vm.status().await.unwrap(), VmState::Running);

        // Idempotent
        vm.ensure_started().await.unwrap();

        vm.stop(true).await.unwrap();
        assert!(!temp.path().join("vm-running").exists());
    }

    #[tokio::test]
    async fn test_resume_supervision_adopts_running_guest() {
        let temp = TempDir::new().unwrap();
        {
            let vm = manager(&temp);
            vm.ensure_started().await.unwrap();
        }

        // New manager, same state dir: the dev provider sees its own marker
        let vm = manager(&temp);
        vm.resume_supervision().await.unwrap();
        assert_eq!(vm.status().await.unwrap(), VmState::Running);
    }

    #[tokio::test]
    async fn test_lost_window_cleared_by_start() {
        let temp = TempDir::new().unwrap();
        let vm = manager(&temp);
        vm.ensure_started().await.unwrap();

        vm.mark_lost();
        assert!(vm.in_lost_window());

        vm.ensure_started().await.unwrap();
        assert!(!vm.in_lost_window());
    }

    #[tokio::test]
    async fn test_dispatch_ping() {
        let temp = TempDir::new().unwrap();
        let vm = manager(&temp);
        vm.ensure_started().await.unwrap();

        let reply = vm.dispatch(AgentOp::Ping).await.unwrap();
        assert!(reply.ok);
        assert_eq!(reply.payload["provider"], "development");
    }
}
