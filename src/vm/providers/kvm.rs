//! KVM provider (Linux)
//!
//! Boots the guest with qemu-system using KVM acceleration and user-mode
//! networking with the SSH and agent ports forwarded to loopback. The qemu
//! process is supervised directly; the in-guest agent is reached through
//! the shared dispatcher link.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::vm::agent::{AgentMessage, AgentRequest};
use crate::vm::provider::{
    ProviderKind, VmError, VmInstanceConfig, VmProvider, VmResult, VmState,
};

use super::AgentLink;

const VM_ID: &str = "servin-kvm";

/// Wait this long for the agent port after boot
const BOOT_TIMEOUT: Duration = Duration::from_secs(120);

struct Instance {
    config: VmInstanceConfig,
    child: Option<Child>,
    state: VmState,
}

/// QEMU/KVM-backed provider
pub struct KvmProvider {
    state_dir: PathBuf,
    instance: Mutex<Option<Instance>>,
    link: AgentLink,
}

impl KvmProvider {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            instance: Mutex::new(None),
            link: AgentLink::new(),
        }
    }

    fn disk_path(&self) -> PathBuf {
        self.state_dir.join("kvm-disk.qcow2")
    }

    fn build_command(&self, config: &VmInstanceConfig) -> VmResult<Command> {
        let base_image = config
            .base_image_path
            .as_ref()
            .ok_or_else(|| VmError::Unavailable("no base image configured for KVM".into()))?;

        let mut command = Command::new("qemu-system-x86_64");
        command
            .arg("-enable-kvm")
            .arg("-nographic")
            .args(["-cpu", "host"])
            .args(["-smp", &config.cpus.to_string()])
            .args(["-m", &format!("{}M", config.memory_mb)])
            .args([
                "-drive",
                &format!("file={},if=virtio,format=qcow2", self.disk_path().display()),
            ])
            .args([
                "-drive",
                &format!("file={},if=virtio,readonly=on", base_image.display()),
            ])
            .args([
                "-netdev",
                &format!(
                    "user,id=net0,hostfwd=tcp:127.0.0.1:{}-:22,hostfwd=tcp:127.0.0.1:{}-:7777",
                    config.ssh_port, config.agent_port
                ),
            ])
            .args(["-device", "virtio-net-pci,netdev=net0"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        Ok(command)
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

    fn ensure_disk(&self, config: &VmInstanceConfig) -> VmResult<()> {
        if self.disk_path().exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.state_dir)?;

        let status = std::process::Command::new("qemu-img")
            .args(["create", "-f", "qcow2"])
            .arg(self.disk_path())
            .arg(format!("{}G", config.disk_gb))
            .status()
            .map_err(|e| VmError::Unavailable(format!("qemu-img: {}", e)))?;

        if !status.success() {
            return Err(VmError::Other("qemu-img create failed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl VmProvider for KvmProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Kvm
    }

    async fn create(&self, config: &VmInstanceConfig) -> VmResult<String> {
        if !std::path::Path::new("/dev/kvm").exists() {
            return Err(VmError::Unavailable("/dev/kvm not present".into()));
        }
        self.ensure_disk(config)?;

        let mut instance = self.instance.lock();
        if instance.is_none() {
            *instance = Some(Instance {
                config: config.clone(),
                child: None,
                state: VmState::Stopped,
            });
        }
        Ok(VM_ID.to_string())
    }

    async fn start(&self, vm_id: &str) -> VmResult<()> {
        let (command, agent_port) = {
            let mut instance = self.instance.lock();
            let instance = instance
                .as_mut()
                .ok_or_else(|| VmError::NotFound(vm_id.to_string()))?;

            match instance.state {
                // Idempotent
                VmState::Running | VmState::Booting => return Ok(()),
                _ => {}
            }
            instance.state = VmState::Booting;
            (self.build_command(&instance.config)?, instance.config.agent_port)
        };

        let mut command = command;
        let child = command.spawn().map_err(|e| {
            if let Some(instance) = self.instance.lock().as_mut() {
                instance.state = VmState::Failed;
            }
            VmError::Unavailable(format!("qemu spawn: {}", e))
        })?;

        info!("qemu guest booting (pid {:?})", child.id());
        {
            let mut instance = self.instance.lock();
            if let Some(instance) = instance.as_mut() {
                instance.child = Some(child);
            }
        }

        match Self::wait_for_agent(agent_port).await {
            Ok(()) => {
                self.link.set_port(agent_port);
                let mut instance = self.instance.lock();
                if let Some(instance) = instance.as_mut() {
                    instance.state = VmState::Running;
                }
                info!("KVM guest {} running, agent on {}", vm_id, agent_port);
                Ok(())
            }
            Err(e) => {
                warn!("KVM guest failed to expose agent: {}", e);
                let mut instance = self.instance.lock();
                if let Some(instance) = instance.as_mut() {
                    if let Some(child) = instance.child.as_mut() {
                        let _ = child.start_kill();
                    }
                    instance.state = VmState::Failed;
                }
                Err(e)
            }
        }
    }

    async fn stop(&self, vm_id: &str, graceful: bool) -> VmResult<()> {
        let child = {
            let mut instance = self.instance.lock();
            let Some(instance) = instance.as_mut() else {
                // Stopping a VM that never existed is a no-op
                return Ok(());
            };
            if instance.state == VmState::Stopped {
                // Idempotent
                return Ok(());
            }
            instance.state = VmState::Stopping;
            instance.child.take()
        };

        self.link.reset();

        if let Some(mut child) = child {
            #[cfg(unix)]
            if graceful {
                if let Some(pid) = child.id() {
                    // qemu powers down the guest on SIGTERM
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                    let _ =
                        tokio::time::timeout(Duration::from_secs(30), child.wait()).await;
                }
            }
            #[cfg(not(unix))]
            let _ = graceful;
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        if let Some(instance) = self.instance.lock().as_mut() {
            instance.state = VmState::Stopped;
        }
        info!("KVM guest {} stopped", vm_id);
        Ok(())
    }

    async fn destroy(&self, vm_id: &str) -> VmResult<()> {
        self.stop(vm_id, false).await?;
        *self.instance.lock() = None;
        if self.disk_path().exists() {
            std::fs::remove_file(self.disk_path())?;
        }
        Ok(())
    }

    async fn status(&self, _vm_id: &str) -> VmResult<VmState> {
        Ok(self
            .instance
            .lock()
            .as_ref()
            .map(|i| i.state)
            .unwrap_or(VmState::Stopped))
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
