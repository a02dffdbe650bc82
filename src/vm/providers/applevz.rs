//! Apple Virtualization.framework provider (macOS)
//!
//! The framework is only reachable from an entitled native binary, so the
//! guest is run by the bundled `servin-vz-helper` executable: this provider
//! supervises the helper process and reaches the in-guest agent through the
//! forwarded loopback port, the same contract as every other provider.

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

const VM_ID: &str = "servin-vz";
const HELPER_BINARY: &str = "servin-vz-helper";
const BOOT_TIMEOUT: Duration = Duration::from_secs(120);

struct Instance {
    config: VmInstanceConfig,
    child: Option<Child>,
    state: VmState,
}

/// Virtualization.framework-backed provider
pub struct AppleVzProvider {
    state_dir: PathBuf,
    instance: Mutex<Option<Instance>>,
    link: AgentLink,
}

impl AppleVzProvider {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            instance: Mutex::new(None),
            link: AgentLink::new(),
        }
    }

    fn helper_command(&self, config: &VmInstanceConfig) -> VmResult<Command> {
        if std::env::consts::OS != "macos" {
            return Err(VmError::Unavailable(
                "Virtualization.framework requires macOS".into(),
            ));
        }

        let base_image = config.base_image_path.as_ref().ok_or_else(|| {
            VmError::Unavailable("no base image configured for Virtualization.framework".into())
        })?;

        let mut command = Command::new(HELPER_BINARY);
        command
            .args(["--cpus", &config.cpus.to_string()])
            .args(["--memory-mb", &config.memory_mb.to_string()])
            .args(["--disk", &base_image.display().to_string()])
            .args(["--state-dir", &self.state_dir.display().to_string()])
            .args(["--ssh-port", &config.ssh_port.to_string()])
            .args(["--agent-port", &config.agent_port.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
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
}

#[async_trait]
impl VmProvider for AppleVzProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AppleVirtualization
    }

    async fn create(&self, config: &VmInstanceConfig) -> VmResult<String> {
        std::fs::create_dir_all(&self.state_dir)?;
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
                VmState::Running | VmState::Booting => return Ok(()),
                _ => {}
            }
            instance.state = VmState::Booting;
            (
                self.helper_command(&instance.config)?,
                instance.config.agent_port,
            )
        };

        let mut command = command;
        let child = command.spawn().map_err(|e| {
            if let Some(instance) = self.instance.lock().as_mut() {
                instance.state = VmState::Failed;
            }
            VmError::Unavailable(format!("{}: {}", HELPER_BINARY, e))
        })?;

        info!("vz helper booting (pid {:?})", child.id());
        if let Some(instance) = self.instance.lock().as_mut() {
            instance.child = Some(child);
        }

        match Self::wait_for_agent(agent_port).await {
            Ok(()) => {
                self.link.set_port(agent_port);
                if let Some(instance) = self.instance.lock().as_mut() {
                    instance.state = VmState::Running;
                }
                info!("vz guest {} running, agent on {}", vm_id, agent_port);
                Ok(())
            }
            Err(e) => {
                warn!("vz guest failed to expose agent: {}", e);
                if let Some(instance) = self.instance.lock().as_mut() {
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
                    // The helper forwards SIGTERM as a guest power-down
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                    let _ = tokio::time::timeout(Duration::from_secs(30), child.wait()).await;
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
        info!("vz guest {} stopped", vm_id);
        Ok(())
    }

    async fn destroy(&self, vm_id: &str) -> VmResult<()> {
        self.stop(vm_id, false).await?;
        *self.instance.lock() = None;
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
