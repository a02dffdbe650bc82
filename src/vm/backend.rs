//! VM execution backend
//!
//! Implements the runtime backend contract by forwarding every container
//! operation to the in-guest agent through the VM manager. Main-process
//! output and exit arrive on the long-lived wait stream; a connection loss
//! there becomes the `vm_lost` exit record.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::backend::{
    BackendError, BackendResult, ContainerStats, ExecSession, ExecSpec, ExecutionMode, ExitStatus,
    OutputCallback, ResourceLimits, RuntimeBackend, StartedProcess,
};

use super::agent::{AgentMessageKind, AgentOp};
use super::manager::VmManager;

struct VmHandle {
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    stdin_open: bool,
}

/// Backend that executes containers inside the managed VM
pub struct VmBackend {
    vm: Arc<VmManager>,
    containers: DashMap<String, VmHandle>,
}

impl VmBackend {
    pub fn new(vm: Arc<VmManager>) -> Self {
        Self {
            vm,
            containers: DashMap::new(),
        }
    }

    fn map_err(e: crate::error::DaemonError) -> BackendError {
        match e.kind {
            crate::error::ErrorKind::Unavailable => BackendError::Unavailable(e.message),
            crate::error::ErrorKind::Timeout => BackendError::Timeout,
            crate::error::ErrorKind::NotFound => BackendError::NotFound(e.message),
            _ => BackendError::Other(e.message),
        }
    }
}

#[async_trait]
impl RuntimeBackend for VmBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Vm
    }

    async fn start(
        &self,
        spec: &ExecSpec,
        output: OutputCallback,
    ) -> BackendResult<StartedProcess> {
        // Boot on demand; the engine never talks to the provider directly
        self.vm
            .ensure_started()
            .await
            .map_err(|e| BackendError::Unavailable(e.message))?;

        self.vm
            .dispatch(AgentOp::CreateContainer { spec: spec.clone() })
            .await
            .map_err(Self::map_err)?;
        self.vm
            .dispatch(AgentOp::StartContainer {
                container_id: spec.id.clone(),
            })
            .await
            .map_err(Self::map_err)?;

        // The wait stream carries interleaved output chunks, then the exit
        let mut stream = self
            .vm
            .dispatch_stream(AgentOp::WaitContainer {
                container_id: spec.id.clone(),
            })
            .await
            .map_err(Self::map_err)?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let vm = self.vm.clone();
        let container_id = spec.id.clone();
        tokio::spawn(async move {
            loop {
                match stream.recv().await {
                    Some(message) => match message.kind {
                        AgentMessageKind::Stream => {
                            if let Some((stream_kind, data)) = message.decode_stream() {
                                output(stream_kind, &data);
                            }
                        }
                        AgentMessageKind::Exit => {
                            if let Some(exit) = message.decode_exit() {
                                let _ = exit_tx.send(Some(exit));
                            } else {
                                let _ = exit_tx.send(Some(ExitStatus::clean(255)));
                            }
                            return;
                        }
                        AgentMessageKind::Reply => {
                            // An error reply mid-wait means the guest is gone
                            if !message.ok {
                                warn!(
                                    "wait stream for {} failed: {:?}",
                                    container_id, message.error
                                );
                                vm.mark_lost();
                                let _ = exit_tx.send(Some(ExitStatus::lost_vm()));
                                return;
                            }
                        }
                    },
                    None => {
                        // Channel closed without a terminal message
                        vm.mark_lost();
                        let _ = exit_tx.send(Some(ExitStatus::lost_vm()));
                        return;
                    }
                }
            }
        });

        self.containers.insert(
            spec.id.clone(),
            VmHandle {
                exit_rx,
                stdin_open: spec.stdin_open,
            },
        );

        // In-guest pids are not host pids; the record carries none
        Ok(StartedProcess { pid: None })
    }

    async fn wait(&self, container_id: &str) -> BackendResult<ExitStatus> {
        let mut exit_rx = self
            .containers
            .get(container_id)
            .map(|h| h.exit_rx.clone())
            .ok_or_else(|| BackendError::NotFound(container_id.to_string()))?;

        loop {
            if let Some(exit) = *exit_rx.borrow() {
                return Ok(exit);
            }
            exit_rx
                .changed()
                .await
                .map_err(|_| BackendError::Other("wait watcher dropped".into()))?;
        }
    }

    async fn signal(&self, container_id: &str, signal: &str) -> BackendResult<()> {
        self.vm
            .dispatch(AgentOp::SignalContainer {
                container_id: container_id.to_string(),
                signal: signal.to_string(),
            })
            .await
            .map(|_| ())
            .map_err(Self::map_err)
    }

    async fn pause(&self, container_id: &str) -> BackendResult<()> {
        self.vm
            .dispatch(AgentOp::PauseContainer {
                container_id: container_id.to_string(),
            })
            .await
            .map(|_| ())
            .map_err(Self::map_err)
    }

    async fn resume(&self, container_id: &str) -> BackendResult<()> {
        self.vm
            .dispatch(AgentOp::ResumeContainer {
                container_id: container_id.to_string(),
            })
            .await
            .map(|_| ())
            .map_err(Self::map_err)
    }

    async fn exec(
        &self,
        container_id: &str,
        command: Vec<String>,
        env: Vec<String>,
        tty: bool,
    ) -> BackendResult<ExecSession> {
        let mut stream = self
            .vm
            .dispatch_stream(AgentOp::ExecContainer {
                container_id: container_id.to_string(),
                command,
                env,
                tty,
            })
            .await
            .map_err(Self::map_err)?;

        let (out_tx, out_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let mut exit_sender = Some(exit_tx);
            while let Some(message) = stream.recv().await {
                match message.kind {
                    AgentMessageKind::Stream => {
                        if let Some((stream_kind, data)) = message.decode_stream() {
                            if out_tx
                                .send((stream_kind, Bytes::from(data)))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    AgentMessageKind::Exit => {
                        if let (Some(tx), Some(exit)) = (exit_sender.take(), message.decode_exit())
                        {
                            let _ = tx.send(exit);
                        }
                        break;
                    }
                    AgentMessageKind::Reply => {
                        if !message.ok {
                            if let Some(tx) = exit_sender.take() {
                                let _ = tx.send(ExitStatus::lost_vm());
                            }
                            break;
                        }
                    }
                }
            }
        });

        Ok(ExecSession {
            stdin: None,
            output: out_rx,
            exit: exit_rx,
        })
    }

    async fn attach_stdin(&self, container_id: &str) -> BackendResult<mpsc::Sender<Bytes>> {
        let stdin_open = self
            .containers
            .get(container_id)
            .map(|h| h.stdin_open)
            .ok_or_else(|| BackendError::NotFound(container_id.to_string()))?;
        if !stdin_open {
            return Err(BackendError::Other("stdin not open".into()));
        }

        // Forward chunks as agent stdin ops
        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        let vm = self.vm.clone();
        let container_id = container_id.to_string();
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&chunk);
                if vm
                    .dispatch(AgentOp::ContainerStdin {
                        container_id: container_id.clone(),
                        data_b64: encoded,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(tx)
    }

    async fn stats(&self, container_id: &str) -> BackendResult<ContainerStats> {
        let reply = self
            .vm
            .dispatch(AgentOp::ContainerStats {
                container_id: container_id.to_string(),
            })
            .await
            .map_err(Self::map_err)?;

        serde_json::from_value(reply.payload)
            .map_err(|e| BackendError::Other(format!("bad stats payload: {}", e)))
    }

    async fn is_alive(&self, container_id: &str, _pid: Option<u32>) -> BackendResult<bool> {
        match self
            .vm
            .dispatch(AgentOp::InspectContainer {
                container_id: container_id.to_string(),
            })
            .await
        {
            Ok(reply) => Ok(reply
                .payload
                .get("running")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)),
            Err(_) => Ok(false),
        }
    }

    async fn update_resources(
        &self,
        container_id: &str,
        resources: &ResourceLimits,
    ) -> BackendResult<()> {
        self.vm
            .dispatch(AgentOp::UpdateResources {
                container_id: container_id.to_string(),
                resources: resources.clone(),
            })
            .await
            .map(|_| ())
            .map_err(Self::map_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::vm::providers::DevelopmentProvider;
    use crate::vm::provider::VmInstanceConfig;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn vm_backend(temp: &TempDir) -> (VmBackend, Arc<DevelopmentProvider>) {
        let provider = Arc::new(DevelopmentProvider::new(temp.path().to_path_buf()));
        let manager = Arc::new(VmManager::new(
            provider.clone(),
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
        ));
        (VmBackend::new(manager), provider)
    }

    fn spec(id: &str, command: &[&str]) -> ExecSpec {
        ExecSpec {
            id: id.into(),
            rootfs: PathBuf::new(),
            command: command.iter().map(|s| s.to_string()).collect(),
            env: vec![],
            working_dir: None,
            user: None,
            tty: false,
            stdin_open: false,
            mounts: vec![],
            resources: Default::default(),
            network: Default::default(),
            capabilities: vec![],
            privileged: false,
            seccomp_profile: None,
            apparmor_profile: None,
            labels: Default::default(),
        }
    }

    fn collecting_callback() -> (OutputCallback, Arc<Mutex<Vec<u8>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        let callback: OutputCallback = Arc::new(move |_stream, data: &[u8]| {
            sink.lock().extend_from_slice(data);
        });
        (callback, collected)
    }

    #[tokio::test]
    async fn test_echo_through_vm() {
        let temp = TempDir::new().unwrap();
        let (backend, _provider) = vm_backend(&temp);
        let (callback, collected) = collecting_callback();

        backend
            .start(&spec("c1", &["echo", "hello"]), callback)
            .await
            .unwrap();

        let exit = backend.wait("c1").await.unwrap();
        assert_eq!(exit.exit_code, 0);
        assert!(!exit.vm_lost);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(String::from_utf8_lossy(&collected.lock()), "hello\n");
    }

    #[tokio::test]
    async fn test_vm_crash_yields_vm_lost_exit() {
        let temp = TempDir::new().unwrap();
        let (backend, provider) = vm_backend(&temp);
        let (callback, _) = collecting_callback();

        backend
            .start(&spec("c2", &["sleep", "3600"]), callback)
            .await
            .unwrap();

        provider.simulate_crash();

        let exit = backend.wait("c2").await.unwrap();
        assert_eq!(exit.exit_code, 255);
        assert!(exit.vm_lost);
    }

    #[tokio::test]
    async fn test_exec_in_vm() {
        let temp = TempDir::new().unwrap();
        let (backend, _provider) = vm_backend(&temp);
        let (callback, _) = collecting_callback();

        backend
            .start(&spec("c3", &["sleep", "3600"]), callback)
            .await
            .unwrap();

        let mut session = backend
            .exec("c3", vec!["echo".into(), "inside".into()], vec![], false)
            .await
            .unwrap();

        let mut output = Vec::new();
        while let Some((_, chunk)) = session.output.recv().await {
            output.extend_from_slice(&chunk);
        }
        let exit = session.exit.await.unwrap();
        assert_eq!(exit.exit_code, 0);
        assert_eq!(String::from_utf8_lossy(&output), "inside\n");
    }
}
