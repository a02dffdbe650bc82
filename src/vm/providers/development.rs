//! Universal development provider
//!
//! Simulates VM behavior on any platform without a hypervisor: running
//! state is tracked on disk, containers live in an in-memory map, and every
//! operation answers with deterministic success. A tiny command interpreter
//! gives lifecycle tests observable output and exit codes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::backend::{ExecSpec, ExitStatus, StdStream};
use crate::vm::agent::{AgentMessage, AgentOp, AgentRequest};
use crate::vm::provider::{
    ProviderKind, VmError, VmInstanceConfig, VmProvider, VmResult, VmState,
};

const DEV_VM_ID: &str = "servin-dev";

/// A simulated in-guest container
struct SimContainer {
    spec: ExecSpec,
    started: bool,
    paused: bool,
    /// Ordered captured output
    logs: Vec<(StdStream, Vec<u8>)>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
}

impl SimContainer {
    fn new(spec: ExecSpec) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            spec,
            started: false,
            paused: false,
            logs: Vec::new(),
            exit_tx,
            exit_rx,
        }
    }

    fn exited(&self) -> Option<ExitStatus> {
        *self.exit_rx.borrow()
    }
}

/// What the interpreter decides a command does
enum SimOutcome {
    /// Emit output then exit immediately
    Exit {
        output: Vec<(StdStream, Vec<u8>)>,
        status: ExitStatus,
    },

    /// Keep running; optionally auto-exit after a delay
    Run { auto_exit_secs: Option<u64> },
}

/// Deterministic interpretation of a container command.
///
/// Enough surface for lifecycle tests: echo writes its arguments, `sh -c
/// "exit N"` yields N, sleep stays up, wget answers with a canned HTTP
/// response, and a configured memory limit plus `SIMULATE_OOM=1` produces
/// the OOM exit.
fn interpret(spec: &ExecSpec) -> SimOutcome {
    let argv = &spec.command;
    let env_has = |needle: &str| spec.env.iter().any(|e| e == needle);

    if spec.resources.memory_bytes > 0 && env_has("SIMULATE_OOM=1") {
        return SimOutcome::Exit {
            output: vec![],
            status: ExitStatus {
                exit_code: 137,
                oom_killed: true,
                vm_lost: false,
            },
        };
    }

    match argv.first().map(String::as_str) {
        Some("echo") => {
            let mut line = argv[1..].join(" ").into_bytes();
            line.push(b'\n');
            SimOutcome::Exit {
                output: vec![(StdStream::Stdout, line)],
                status: ExitStatus {
                    exit_code: 0,
                    oom_killed: false,
                    vm_lost: false,
                },
            }
        }
        Some("wget") => SimOutcome::Exit {
            output: vec![(
                StdStream::Stdout,
                b"HTTP/1.1 200 OK\n<html><body>servin</body></html>\n".to_vec(),
            )],
            status: ExitStatus {
                exit_code: 0,
                oom_killed: false,
                vm_lost: false,
            },
        },
        Some("sleep") => {
            let secs = argv.get(1).and_then(|s| s.parse().ok()).unwrap_or(3600);
            SimOutcome::Run {
                auto_exit_secs: Some(secs),
            }
        }
        Some("sh") if argv.get(1).map(String::as_str) == Some("-c") => {
            let script = argv.get(2).map(String::as_str).unwrap_or("");
            if let Some(code) = script.strip_prefix("exit ").and_then(|s| s.trim().parse().ok()) {
                SimOutcome::Exit {
                    output: vec![],
                    status: ExitStatus {
                        exit_code: code,
                        oom_killed: false,
                        vm_lost: false,
                    },
                }
            } else if script.contains("while") || script.contains("sleep") {
                SimOutcome::Run {
                    auto_exit_secs: None,
                }
            } else {
                SimOutcome::Exit {
                    output: vec![],
                    status: ExitStatus {
                        exit_code: 0,
                        oom_killed: false,
                        vm_lost: false,
                    },
                }
            }
        }
        // Anything else: a long-running service
        _ => SimOutcome::Run {
            auto_exit_secs: None,
        },
    }
}

/// Development VM provider
pub struct DevelopmentProvider {
    /// Marker file directory; existence of `dev-vm-running` means Running
    state_dir: PathBuf,

    state: RwLock<VmState>,

    containers: Arc<Mutex<HashMap<String, SimContainer>>>,
}

impl DevelopmentProvider {
    pub fn new(state_dir: PathBuf) -> Self {
        let marker = state_dir.join("dev-vm-running");
        let state = if marker.exists() {
            VmState::Running
        } else {
            VmState::Stopped
        };

        Self {
            state_dir,
            state: RwLock::new(state),
            containers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn marker(&self) -> PathBuf {
        self.state_dir.join("dev-vm-running")
    }

    fn require_running(&self) -> VmResult<()> {
        if *self.state.read() != VmState::Running {
            return Err(VmError::NotRunning(DEV_VM_ID.into()));
        }
        Ok(())
    }

    /// Simulate killing the guest out from under the daemon. Test hook for
    /// VM-loss recovery.
    ///
    /// Dropping the container map severs every open wait stream the way a
    /// dead hypervisor severs the agent connection; waiters observe an error
    /// rather than an exit.
    pub fn simulate_crash(&self) {
        *self.state.write() = VmState::Failed;
        let _ = std::fs::remove_file(self.marker());
        self.containers.lock().clear();
    }

    fn handle_signal(container: &mut SimContainer, signal: &str) {
        let ignores_term = container
            .spec
            .env
            .iter()
            .any(|e| e == "IGNORE_SIGTERM=1");

        let number = crate::backend::parse_signal(signal).unwrap_or(15);
        match number {
            9 => {
                let _ = container.exit_tx.send(Some(ExitStatus {
                    exit_code: 137,
                    oom_killed: false,
                    vm_lost: false,
                }));
            }
            15 if !ignores_term => {
                let _ = container.exit_tx.send(Some(ExitStatus {
                    exit_code: 143,
                    oom_killed: false,
                    vm_lost: false,
                }));
            }
            15 => debug!("simulated container ignores SIGTERM"),
            _ => {}
        }
    }

    fn start_container(&self, container_id: &str) -> VmResult<()> {
        let mut containers = self.containers.lock();
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| VmError::Protocol(format!("no such container: {}", container_id)))?;

        if container.started && container.exited().is_none() {
            return Err(VmError::Protocol(format!(
                "container already running: {}",
                container_id
            )));
        }

        // Restarted containers get a fresh exit channel
        if container.exited().is_some() {
            let (exit_tx, exit_rx) = watch::channel(None);
            container.exit_tx = exit_tx;
            container.exit_rx = exit_rx;
            container.logs.clear();
        }
        container.started = true;

        match interpret(&container.spec) {
            SimOutcome::Exit { output, status } => {
                for chunk in &output {
                    container.logs.push(chunk.clone());
                }
                let _ = container.exit_tx.send(Some(status));
            }
            SimOutcome::Run { auto_exit_secs } => {
                if let Some(secs) = auto_exit_secs {
                    let exit_tx = container.exit_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
                        let _ = exit_tx.send(Some(ExitStatus {
                            exit_code: 0,
                            oom_killed: false,
                            vm_lost: false,
                        }));
                    });
                }
            }
        }

        Ok(())
    }

    fn container_json(container: &SimContainer) -> serde_json::Value {
        let exit = container.exited();
        json!({
            "id": container.spec.id,
            "running": container.started && exit.is_none(),
            "paused": container.paused,
            "exit_code": exit.map(|e| e.exit_code),
            "oom_killed": exit.map(|e| e.oom_killed).unwrap_or(false),
        })
    }

    fn handle(&self, request: &AgentRequest) -> VmResult<AgentMessage> {
        match &request.op {
            AgentOp::Ping => Ok(AgentMessage::reply(
                &request.id,
                json!({"version": env!("CARGO_PKG_VERSION"), "provider": "development"}),
            )),

            AgentOp::CreateContainer { spec } => {
                let mut containers = self.containers.lock();
                containers.insert(spec.id.clone(), SimContainer::new(spec.clone()));
                Ok(AgentMessage::reply(&request.id, json!({"id": spec.id})))
            }

            AgentOp::StartContainer { container_id } => {
                self.start_container(container_id)?;
                Ok(AgentMessage::reply(&request.id, json!({})))
            }

            AgentOp::SignalContainer {
                container_id,
                signal,
            } => {
                let mut containers = self.containers.lock();
                let container = containers.get_mut(container_id).ok_or_else(|| {
                    VmError::Protocol(format!("no such container: {}", container_id))
                })?;
                Self::handle_signal(container, signal);
                Ok(AgentMessage::reply(&request.id, json!({})))
            }

            AgentOp::PauseContainer { container_id } => {
                let mut containers = self.containers.lock();
                let container = containers.get_mut(container_id).ok_or_else(|| {
                    VmError::Protocol(format!("no such container: {}", container_id))
                })?;
                container.paused = true;
                Ok(AgentMessage::reply(&request.id, json!({})))
            }

            AgentOp::ResumeContainer { container_id } => {
                let mut containers = self.containers.lock();
                let container = containers.get_mut(container_id).ok_or_else(|| {
                    VmError::Protocol(format!("no such container: {}", container_id))
                })?;
                container.paused = false;
                Ok(AgentMessage::reply(&request.id, json!({})))
            }

            AgentOp::RemoveContainer { container_id } => {
                self.containers.lock().remove(container_id);
                Ok(AgentMessage::reply(&request.id, json!({})))
            }

            AgentOp::InspectContainer { container_id } => {
                let containers = self.containers.lock();
                let container = containers.get(container_id).ok_or_else(|| {
                    VmError::Protocol(format!("no such container: {}", container_id))
                })?;
                Ok(AgentMessage::reply(
                    &request.id,
                    Self::container_json(container),
                ))
            }

            AgentOp::ListContainers => {
                let containers = self.containers.lock();
                let list: Vec<_> = containers.values().map(Self::container_json).collect();
                Ok(AgentMessage::reply(&request.id, json!({"containers": list})))
            }

            AgentOp::FetchLogs { container_id, tail } => {
                let containers = self.containers.lock();
                let container = containers.get(container_id).ok_or_else(|| {
                    VmError::Protocol(format!("no such container: {}", container_id))
                })?;
                let chunks: Vec<_> = container
                    .logs
                    .iter()
                    .map(|(stream, data)| {
                        json!({
                            "stream": stream,
                            "data_b64": base64::Engine::encode(
                                &base64::engine::general_purpose::STANDARD,
                                data,
                            ),
                        })
                    })
                    .collect();
                let chunks = match tail {
                    Some(n) => chunks[chunks.len().saturating_sub(*n)..].to_vec(),
                    None => chunks,
                };
                Ok(AgentMessage::reply(&request.id, json!({"chunks": chunks})))
            }

            AgentOp::ContainerStats { container_id } => {
                let containers = self.containers.lock();
                let container = containers.get(container_id).ok_or_else(|| {
                    VmError::Protocol(format!("no such container: {}", container_id))
                })?;
                // Synthetic but stable numbers
                Ok(AgentMessage::reply(
                    &request.id,
                    json!({
                        "memory_bytes": 8 << 20,
                        "memory_limit_bytes": container.spec.resources.memory_bytes,
                        "cpu_nanos": 1_000_000u64,
                        "pids": 1,
                    }),
                ))
            }

            AgentOp::UpdateResources { container_id, .. } => {
                let containers = self.containers.lock();
                if !containers.contains_key(container_id) {
                    return Err(VmError::Protocol(format!(
                        "no such container: {}",
                        container_id
                    )));
                }
                Ok(AgentMessage::reply(&request.id, json!({})))
            }

            AgentOp::ContainerStdin { container_id, .. } => {
                let containers = self.containers.lock();
                if !containers.contains_key(container_id) {
                    return Err(VmError::Protocol(format!(
                        "no such container: {}",
                        container_id
                    )));
                }
                Ok(AgentMessage::reply(&request.id, json!({})))
            }

            AgentOp::WaitContainer { .. } | AgentOp::ExecContainer { .. } => Err(
                VmError::Protocol("streaming op sent to unary dispatch".into()),
            ),
        }
    }
}

#[async_trait]
impl VmProvider for DevelopmentProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Development
    }

    async fn create(&self, config: &VmInstanceConfig) -> VmResult<String> {
        debug!(
            "development VM created: {} cpus, {} MB",
            config.cpus, config.memory_mb
        );
        Ok(DEV_VM_ID.to_string())
    }

    async fn start(&self, vm_id: &str) -> VmResult<()> {
        if *self.state.read() == VmState::Running {
            // Idempotent
            return Ok(());
        }
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::write(self.marker(), b"")?;
        *self.state.write() = VmState::Running;
        info!("development VM {} started", vm_id);
        Ok(())
    }

    async fn stop(&self, vm_id: &str, _graceful: bool) -> VmResult<()> {
        if *self.state.read() == VmState::Stopped {
            // Idempotent
            return Ok(());
        }
        let _ = std::fs::remove_file(self.marker());
        *self.state.write() = VmState::Stopped;
        self.containers.lock().clear();
        info!("development VM {} stopped", vm_id);
        Ok(())
    }

    async fn destroy(&self, vm_id: &str) -> VmResult<()> {
        self.stop(vm_id, false).await
    }

    async fn status(&self, _vm_id: &str) -> VmResult<VmState> {
        Ok(*self.state.read())
    }

    async fn dispatch(&self, _vm_id: &str, request: AgentRequest) -> VmResult<AgentMessage> {
        self.require_running()?;
        self.handle(&request)
    }

    async fn dispatch_stream(
        &self,
        _vm_id: &str,
        request: AgentRequest,
    ) -> VmResult<mpsc::Receiver<AgentMessage>> {
        self.require_running()?;

        let (tx, rx) = mpsc::channel(64);
        match &request.op {
            AgentOp::WaitContainer { container_id } => {
                let (mut exit_rx, chunks) = {
                    let containers = self.containers.lock();
                    let container = containers.get(container_id).ok_or_else(|| {
                        VmError::Protocol(format!("no such container: {}", container_id))
                    })?;
                    (container.exit_rx.clone(), container.logs.clone())
                };

                let request_id = request.id.clone();
                tokio::spawn(async move {
                    // Captured output precedes the exit on the wait stream
                    for (stream, data) in chunks {
                        if tx
                            .send(AgentMessage::stream(&request_id, stream, &data))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }

                    loop {
                        let current = *exit_rx.borrow();
                        if let Some(exit) = current {
                            let _ = tx
                                .send(AgentMessage::exit(
                                    &request_id,
                                    exit.exit_code,
                                    exit.oom_killed,
                                ))
                                .await;
                            return;
                        }
                        if exit_rx.changed().await.is_err() {
                            // Simulated VM went away mid-wait
                            let _ = tx
                                .send(AgentMessage::error(&request_id, "vm connection lost"))
                                .await;
                            return;
                        }
                    }
                });
            }

            AgentOp::ExecContainer {
                container_id,
                command,
                ..
            } => {
                {
                    let containers = self.containers.lock();
                    let container = containers.get(container_id).ok_or_else(|| {
                        VmError::Protocol(format!("no such container: {}", container_id))
                    })?;
                    if container.exited().is_some() {
                        return Err(VmError::Protocol(format!(
                            "container not running: {}",
                            container_id
                        )));
                    }
                }

                // Reuse the interpreter on a synthetic spec
                let mut spec = ExecSpec {
                    command: command.clone(),
                    ..empty_spec(container_id)
                };
                spec.id = format!("exec-{}", container_id);

                let request_id = request.id.clone();
                tokio::spawn(async move {
                    match interpret(&spec) {
                        SimOutcome::Exit { output, status } => {
                            for (stream, data) in output {
                                let _ = tx
                                    .send(AgentMessage::stream(&request_id, stream, &data))
                                    .await;
                            }
                            let _ = tx
                                .send(AgentMessage::exit(
                                    &request_id,
                                    status.exit_code,
                                    status.oom_killed,
                                ))
                                .await;
                        }
                        SimOutcome::Run { .. } => {
                            // Exec of a long-running command just succeeds
                            let _ = tx.send(AgentMessage::exit(&request_id, 0, false)).await;
                        }
                    }
                });
            }

            _ => {
                return Err(VmError::Protocol(
                    "unary op sent to streaming dispatch".into(),
                ))
            }
        }

        Ok(rx)
    }
}

fn empty_spec(id: &str) -> ExecSpec {
    ExecSpec {
        id: id.to_string(),
        rootfs: PathBuf::new(),
        command: vec![],
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(id: &str, command: &[&str]) -> ExecSpec {
        ExecSpec {
            command: command.iter().map(|s| s.to_string()).collect(),
            ..empty_spec(id)
        }
    }

    async fn running_provider(temp: &TempDir) -> DevelopmentProvider {
        let provider = DevelopmentProvider::new(temp.path().to_path_buf());
        let vm = provider
            .create(&VmInstanceConfig {
                cpus: 1,
                memory_mb: 512,
                disk_gb: 4,
                ssh_port: 0,
                agent_port: 0,
                base_image_path: None,
            })
            .await
            .unwrap();
        provider.start(&vm).await.unwrap();
        provider
    }

    #[tokio::test]
    async fn test_idempotent_start_stop() {
        let temp = TempDir::new().unwrap();
        let provider = running_provider(&temp).await;

        provider.start(DEV_VM_ID).await.unwrap();
        assert_eq!(provider.status(DEV_VM_ID).await.unwrap(), VmState::Running);
        assert!(temp.path().join("dev-vm-running").exists());

        provider.stop(DEV_VM_ID, true).await.unwrap();
        provider.stop(DEV_VM_ID, true).await.unwrap();
        assert_eq!(provider.status(DEV_VM_ID).await.unwrap(), VmState::Stopped);
        assert!(!temp.path().join("dev-vm-running").exists());
    }

    #[tokio::test]
    async fn test_marker_survives_restart() {
        let temp = TempDir::new().unwrap();
        {
            let provider = running_provider(&temp).await;
            assert_eq!(provider.status(DEV_VM_ID).await.unwrap(), VmState::Running);
        }

        // A fresh provider adopts the on-disk running state
        let provider = DevelopmentProvider::new(temp.path().to_path_buf());
        assert_eq!(provider.status(DEV_VM_ID).await.unwrap(), VmState::Running);
    }

    #[tokio::test]
    async fn test_echo_exits_with_logs() {
        let temp = TempDir::new().unwrap();
        let provider = running_provider(&temp).await;

        provider
            .dispatch(
                DEV_VM_ID,
                AgentRequest::new(AgentOp::CreateContainer {
                    spec: spec("c1", &["echo", "hello"]),
                }),
            )
            .await
            .unwrap();
        provider
            .dispatch(
                DEV_VM_ID,
                AgentRequest::new(AgentOp::StartContainer {
                    container_id: "c1".into(),
                }),
            )
            .await
            .unwrap();

        let mut wait = provider
            .dispatch_stream(
                DEV_VM_ID,
                AgentRequest::new(AgentOp::WaitContainer {
                    container_id: "c1".into(),
                }),
            )
            .await
            .unwrap();
        let exit = wait.recv().await.unwrap().decode_exit().unwrap();
        assert_eq!(exit.exit_code, 0);

        let logs = provider
            .dispatch(
                DEV_VM_ID,
                AgentRequest::new(AgentOp::FetchLogs {
                    container_id: "c1".into(),
                    tail: None,
                }),
            )
            .await
            .unwrap();
        let chunks = logs.payload["chunks"].as_array().unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_sigterm_ignored_then_kill() {
        let temp = TempDir::new().unwrap();
        let provider = running_provider(&temp).await;

        let mut stubborn = spec("c2", &["sleep", "3600"]);
        stubborn.env.push("IGNORE_SIGTERM=1".into());

        provider
            .dispatch(
                DEV_VM_ID,
                AgentRequest::new(AgentOp::CreateContainer { spec: stubborn }),
            )
            .await
            .unwrap();
        provider
            .dispatch(
                DEV_VM_ID,
                AgentRequest::new(AgentOp::StartContainer {
                    container_id: "c2".into(),
                }),
            )
            .await
            .unwrap();

        provider
            .dispatch(
                DEV_VM_ID,
                AgentRequest::new(AgentOp::SignalContainer {
                    container_id: "c2".into(),
                    signal: "SIGTERM".into(),
                }),
            )
            .await
            .unwrap();

        let inspect = provider
            .dispatch(
                DEV_VM_ID,
                AgentRequest::new(AgentOp::InspectContainer {
                    container_id: "c2".into(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(inspect.payload["running"], true);

        provider
            .dispatch(
                DEV_VM_ID,
                AgentRequest::new(AgentOp::SignalContainer {
                    container_id: "c2".into(),
                    signal: "SIGKILL".into(),
                }),
            )
            .await
            .unwrap();

        let inspect = provider
            .dispatch(
                DEV_VM_ID,
                AgentRequest::new(AgentOp::InspectContainer {
                    container_id: "c2".into(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(inspect.payload["running"], false);
        assert_eq!(inspect.payload["exit_code"], 137);
    }

    #[tokio::test]
    async fn test_simulated_crash_fails_waits() {
        let temp = TempDir::new().unwrap();
        let provider = running_provider(&temp).await;

        provider
            .dispatch(
                DEV_VM_ID,
                AgentRequest::new(AgentOp::CreateContainer {
                    spec: spec("c3", &["sleep", "3600"]),
                }),
            )
            .await
            .unwrap();
        provider
            .dispatch(
                DEV_VM_ID,
                AgentRequest::new(AgentOp::StartContainer {
                    container_id: "c3".into(),
                }),
            )
            .await
            .unwrap();

        let mut wait = provider
            .dispatch_stream(
                DEV_VM_ID,
                AgentRequest::new(AgentOp::WaitContainer {
                    container_id: "c3".into(),
                }),
            )
            .await
            .unwrap();

        provider.simulate_crash();

        let message = wait.recv().await.unwrap();
        // Either the 255 exit recorded at crash time or a lost-connection error
        let crashed = message
            .decode_exit()
            .map(|e| e.exit_code == 255)
            .unwrap_or(!message.ok);
        assert!(crashed);
        assert_eq!(provider.status(DEV_VM_ID).await.unwrap(), VmState::Failed);
    }
}
