//! Container lifecycle engine
//!
//! Owns the container registry, the per-container operation gates, and
//! every lifecycle transition. Operations on distinct containers proceed
//! concurrently; per container they serialize through the gate. Every
//! state transition is persisted before the mutating call returns.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::backend::{
    ExecSession, ExecSpec, ExecutionMode, MountKind, MountSpec, NetworkSpec, OutputCallback,
    ResourceLimits, RuntimeBackend, StdStream,
};
use crate::config::RuntimeConfiguration;
use crate::error::{DaemonError, Result};
use crate::events::{EventBus, EventType};
use crate::image::ImageStore;
use crate::system::{atomic_write_json, new_entity_id, read_json, short_id};
use crate::volume::VolumeManager;

use super::container::{
    Container, ContainerConfig, ContainerNetwork, ContainerState, HealthStatus,
};
use super::gate::{LifecycleOp, OpGate};
use super::logs::LogWriter;
use super::supervisor;

/// Inputs to CreateContainer
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// User-facing name; generated from the id when absent
    pub name: Option<String>,

    /// Image reference (tag or id)
    pub image: String,

    pub config: ContainerConfig,

    pub mounts: Vec<MountSpec>,

    pub network: ContainerNetwork,

    /// Set when the container belongs to a pod
    pub sandbox_id: Option<String>,

    /// Namespace handle shared by the sandbox, when any
    pub network_namespace_handle: Option<String>,

    /// Explicit log file (CRI provides one); default is in the container dir
    pub log_path: Option<PathBuf>,
}

/// Live handle kept per registered container
pub(crate) struct ContainerHandle {
    pub record: RwLock<Container>,
    pub gate: OpGate,
    pub log: Arc<LogWriter>,
    pub state_tx: watch::Sender<ContainerState>,
    pub state_rx: watch::Receiver<ContainerState>,
}

impl ContainerHandle {
    pub fn set_state(&self, state: ContainerState) {
        self.record.write().state = state;
        let _ = self.state_tx.send(state);
    }
}

/// The lifecycle engine
pub struct ContainerEngine {
    containers_dir: PathBuf,

    registry: DashMap<String, Arc<ContainerHandle>>,

    /// name -> id
    names: DashMap<String, String>,

    images: Arc<ImageStore>,
    volumes: Arc<VolumeManager>,
    backend: Arc<dyn RuntimeBackend>,
    event_bus: EventBus,
    runtime: RuntimeConfiguration,

    /// Fixed at daemon start by provider selection
    execution_mode: ExecutionMode,

    /// Suppresses restart policies while the VM is lost
    restart_suppressed: std::sync::atomic::AtomicBool,
}

impl ContainerEngine {
    pub fn new(
        containers_dir: PathBuf,
        images: Arc<ImageStore>,
        volumes: Arc<VolumeManager>,
        backend: Arc<dyn RuntimeBackend>,
        event_bus: EventBus,
        runtime: RuntimeConfiguration,
        execution_mode: ExecutionMode,
    ) -> Self {
        Self {
            containers_dir,
            registry: DashMap::new(),
            names: DashMap::new(),
            images,
            volumes,
            backend,
            event_bus,
            runtime,
            execution_mode,
            restart_suppressed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &Arc<dyn RuntimeBackend> {
        &self.backend
    }

    pub fn events(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    /// Enter/leave the vm-lost window
    pub fn suppress_restarts(&self, suppress: bool) {
        self.restart_suppressed
            .store(suppress, std::sync::atomic::Ordering::SeqCst);
    }

    pub(crate) fn restarts_suppressed(&self) -> bool {
        self.restart_suppressed
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    // ========================================================================
    // Resolution and snapshots
    // ========================================================================

    pub(crate) fn resolve(&self, reference: &str) -> Result<Arc<ContainerHandle>> {
        // Exact id
        if let Some(handle) = self.registry.get(reference) {
            return Ok(handle.clone());
        }
        // Name
        if let Some(id) = self.names.get(reference) {
            if let Some(handle) = self.registry.get(id.value()) {
                return Ok(handle.clone());
            }
        }
        // Unambiguous id prefix
        if reference.len() >= 6 {
            let mut matches = self
                .registry
                .iter()
                .filter(|e| e.key().starts_with(reference));
            if let Some(first) = matches.next() {
                if matches.next().is_none() {
                    return Ok(first.value().clone());
                }
            }
        }
        Err(DaemonError::not_found("resolve_container", reference))
    }

    pub fn inspect(&self, reference: &str) -> Result<Container> {
        Ok(self.resolve(reference)?.record.read().clone())
    }

    /// Whether any Running or Paused container derives its rootfs from the
    /// image. Backs the image store's force-removal refusal.
    pub fn has_running_consumer(&self, image_id: &str) -> bool {
        self.registry.iter().any(|entry| {
            let record = entry.value().record.read();
            record.image_ref == image_id
                && matches!(
                    record.state,
                    ContainerState::Running | ContainerState::Paused
                )
        })
    }

    pub fn list(&self, all: bool) -> Vec<Container> {
        let mut records: Vec<Container> = self
            .registry
            .iter()
            .map(|e| e.value().record.read().clone())
            .filter(|c| {
                all || matches!(c.state, ContainerState::Running | ContainerState::Paused)
            })
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    fn container_dir(&self, id: &str) -> PathBuf {
        self.containers_dir.join(id)
    }

    pub(crate) fn persist(&self, record: &Container) -> Result<()> {
        atomic_write_json(&self.container_dir(&record.id).join("container.json"), record)
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Allocate id, rootfs and log file; no process starts.
    pub async fn create(&self, options: CreateOptions) -> Result<Container> {
        let image = self.images.inspect(&options.image).map_err(|mut e| {
            e.op = "create_container".into();
            e
        })?;

        // Resolve argv before touching disk
        let entrypoint = if !options.config.entrypoint.is_empty() {
            options.config.entrypoint.clone()
        } else {
            image.config.entrypoint.clone()
        };
        let cmd = if !options.config.cmd.is_empty() {
            options.config.cmd.clone()
        } else {
            image.config.cmd.clone()
        };
        let command: Vec<String> = entrypoint.into_iter().chain(cmd).collect();
        if command.is_empty() {
            return Err(DaemonError::invalid_argument(
                "create_container",
                "no command specified and the image has no default",
            ));
        }

        let id = new_entity_id();
        let name = match &options.name {
            Some(name) => {
                Self::validate_name(name)?;
                name.clone()
            }
            None => format!("servin-{}", short_id(&id)),
        };

        // Name reservation is the conflict gate
        if self.names.contains_key(&name) {
            return Err(DaemonError::conflict(
                "create_container",
                format!("name already in use: {}", name),
            )
            .with_id(name.clone()));
        }
        self.names.insert(name.clone(), id.clone());

        // Rollback guard: until disarmed, undo the reservation and any disk
        // state
        let container_dir = self.container_dir(&id);
        let cleanup_names = &self.names;
        let cleanup_name = name.clone();
        let cleanup_dir = container_dir.clone();
        let mut guard = scopeguard::guard(false, move |armed| {
            if !armed {
                cleanup_names.remove(&cleanup_name);
                let _ = std::fs::remove_dir_all(&cleanup_dir);
            }
        });

        std::fs::create_dir_all(&container_dir)?;

        // Volume mounts pin their volumes for the container lifetime
        let mut mounts = options.mounts.clone();
        for mount in &mut mounts {
            if mount.kind == MountKind::Volume {
                let volume = self.volumes.get_or_create(&mount.source)?;
                self.volumes.acquire(&volume.name)?;
            }
        }

        let rootfs_path = match self
            .images
            .allocate_rootfs(&image.id, &id, &container_dir)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                for mount in &mounts {
                    if mount.kind == MountKind::Volume {
                        let _ = self.volumes.release(&mount.source);
                    }
                }
                return Err(e);
            }
        };

        let log_path = options
            .log_path
            .clone()
            .unwrap_or_else(|| container_dir.join("container.log"));

        let mut network = options.network.clone();
        if let Some(sandbox_id) = &options.sandbox_id {
            // Members always share the sandbox namespace
            network.mode = format!("container:{}", sandbox_id);
        } else if network.mode.is_empty() {
            network.mode = "bridge".into();
        }

        let record = Container {
            id: id.clone(),
            names: vec![name.clone()],
            image_ref: image.id.clone(),
            image_name: options.image.clone(),
            state: ContainerState::Created,
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            oom_killed: false,
            dead: false,
            health_status: if options.config.health.is_some() {
                HealthStatus::Starting
            } else {
                HealthStatus::None
            },
            config: options.config.clone(),
            command,
            mounts,
            network,
            sandbox_id: options.sandbox_id.clone(),
            rootfs_path,
            log_path: log_path.clone(),
            execution_mode: self.execution_mode,
            pid: None,
            restart_count: 0,
            stop_requested: false,
            reason: None,
            network_namespace_handle: options.network_namespace_handle.clone(),
        };

        self.persist(&record)?;

        let log = Arc::new(LogWriter::open(&log_path, self.runtime.log_rotate_bytes)?);
        let (state_tx, state_rx) = watch::channel(ContainerState::Created);
        let handle = Arc::new(ContainerHandle {
            record: RwLock::new(record.clone()),
            gate: OpGate::new(),
            log,
            state_tx,
            state_rx,
        });
        self.registry.insert(id.clone(), handle);

        *guard = true; // disarm rollback

        info!("created container {} ({})", short_id(&id), name);
        self.event_bus
            .publish(crate::events::EventRecord::new(EventType::Container, "create", id.as_str())
                .with_attribute("name", name.as_str()));

        Ok(record)
    }

    fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name.len() <= 255
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && name
                .chars()
                .next()
                .map(|c| c.is_ascii_alphanumeric())
                .unwrap_or(false);
        if valid {
            Ok(())
        } else {
            Err(DaemonError::invalid_argument(
                "create_container",
                format!("invalid name: {}", name),
            ))
        }
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Start a created or stopped container and supervise it
    pub async fn start(self: &Arc<Self>, reference: &str) -> Result<()> {
        let handle = self.resolve(reference)?;
        let _guard = handle.gate.enter(LifecycleOp::Start).await;

        // Manual start clears explicit-stop intent and restart accounting
        {
            let mut record = handle.record.write();
            record.stop_requested = false;
            record.restart_count = 0;
            record.reason = None;
        }

        self.start_locked(&handle).await
    }

    /// Start with the gate already held. Restart-policy re-entry lands
    /// here too.
    pub(crate) async fn start_locked(self: &Arc<Self>, handle: &Arc<ContainerHandle>) -> Result<()> {
        let (id, spec) = {
            let record = handle.record.read();
            record.state.check_transition(
                ContainerState::Running,
                "start_container",
                &record.id,
            )?;
            (record.id.clone(), self.build_exec_spec(&record)?)
        };

        // Output flows through the single-writer log file
        let log = handle.log.clone();
        let output: OutputCallback = Arc::new(move |stream: StdStream, chunk: &[u8]| {
            log.write(stream, chunk);
        });

        let started = self.backend.start(&spec, output).await.map_err(|e| {
            // Start failures leave the container in its prior state
            warn!("start failed for {}: {}", short_id(&id), e);
            crate::error::DaemonError::from(e).with_id(id.clone())
        })?;

        {
            let mut record = handle.record.write();
            record.state = ContainerState::Running;
            record.started_at = Some(Utc::now());
            record.finished_at = None;
            record.exit_code = None;
            record.oom_killed = false;
            record.dead = false;
            // Once Running, the last state change is no longer an explicit
            // stop
            record.stop_requested = false;
            record.pid = started.pid;
            record.restart_count += 1;
            if record.config.health.is_some() {
                record.health_status = HealthStatus::Starting;
            }
            self.persist(&record)?;
        }
        let _ = handle.state_tx.send(ContainerState::Running);

        info!("started container {}", short_id(&id));
        self.event_bus.emit(EventType::Container, "start", &id);

        supervisor::spawn(self.clone(), handle.clone(), id);
        Ok(())
    }

    /// Construct the execution spec from the record and image metadata
    fn build_exec_spec(&self, record: &Container) -> Result<ExecSpec> {
        let image = self.images.inspect(&record.image_ref)?;

        let mut env = image.config.env.clone();
        env.extend(record.config.env.iter().cloned());

        // Volume sources resolve to their mountpoints at start time
        let mut mounts = Vec::with_capacity(record.mounts.len());
        for mount in &record.mounts {
            let mut resolved = mount.clone();
            if mount.kind == MountKind::Volume {
                let volume = self.volumes.inspect(&mount.source)?;
                resolved.source = volume.mountpoint.display().to_string();
            }
            mounts.push(resolved);
        }

        let working_dir = record
            .config
            .working_dir
            .clone()
            .or_else(|| {
                if image.config.working_dir.is_empty() {
                    None
                } else {
                    Some(image.config.working_dir.clone())
                }
            });

        let user = record.config.user.clone().or_else(|| {
            if image.config.user.is_empty() {
                None
            } else {
                Some(image.config.user.clone())
            }
        });

        Ok(ExecSpec {
            id: record.id.clone(),
            rootfs: record.rootfs_path.clone(),
            command: record.command.clone(),
            env,
            working_dir,
            user,
            tty: record.config.tty,
            stdin_open: record.config.stdin_open,
            mounts,
            resources: record.config.resources.clone(),
            network: NetworkSpec {
                mode: record.network.mode.clone(),
                namespace_handle: record.network_namespace_handle.clone(),
                dns: record.config.dns.clone(),
                hostname: record.config.hostname.clone(),
            },
            capabilities: record.config.capabilities.clone(),
            privileged: record.config.privileged,
            seccomp_profile: record.config.seccomp_profile.clone(),
            apparmor_profile: record.config.apparmor_profile.clone(),
            labels: record.config.labels.clone(),
        })
    }

    // ========================================================================
    // Stop / kill / pause
    // ========================================================================

    /// Graceful stop: termination signal, then SIGKILL after the timeout.
    /// `timeout` zero skips straight to SIGKILL.
    pub async fn stop(&self, reference: &str, timeout: Option<u64>) -> Result<()> {
        let handle = self.resolve(reference)?;
        let _guard = handle.gate.enter(LifecycleOp::Stop).await;

        let (id, stop_signal) = {
            let mut record = handle.record.write();
            record
                .state
                .check_transition(ContainerState::Stopped, "stop_container", &record.id)?;
            record.stop_requested = true;
            self.persist(&record)?;
            (
                record.id.clone(),
                record
                    .config
                    .stop_signal
                    .clone()
                    .unwrap_or_else(|| "SIGTERM".into()),
            )
        };

        let timeout = timeout
            .or({
                let record = handle.record.read();
                record.config.stop_timeout
            })
            .unwrap_or(self.runtime.stop_timeout);

        if timeout == 0 {
            // Immediate SIGKILL, no SIGTERM phase
            self.backend.signal(&id, "SIGKILL").await.map_err(DaemonError::from)?;
        } else {
            self.backend
                .signal(&id, &stop_signal)
                .await
                .map_err(DaemonError::from)?;

            let waited = tokio::time::timeout(
                Duration::from_secs(timeout),
                self.backend.wait(&id),
            )
            .await;

            if waited.is_err() {
                info!(
                    "container {} ignored {} for {}s, sending SIGKILL",
                    short_id(&id),
                    stop_signal,
                    timeout
                );
                self.backend.signal(&id, "SIGKILL").await.map_err(DaemonError::from)?;
            }
        }

        // The supervisor records the exit; wait for it so stop returns with
        // the container in a stable state
        self.await_state(&handle, ContainerState::Stopped).await;

        info!("stopped container {}", short_id(&id));
        self.event_bus.emit(EventType::Container, "stop", &id);
        Ok(())
    }

    /// Deliver a signal. SIGKILL also marks explicit stop intent and waits
    /// for the exit.
    pub async fn kill(&self, reference: &str, signal: Option<&str>) -> Result<()> {
        let handle = self.resolve(reference)?;
        // Kill never queues behind another operation; it reports the
        // conflict instead
        let _guard = handle
            .gate
            .try_enter(LifecycleOp::Kill)
            .map_err(|busy| DaemonError::conflict("kill_container", busy.to_string()))?;

        let signal = signal.unwrap_or("SIGKILL");
        let fatal = matches!(crate::backend::parse_signal(signal), Some(9));

        let id = {
            let mut record = handle.record.write();
            record
                .state
                .check_transition(ContainerState::Stopped, "kill_container", &record.id)?;
            if fatal {
                record.stop_requested = true;
                self.persist(&record)?;
            }
            record.id.clone()
        };

        self.backend.signal(&id, signal).await.map_err(DaemonError::from)?;

        if fatal {
            self.await_state(&handle, ContainerState::Stopped).await;
        }

        self.event_bus.emit(EventType::Container, "kill", &id);
        Ok(())
    }

    pub async fn pause(&self, reference: &str) -> Result<()> {
        let handle = self.resolve(reference)?;
        let _guard = handle.gate.enter(LifecycleOp::Pause).await;

        let id = {
            let record = handle.record.read();
            record
                .state
                .check_transition(ContainerState::Paused, "pause_container", &record.id)?;
            record.id.clone()
        };

        self.backend.pause(&id).await.map_err(DaemonError::from)?;

        handle.set_state(ContainerState::Paused);
        self.persist(&handle.record.read())?;
        self.event_bus.emit(EventType::Container, "pause", &id);
        Ok(())
    }

    pub async fn unpause(&self, reference: &str) -> Result<()> {
        let handle = self.resolve(reference)?;
        let _guard = handle.gate.enter(LifecycleOp::Unpause).await;

        let id = {
            let record = handle.record.read();
            if record.state != ContainerState::Paused {
                return Err(DaemonError::invalid_state(
                    "unpause_container",
                    format!("cannot go from {} to running", record.state),
                )
                .with_id(record.id.clone()));
            }
            record.id.clone()
        };

        self.backend.resume(&id).await.map_err(DaemonError::from)?;

        handle.set_state(ContainerState::Running);
        self.persist(&handle.record.read())?;
        self.event_bus.emit(EventType::Container, "unpause", &id);
        Ok(())
    }

    // ========================================================================
    // Remove / rename / wait
    // ========================================================================

    /// Remove a container. Requires Stopped or Created unless `force`, which
    /// kills first.
    pub async fn remove(&self, reference: &str, force: bool) -> Result<()> {
        let handle = self.resolve(reference)?;
        let _guard = handle.gate.enter(LifecycleOp::Remove).await;

        let (id, state) = {
            let record = handle.record.read();
            (record.id.clone(), record.state)
        };

        match state {
            ContainerState::Running | ContainerState::Paused => {
                if !force {
                    return Err(DaemonError::invalid_state(
                        "remove_container",
                        format!("container is {}; stop it first or use force", state),
                    )
                    .with_id(id.clone()));
                }
                {
                    let mut record = handle.record.write();
                    record.stop_requested = true;
                    self.persist(&record)?;
                }
                let _ = self.backend.signal(&id, "SIGKILL").await;
                self.await_state(&handle, ContainerState::Stopped).await;
            }
            ContainerState::Removing => {
                return Err(DaemonError::conflict(
                    "remove_container",
                    "removal already in progress",
                )
                .with_id(id.clone()));
            }
            _ => {}
        }

        handle.set_state(ContainerState::Removing);

        let record = handle.record.read().clone();
        for mount in &record.mounts {
            if mount.kind == MountKind::Volume {
                let _ = self.volumes.release(&mount.source);
            }
        }
        let _ = self.images.release_rootfs(&record.image_ref);

        std::fs::remove_dir_all(self.container_dir(&id))?;

        for name in &record.names {
            self.names.remove(name);
        }
        self.registry.remove(&id);

        info!("removed container {}", short_id(&id));
        self.event_bus.emit(EventType::Container, "destroy", &id);
        Ok(())
    }

    pub fn rename(&self, reference: &str, new_name: &str) -> Result<()> {
        Self::validate_name(new_name)?;
        let handle = self.resolve(reference)?;

        if self.names.contains_key(new_name) {
            return Err(DaemonError::conflict(
                "rename_container",
                format!("name already in use: {}", new_name),
            ));
        }

        let mut record = handle.record.write();
        let old_names = std::mem::replace(&mut record.names, vec![new_name.to_string()]);
        self.names.insert(new_name.to_string(), record.id.clone());
        for name in old_names {
            self.names.remove(&name);
        }
        self.persist(&record)?;
        Ok(())
    }

    /// Block until the container reaches Stopped; returns the exit code
    pub async fn wait(&self, reference: &str) -> Result<i64> {
        let handle = self.resolve(reference)?;
        self.await_state(&handle, ContainerState::Stopped).await;
        let record = handle.record.read();
        Ok(record.exit_code.unwrap_or(255))
    }

    async fn await_state(&self, handle: &Arc<ContainerHandle>, wanted: ContainerState) {
        let mut rx = handle.state_rx.clone();
        loop {
            if *rx.borrow() == wanted {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // ========================================================================
    // Exec / attach / stats / logs
    // ========================================================================

    pub async fn exec(
        &self,
        reference: &str,
        command: Vec<String>,
        env: Vec<String>,
        tty: bool,
    ) -> Result<ExecSession> {
        let handle = self.resolve(reference)?;
        let id = {
            let record = handle.record.read();
            if record.state != ContainerState::Running {
                return Err(DaemonError::invalid_state(
                    "exec_container",
                    format!("container is {}", record.state),
                )
                .with_id(record.id.clone()));
            }
            record.id.clone()
        };

        if command.is_empty() {
            return Err(DaemonError::invalid_argument("exec_container", "empty command"));
        }

        self.backend
            .exec(&id, command, env, tty)
            .await
            .map_err(|e| DaemonError::from(e).with_id(id))
    }

    /// Run a command to completion, collecting output
    pub async fn exec_sync(
        &self,
        reference: &str,
        command: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<(i64, Vec<u8>, Vec<u8>)> {
        let mut session = self.exec(reference, command, vec![], false).await?;

        let collect = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            while let Some((stream, chunk)) = session.output.recv().await {
                match stream {
                    StdStream::Stdout => stdout.extend_from_slice(&chunk),
                    StdStream::Stderr => stderr.extend_from_slice(&chunk),
                }
            }
            let exit = session.exit.await.map(|e| e.exit_code).unwrap_or(255);
            (exit, stdout, stderr)
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, collect)
                .await
                .map_err(|_| DaemonError::timeout("exec_sync", "deadline exceeded")),
            None => Ok(collect.await),
        }
    }

    /// Log-record fan-out plus optional stdin for attach
    pub async fn attach(
        &self,
        reference: &str,
    ) -> Result<(
        tokio::sync::broadcast::Receiver<super::logs::LogRecord>,
        Option<tokio::sync::mpsc::Sender<bytes::Bytes>>,
    )> {
        let handle = self.resolve(reference)?;
        let (id, stdin_open) = {
            let record = handle.record.read();
            if record.state != ContainerState::Running {
                return Err(DaemonError::invalid_state(
                    "attach_container",
                    format!("container is {}", record.state),
                )
                .with_id(record.id.clone()));
            }
            (record.id.clone(), record.config.stdin_open)
        };

        let output = handle.log.followers().follow();
        let stdin = if stdin_open {
            Some(
                self.backend
                    .attach_stdin(&id)
                    .await
                    .map_err(DaemonError::from)?,
            )
        } else {
            None
        };
        Ok((output, stdin))
    }

    pub async fn stats(&self, reference: &str) -> Result<crate::backend::ContainerStats> {
        let handle = self.resolve(reference)?;
        let id = handle.record.read().id.clone();
        self.backend.stats(&id).await.map_err(DaemonError::from)
    }

    pub async fn update_resources(
        &self,
        reference: &str,
        resources: ResourceLimits,
    ) -> Result<()> {
        let handle = self.resolve(reference)?;
        let id = {
            let mut record = handle.record.write();
            record.config.resources = resources.clone();
            self.persist(&record)?;
            record.id.clone()
        };

        // Only a running container has anything to update live
        if handle.record.read().state == ContainerState::Running {
            self.backend
                .update_resources(&id, &resources)
                .await
                .map_err(DaemonError::from)?;
        }
        Ok(())
    }

    /// Follow a container's log records as they land
    pub fn follow_logs(
        &self,
        reference: &str,
    ) -> Result<tokio::sync::broadcast::Receiver<super::logs::LogRecord>> {
        Ok(self.resolve(reference)?.log.followers().follow())
    }

    // ========================================================================
    // Live-restore and shutdown
    // ========================================================================

    /// Rehydrate records from disk. Containers persisted as Running are
    /// probed; live ones are adopted, dead ones are marked stopped with the
    /// supervisor-loss record.
    pub async fn load_state(self: &Arc<Self>) -> Result<usize> {
        if !self.containers_dir.exists() {
            return Ok(0);
        }

        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.containers_dir)? {
            let entry = entry?;
            let record_path = entry.path().join("container.json");
            if !record_path.exists() {
                continue;
            }

            let mut record: Container = match read_json(&record_path) {
                Ok(r) => r,
                Err(e) => {
                    warn!("skipping unreadable container record {:?}: {}", record_path, e);
                    continue;
                }
            };

            let was_running = matches!(
                record.state,
                ContainerState::Running | ContainerState::Paused
            );

            if was_running {
                let alive = self
                    .backend
                    .is_alive(&record.id, record.pid)
                    .await
                    .unwrap_or(false);
                if alive {
                    info!("adopting running container {}", short_id(&record.id));
                } else {
                    record.state = ContainerState::Stopped;
                    record.exit_code = Some(255);
                    record.finished_at = Some(Utc::now());
                    record.dead = true;
                    record.reason = Some("supervisor lost".into());
                }
            }

            let log = Arc::new(LogWriter::open(
                &record.log_path,
                self.runtime.log_rotate_bytes,
            )?);
            let (state_tx, state_rx) = watch::channel(record.state);
            let handle = Arc::new(ContainerHandle {
                record: RwLock::new(record.clone()),
                gate: OpGate::new(),
                log,
                state_tx,
                state_rx,
            });

            for name in &record.names {
                self.names.insert(name.clone(), record.id.clone());
            }
            self.registry.insert(record.id.clone(), handle.clone());
            self.persist(&record)?;

            // Adopted containers get a liveness poller in place of the lost
            // supervisor
            if record.state == ContainerState::Running
                || record.state == ContainerState::Paused
            {
                supervisor::spawn_adoption_poller(self.clone(), handle, record.id.clone());
            }

            loaded += 1;
        }

        info!("live-restore loaded {} container(s)", loaded);
        Ok(loaded)
    }

    /// Stop every running container; daemon shutdown path
    pub async fn shutdown(&self) {
        // Restart policies must not fight the drain
        self.suppress_restarts(true);

        for entry in self.registry.iter() {
            let state = entry.value().record.read().state;
            if matches!(state, ContainerState::Running | ContainerState::Paused) {
                let id = entry.key().clone();
                if let Err(e) = self.stop(&id, None).await {
                    warn!("shutdown: failed to stop {}: {}", short_id(&id), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ProcessBackend;
    use crate::container::RestartPolicy;
    use crate::image::import::test_support::build_tarball;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        engine: Arc<ContainerEngine>,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let bus = EventBus::new();

        let images = Arc::new(
            ImageStore::open(temp.path().join("images"), bus.clone()).unwrap(),
        );
        let tarball = temp.path().join("alpine.tar.gz");
        build_tarball(&tarball, &[("etc/os-release", b"alpine".as_slice())]);
        images.import(&tarball, "alpine:latest").await.unwrap();

        let volumes = Arc::new(
            VolumeManager::open(temp.path().join("volumes"), bus.clone()).unwrap(),
        );

        let engine = Arc::new(ContainerEngine::new(
            temp.path().join("containers"),
            images.clone(),
            volumes,
            Arc::new(ProcessBackend::new()),
            bus,
            RuntimeConfiguration::default(),
            ExecutionMode::Native,
        ));

        // Same wiring as the daemon: running consumers veto image removal
        let engine_probe = Arc::downgrade(&engine);
        images.set_running_probe(Box::new(move |image_id| {
            engine_probe
                .upgrade()
                .map(|engine| engine.has_running_consumer(image_id))
                .unwrap_or(false)
        }));

        Fixture { _temp: temp, engine }
    }

    fn options(name: &str, command: &[&str]) -> CreateOptions {
        CreateOptions {
            name: Some(name.to_string()),
            image: "alpine:latest".into(),
            config: ContainerConfig {
                cmd: command.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn wait_for<F>(mut check: F, what: &str)
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        while !check() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_import_and_run_scenario() {
        let f = fixture().await;

        let record = f
            .engine
            .create(options("hello", &["echo", "hello"]))
            .await
            .unwrap();
        assert_eq!(record.state, ContainerState::Created);
        assert_eq!(record.id.len(), 64);
        assert!(record.rootfs_path.exists());

        f.engine.start(&record.id).await.unwrap();
        let exit_code = f.engine.wait(&record.id).await.unwrap();
        assert_eq!(exit_code, 0);

        let inspected = f.engine.inspect("hello").unwrap();
        assert_eq!(inspected.state, ContainerState::Stopped);
        assert_eq!(inspected.exit_code, Some(0));
        assert!(!inspected.oom_killed);

        // Output pumps may land a hair after the exit record
        tokio::time::sleep(Duration::from_millis(50)).await;
        let records =
            crate::container::read_log_tail(&inspected.log_path, None).unwrap();
        let stdout: String = records.iter().map(|r| r.log.as_str()).collect();
        assert_eq!(stdout, "hello\n");
    }

    #[tokio::test]
    async fn test_name_uniqueness_scenario() {
        let f = fixture().await;

        f.engine
            .create(options("web", &["echo", "one"]))
            .await
            .unwrap();

        let err = f
            .engine
            .create(options("web", &["echo", "two"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);

        f.engine.remove("web", false).await.unwrap();

        // Now the name is free again
        f.engine
            .create(options("web", &["echo", "two"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let f = fixture().await;
        let record = f
            .engine
            .create(options("t1", &["sleep", "30"]))
            .await
            .unwrap();

        // Created cannot stop or pause
        let err = f.engine.stop(&record.id, Some(1)).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidState);
        let err = f.engine.pause(&record.id).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidState);

        f.engine.start(&record.id).await.unwrap();

        // Running cannot start again
        let err = f.engine.start(&record.id).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidState);

        // Running cannot be removed without force
        let err = f.engine.remove(&record.id, false).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidState);

        // Force removal kills and removes
        f.engine.remove(&record.id, true).await.unwrap();
        assert!(f.engine.inspect(&record.id).is_err());
    }

    #[tokio::test]
    async fn test_restart_policy_on_failure_scenario() {
        let f = fixture().await;

        let mut opts = options("failing", &["sh", "-c", "exit 1"]);
        opts.config.restart_policy = RestartPolicy::OnFailure { max: 3 };

        let record = f.engine.create(opts).await.unwrap();
        f.engine.start(&record.id).await.unwrap();

        // Exactly three start attempts, then a terminal stop
        let engine = f.engine.clone();
        let id = record.id.clone();
        wait_for(
            || {
                let c = engine.inspect(&id).unwrap();
                c.restart_count == 3 && c.state == ContainerState::Stopped
            },
            "three attempts and final stop",
        )
        .await;

        // Give any spurious extra restart a chance to show up
        tokio::time::sleep(Duration::from_millis(600)).await;
        let c = f.engine.inspect(&record.id).unwrap();
        assert_eq!(c.restart_count, 3);
        assert_eq!(c.state, ContainerState::Stopped);
        assert_eq!(c.exit_code, Some(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_always_policy_restarts_after_explicit_stop() {
        let f = fixture().await;

        let mut opts = options("persistent", &["sleep", "30"]);
        opts.config.restart_policy = RestartPolicy::Always;

        let record = f.engine.create(opts).await.unwrap();
        f.engine.start(&record.id).await.unwrap();

        // always re-enters Start unconditionally, even after an explicit stop
        f.engine.stop(&record.id, Some(0)).await.unwrap();

        let engine = f.engine.clone();
        let id = record.id.clone();
        wait_for(
            || engine.inspect(&id).unwrap().state == ContainerState::Running,
            "automatic restart after explicit stop",
        )
        .await;

        f.engine.remove(&record.id, true).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unless_stopped_honors_explicit_stop() {
        let f = fixture().await;

        let mut opts = options("polite", &["sleep", "30"]);
        opts.config.restart_policy = RestartPolicy::UnlessStopped;

        let record = f.engine.create(opts).await.unwrap();
        f.engine.start(&record.id).await.unwrap();

        f.engine.stop(&record.id, Some(0)).await.unwrap();

        // The explicit stop is the last state change; no restart fires
        tokio::time::sleep(Duration::from_millis(600)).await;
        let c = f.engine.inspect(&record.id).unwrap();
        assert_eq!(c.state, ContainerState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unless_stopped_restarts_after_crash() {
        let f = fixture().await;

        let mut opts = options("comeback", &["sleep", "30"]);
        opts.config.restart_policy = RestartPolicy::UnlessStopped;

        let record = f.engine.create(opts).await.unwrap();
        f.engine.start(&record.id).await.unwrap();

        // A kill from outside the engine is a crash, not an explicit stop
        let pid = f.engine.inspect(&record.id).unwrap().pid.unwrap();
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }

        let engine = f.engine.clone();
        let id = record.id.clone();
        wait_for(
            || {
                let c = engine.inspect(&id).unwrap();
                c.state == ContainerState::Running && c.restart_count > 1
            },
            "restart after external kill",
        )
        .await;

        f.engine.remove(&record.id, true).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_timeout_scenario() {
        let f = fixture().await;

        // The process ignores SIGTERM; stop must escalate to SIGKILL
        let record = f
            .engine
            .create(options("stubborn", &["sh", "-c", "trap '' TERM; sleep 30"]))
            .await
            .unwrap();
        f.engine.start(&record.id).await.unwrap();

        // Give the shell a moment to install its trap
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = tokio::time::Instant::now();
        f.engine.stop(&record.id, Some(2)).await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(2), "stopped too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(6), "stopped too late: {:?}", elapsed);

        let c = f.engine.inspect(&record.id).unwrap();
        assert_eq!(c.state, ContainerState::Stopped);
        assert_eq!(c.exit_code, Some(137));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_zero_timeout_skips_sigterm() {
        let f = fixture().await;

        let record = f
            .engine
            .create(options("quick", &["sleep", "30"]))
            .await
            .unwrap();
        f.engine.start(&record.id).await.unwrap();

        f.engine.stop(&record.id, Some(0)).await.unwrap();
        let c = f.engine.inspect(&record.id).unwrap();
        assert_eq!(c.exit_code, Some(137));
    }

    #[tokio::test]
    async fn test_start_stop_start_law() {
        let f = fixture().await;

        let record = f
            .engine
            .create(options("cycle", &["sleep", "30"]))
            .await
            .unwrap();
        let original_command = record.command.clone();

        f.engine.start(&record.id).await.unwrap();
        f.engine.stop(&record.id, Some(0)).await.unwrap();
        f.engine.start(&record.id).await.unwrap();

        let c = f.engine.inspect(&record.id).unwrap();
        assert_eq!(c.state, ContainerState::Running);
        assert_eq!(c.command, original_command);

        f.engine.stop(&record.id, Some(0)).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pause_unpause() {
        let f = fixture().await;

        let record = f
            .engine
            .create(options("pausable", &["sleep", "30"]))
            .await
            .unwrap();
        f.engine.start(&record.id).await.unwrap();

        f.engine.pause(&record.id).await.unwrap();
        assert_eq!(
            f.engine.inspect(&record.id).unwrap().state,
            ContainerState::Paused
        );

        // Paused cannot pause again
        let err = f.engine.pause(&record.id).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidState);

        f.engine.unpause(&record.id).await.unwrap();
        assert_eq!(
            f.engine.inspect(&record.id).unwrap().state,
            ContainerState::Running
        );

        f.engine.stop(&record.id, Some(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_sync() {
        let f = fixture().await;

        let record = f
            .engine
            .create(options("host", &["sleep", "30"]))
            .await
            .unwrap();
        f.engine.start(&record.id).await.unwrap();

        let (exit_code, stdout, _stderr) = f
            .engine
            .exec_sync(&record.id, vec!["echo".into(), "inside".into()], None)
            .await
            .unwrap();
        assert_eq!(exit_code, 0);
        assert_eq!(String::from_utf8_lossy(&stdout), "inside\n");

        f.engine.stop(&record.id, Some(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_releases_image_ref() {
        let f = fixture().await;

        let record = f
            .engine
            .create(options("r1", &["echo", "x"]))
            .await
            .unwrap();

        // In use: image removal refuses
        let err = f.engine.images.remove("alpine:latest", false).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InUse);

        f.engine.remove(&record.id, false).await.unwrap();
        f.engine.images.remove("alpine:latest", false).unwrap();
    }

    #[tokio::test]
    async fn test_force_image_removal_refuses_running_consumer() {
        let f = fixture().await;

        let record = f
            .engine
            .create(options("pinned", &["sleep", "30"]))
            .await
            .unwrap();
        f.engine.start(&record.id).await.unwrap();

        // force never overrides a Running consumer
        let err = f.engine.images.remove("alpine:latest", true).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InUse);

        f.engine.stop(&record.id, Some(0)).await.unwrap();

        // A Stopped reference is exactly what force overrides
        f.engine.images.remove("alpine:latest", true).unwrap();
        assert!(f.engine.images.inspect("alpine:latest").is_err());
    }

    #[tokio::test]
    async fn test_live_restore_marks_dead() {
        let temp = TempDir::new().unwrap();
        let bus = EventBus::new();
        let images = Arc::new(
            ImageStore::open(temp.path().join("images"), bus.clone()).unwrap(),
        );
        let tarball = temp.path().join("alpine.tar.gz");
        build_tarball(&tarball, &[("etc/os-release", b"alpine".as_slice())]);
        images.import(&tarball, "alpine:latest").await.unwrap();
        let volumes = Arc::new(
            VolumeManager::open(temp.path().join("volumes"), bus.clone()).unwrap(),
        );

        let make_engine = |backend: Arc<dyn RuntimeBackend>| {
            Arc::new(ContainerEngine::new(
                temp.path().join("containers"),
                images.clone(),
                volumes.clone(),
                backend,
                bus.clone(),
                RuntimeConfiguration::default(),
                ExecutionMode::Native,
            ))
        };

        let id = {
            let engine = make_engine(Arc::new(ProcessBackend::new()));
            let record = engine
                .create(options("restored", &["sleep", "30"]))
                .await
                .unwrap();
            engine.start(&record.id).await.unwrap();

            // Fake a daemon crash: forcibly persist a Running record with a
            // dead pid so the next engine cannot find the process
            {
                let handle = engine.resolve(&record.id).unwrap();
                let mut c = handle.record.write();
                c.pid = Some(4_000_000);
                engine.persist(&c).unwrap();
            }
            engine.stop(&record.id, Some(0)).await.unwrap();

            // Re-persist as Running to simulate the crash-time snapshot
            {
                let handle = engine.resolve(&record.id).unwrap();
                let mut c = handle.record.write();
                c.state = ContainerState::Running;
                engine.persist(&c).unwrap();
            }
            record.id
        };

        // Fresh engine with an empty backend: the record says Running, the
        // probe says gone
        let engine = make_engine(Arc::new(ProcessBackend::new()));
        let loaded = engine.load_state().await.unwrap();
        assert_eq!(loaded, 1);

        let c = engine.inspect(&id).unwrap();
        assert_eq!(c.state, ContainerState::Stopped);
        assert!(c.dead);
        assert_eq!(c.exit_code, Some(255));
        assert_eq!(c.names, vec!["restored"]);
    }
}
