//! Pod sandbox manager
//!
//! A sandbox owns shared namespaces and a lifecycle anchor process; member
//! containers come and go while the sandbox lives. Network setup is
//! delegated to the external plugin named in the configuration; without one
//! a loopback-only namespace handle is allocated.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::backend::{ExecSpec, OutputCallback, RuntimeBackend, StdStream};
use crate::config::NetworkConfiguration;
use crate::error::{DaemonError, Result};
use crate::events::{EventBus, EventType};
use crate::system::{atomic_write_json, new_entity_id, read_json, short_id};

use super::sandbox::{PodSandbox, SandboxMetadata, SandboxState};

/// The anchor just has to exist; a very long sleep is the portable "pause"
const PAUSE_COMMAND: &[&str] = &["sleep", "2147483647"];

/// Inputs to RunPodSandbox
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    pub metadata: SandboxMetadata,
    pub port_mappings: Vec<String>,
    pub dns_config: Vec<String>,
    pub hostname: Option<String>,
    pub log_directory: Option<PathBuf>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

struct SandboxHandle {
    record: RwLock<PodSandbox>,
}

/// Manager for pod sandboxes
pub struct SandboxManager {
    /// `<data_root>/sandboxes`
    root: PathBuf,

    sandboxes: DashMap<String, Arc<SandboxHandle>>,

    /// metadata key -> id, the duplicate-run gate
    by_metadata: DashMap<String, String>,

    backend: Arc<dyn RuntimeBackend>,
    network: NetworkConfiguration,
    event_bus: EventBus,
}

impl SandboxManager {
    pub fn open(
        root: PathBuf,
        backend: Arc<dyn RuntimeBackend>,
        network: NetworkConfiguration,
        event_bus: EventBus,
    ) -> Result<Self> {
        std::fs::create_dir_all(&root)?;

        let manager = Self {
            root,
            sandboxes: DashMap::new(),
            by_metadata: DashMap::new(),
            backend,
            network,
            event_bus,
        };
        manager.load_state()?;
        Ok(manager)
    }

    fn sandbox_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn persist(&self, record: &PodSandbox) -> Result<()> {
        atomic_write_json(&self.sandbox_dir(&record.id).join("sandbox.json"), record)
    }

    fn load_state(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let record_path = entry.path().join("sandbox.json");
            if !record_path.exists() {
                continue;
            }
            match read_json::<PodSandbox>(&record_path) {
                Ok(mut record) => {
                    // The anchor did not survive the daemon; a rehydrated
                    // sandbox is NotReady until re-run
                    record.state = SandboxState::NotReady;
                    self.by_metadata
                        .insert(record.metadata.key(), record.id.clone());
                    self.sandboxes.insert(
                        record.id.clone(),
                        Arc::new(SandboxHandle {
                            record: RwLock::new(record),
                        }),
                    );
                }
                Err(e) => warn!("skipping unreadable sandbox record: {}", e),
            }
        }
        Ok(())
    }

    fn anchor_id(sandbox_id: &str) -> String {
        format!("{}-pause", short_id(sandbox_id))
    }

    /// Allocate the shared network namespace.
    ///
    /// With a plugin configured this shells out with the CNI-style ADD
    /// contract; otherwise a synthetic handle under the sandbox directory
    /// stands in (loopback-only semantics).
    async fn allocate_network(&self, sandbox_id: &str) -> Result<(String, Option<String>)> {
        if let Some(plugin) = &self.network.network_plugin {
            let handle = format!("/run/servin/netns/{}", sandbox_id);
            let output = tokio::process::Command::new(plugin)
                .env("CNI_COMMAND", "ADD")
                .env("CNI_CONTAINERID", sandbox_id)
                .env("CNI_NETNS", &handle)
                .output()
                .await
                .map_err(|e| {
                    DaemonError::unavailable(
                        "run_pod_sandbox",
                        format!("network plugin {}: {}", plugin.display(), e),
                    )
                })?;

            if !output.status.success() {
                return Err(DaemonError::unavailable(
                    "run_pod_sandbox",
                    format!(
                        "network plugin failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                ));
            }

            // Plugins report the assigned address on stdout as JSON
            let ip = serde_json::from_slice::<serde_json::Value>(&output.stdout)
                .ok()
                .and_then(|v| {
                    v.get("ips")?
                        .as_array()?
                        .first()?
                        .get("address")
                        .and_then(|a| a.as_str())
                        .map(|s| s.split('/').next().unwrap_or(s).to_string())
                });

            return Ok((handle, ip));
        }

        let handle = self
            .sandbox_dir(sandbox_id)
            .join("netns")
            .display()
            .to_string();
        Ok((handle, None))
    }

    async fn release_network(&self, sandbox_id: &str, handle: Option<&str>) {
        if let (Some(plugin), Some(handle)) = (&self.network.network_plugin, handle) {
            let result = tokio::process::Command::new(plugin)
                .env("CNI_COMMAND", "DEL")
                .env("CNI_CONTAINERID", sandbox_id)
                .env("CNI_NETNS", handle)
                .output()
                .await;
            if let Err(e) = result {
                warn!("network plugin DEL failed for {}: {}", short_id(sandbox_id), e);
            }
        }
    }

    /// RunPodSandbox: allocate namespaces, start the anchor, record metadata
    pub async fn run(&self, options: SandboxOptions) -> Result<String> {
        if options.metadata.name.is_empty() || options.metadata.uid.is_empty() {
            return Err(DaemonError::invalid_argument(
                "run_pod_sandbox",
                "sandbox metadata requires name and uid",
            ));
        }

        let key = options.metadata.key();
        if self.by_metadata.contains_key(&key) {
            return Err(DaemonError::conflict(
                "run_pod_sandbox",
                format!("sandbox already exists for {}", key),
            ));
        }

        let id = new_entity_id();
        let dir = self.sandbox_dir(&id);
        std::fs::create_dir_all(&dir)?;

        let (netns_handle, ip) = match self.allocate_network(&id).await {
            Ok(result) => result,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(e);
            }
        };

        // Start the anchor; its namespaces are the pod's namespaces
        let anchor_spec = ExecSpec {
            id: Self::anchor_id(&id),
            rootfs: dir.clone(),
            command: PAUSE_COMMAND.iter().map(|s| s.to_string()).collect(),
            env: vec![],
            working_dir: None,
            user: None,
            tty: false,
            stdin_open: false,
            mounts: vec![],
            resources: Default::default(),
            network: crate::backend::NetworkSpec {
                mode: "bridge".into(),
                namespace_handle: Some(netns_handle.clone()),
                dns: options.dns_config.clone(),
                hostname: options.hostname.clone(),
            },
            capabilities: vec![],
            privileged: false,
            seccomp_profile: None,
            apparmor_profile: None,
            labels: options.labels.clone(),
        };

        let discard: OutputCallback = Arc::new(|_: StdStream, _: &[u8]| {});
        if let Err(e) = self.backend.start(&anchor_spec, discard).await {
            self.release_network(&id, Some(&netns_handle)).await;
            let _ = std::fs::remove_dir_all(&dir);
            return Err(DaemonError::from(e).with_id(id));
        }

        let log_directory = options
            .log_directory
            .clone()
            .unwrap_or_else(|| dir.join("logs"));
        std::fs::create_dir_all(&log_directory)?;

        let record = PodSandbox {
            id: id.clone(),
            metadata: options.metadata.clone(),
            state: SandboxState::Ready,
            created_at: Utc::now(),
            network_namespace_handle: Some(netns_handle),
            ipc_namespace_handle: Some(format!("ipc:{}", Self::anchor_id(&id))),
            uts_namespace_handle: Some(format!("uts:{}", Self::anchor_id(&id))),
            ip,
            port_mappings: options.port_mappings.clone(),
            dns_config: options.dns_config.clone(),
            hostname: options.hostname.clone(),
            log_directory,
            labels: options.labels.clone(),
            annotations: options.annotations.clone(),
            members: Vec::new(),
        };

        self.persist(&record)?;
        self.by_metadata.insert(key, id.clone());
        self.sandboxes.insert(
            id.clone(),
            Arc::new(SandboxHandle {
                record: RwLock::new(record),
            }),
        );

        info!("sandbox {} ready ({})", short_id(&id), options.metadata.name);
        self.event_bus.emit(EventType::Sandbox, "start", &id);
        Ok(id)
    }

    fn handle(&self, id: &str) -> Result<Arc<SandboxHandle>> {
        self.sandboxes
            .get(id)
            .map(|h| h.clone())
            .ok_or_else(|| DaemonError::not_found("sandbox_lookup", id))
    }

    pub fn inspect(&self, id: &str) -> Result<PodSandbox> {
        Ok(self.handle(id)?.record.read().clone())
    }

    pub fn list(&self) -> Vec<PodSandbox> {
        let mut records: Vec<PodSandbox> = self
            .sandboxes
            .iter()
            .map(|e| e.value().record.read().clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Whether a container may be created inside this sandbox
    pub fn check_ready(&self, id: &str) -> Result<PodSandbox> {
        let record = self.inspect(id)?;
        if record.state != SandboxState::Ready {
            return Err(DaemonError::invalid_state(
                "create_container",
                format!("sandbox {} is not ready", short_id(id)),
            )
            .with_id(id.to_string()));
        }
        Ok(record)
    }

    /// Membership bookkeeping, called by the CRI layer around container
    /// create/remove
    pub fn add_member(&self, id: &str, container_id: &str) -> Result<()> {
        let handle = self.handle(id)?;
        let mut record = handle.record.write();
        if !record.members.iter().any(|m| m == container_id) {
            record.members.push(container_id.to_string());
            self.persist(&record)?;
        }
        Ok(())
    }

    pub fn remove_member(&self, id: &str, container_id: &str) -> Result<()> {
        let handle = self.handle(id)?;
        let mut record = handle.record.write();
        record.members.retain(|m| m != container_id);
        self.persist(&record)?;
        Ok(())
    }

    /// Stop the sandbox: members first (graceful), then the anchor, then the
    /// network. Idempotent.
    pub async fn stop(
        &self,
        id: &str,
        engine: &Arc<crate::container::ContainerEngine>,
    ) -> Result<()> {
        let handle = self.handle(id)?;

        let (members, already_stopped) = {
            let record = handle.record.read();
            (
                record.members.clone(),
                record.state == SandboxState::NotReady,
            )
        };
        if already_stopped {
            return Ok(());
        }

        for member in &members {
            match engine.stop(member, None).await {
                Ok(()) => {}
                // Already-stopped members keep stop idempotent
                Err(e) if e.kind == crate::error::ErrorKind::InvalidState => {}
                Err(e) if e.kind == crate::error::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        let anchor = Self::anchor_id(id);
        if let Err(e) = self.backend.signal(&anchor, "SIGKILL").await {
            warn!("anchor for {} was already gone: {}", short_id(id), e);
        }

        {
            let record = handle.record.read().clone();
            self.release_network(&record.id, record.network_namespace_handle.as_deref())
                .await;
        }

        {
            let mut record = handle.record.write();
            record.state = SandboxState::NotReady;
            self.persist(&record)?;
        }

        info!("sandbox {} stopped", short_id(id));
        self.event_bus.emit(EventType::Sandbox, "stop", id);
        Ok(())
    }

    /// Remove a stopped sandbox, cascading member removal
    pub async fn remove(
        &self,
        id: &str,
        engine: &Arc<crate::container::ContainerEngine>,
    ) -> Result<()> {
        let handle = self.handle(id)?;

        let record = handle.record.read().clone();
        if record.state != SandboxState::NotReady {
            return Err(DaemonError::invalid_state(
                "remove_pod_sandbox",
                "sandbox must be stopped before removal",
            )
            .with_id(id.to_string()));
        }

        for member in &record.members {
            match engine.remove(member, true).await {
                Ok(()) => {}
                Err(e) if e.kind == crate::error::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        std::fs::remove_dir_all(self.sandbox_dir(id))?;
        self.by_metadata.remove(&record.metadata.key());
        self.sandboxes.remove(id);

        info!("sandbox {} removed", short_id(id));
        self.event_bus.emit(EventType::Sandbox, "remove", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ProcessBackend;
    use tempfile::TempDir;

    fn manager(temp: &TempDir) -> SandboxManager {
        SandboxManager::open(
            temp.path().join("sandboxes"),
            Arc::new(ProcessBackend::new()),
            NetworkConfiguration::default(),
            EventBus::new(),
        )
        .unwrap()
    }

    fn options(name: &str, attempt: u32) -> SandboxOptions {
        SandboxOptions {
            metadata: SandboxMetadata {
                name: name.into(),
                namespace: "default".into(),
                uid: "u1".into(),
                attempt,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_and_status() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);

        let id = manager.run(options("web", 0)).await.unwrap();
        assert_eq!(id.len(), 64);

        let record = manager.inspect(&id).unwrap();
        assert_eq!(record.state, SandboxState::Ready);
        assert!(record.network_namespace_handle.is_some());
        assert_eq!(record.metadata.name, "web");
    }

    #[tokio::test]
    async fn test_duplicate_metadata_conflict() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);

        manager.run(options("web", 0)).await.unwrap();

        let err = manager.run(options("web", 0)).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);

        // A new attempt is a new sandbox
        let second = manager.run(options("web", 1)).await.unwrap();
        assert_eq!(manager.list().len(), 2);
        assert_ne!(manager.inspect(&second).unwrap().metadata.attempt, 0);
    }

    #[tokio::test]
    async fn test_rehydrated_sandbox_is_not_ready() {
        let temp = TempDir::new().unwrap();
        let id = {
            let manager = manager(&temp);
            manager.run(options("web", 0)).await.unwrap()
        };

        let manager = manager(&temp);
        let record = manager.inspect(&id).unwrap();
        assert_eq!(record.state, SandboxState::NotReady);
    }

    #[tokio::test]
    async fn test_check_ready_gate() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);
        let id = manager.run(options("web", 0)).await.unwrap();

        manager.check_ready(&id).unwrap();

        manager.handle(&id).unwrap().record.write().state = SandboxState::NotReady;
        let err = manager.check_ready(&id).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidState);
    }
}
