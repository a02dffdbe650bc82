//! CRI service implementation
//!
//! Translates CRI RPCs into operations on the lifecycle engine, the pod
//! sandbox manager, the image store, and the streaming hub.

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use chrono::{DateTime, Utc};

use crate::backend::ResourceLimits;
use crate::container::{ContainerConfig, ContainerEngine, ContainerState, CreateOptions};
use crate::error::{DaemonError, Result};
use crate::image::{ImageFetcher, ImageStore};
use crate::sandbox::{SandboxManager, SandboxMetadata, SandboxOptions, SandboxState};
use crate::streaming::{PendingOp, StreamingHub};

use super::types::*;

/// CRI runtime + image service
pub struct CriService {
    pub(crate) engine: Arc<ContainerEngine>,
    pub(crate) sandboxes: Arc<SandboxManager>,
    pub(crate) images: Arc<ImageStore>,
    pub(crate) hub: Arc<StreamingHub>,
    fetcher: Arc<dyn ImageFetcher>,

    /// Base URL handed out for streaming reconnects
    stream_base_url: String,
}

impl CriService {
    pub fn new(
        engine: Arc<ContainerEngine>,
        sandboxes: Arc<SandboxManager>,
        images: Arc<ImageStore>,
        hub: Arc<StreamingHub>,
        fetcher: Arc<dyn ImageFetcher>,
        stream_base_url: String,
    ) -> Self {
        Self {
            engine,
            sandboxes,
            images,
            hub,
            fetcher,
            stream_base_url,
        }
    }

    fn timestamp(at: Option<DateTime<Utc>>) -> i64 {
        at.map(|t| t.timestamp_nanos_opt().unwrap_or(0)).unwrap_or(0)
    }

    // ========================================================================
    // Runtime service
    // ========================================================================

    pub fn version(&self, _request: VersionRequest) -> VersionResponse {
        VersionResponse {
            version: "0.1.0".into(),
            runtime_name: "servin".into(),
            runtime_version: env!("CARGO_PKG_VERSION").into(),
            runtime_api_version: "v1alpha2".into(),
        }
    }

    pub fn status(&self, _request: StatusRequest) -> StatusResponse {
        StatusResponse {
            status: RuntimeStatus {
                conditions: vec![
                    RuntimeCondition {
                        r#type: "RuntimeReady".into(),
                        status: true,
                        reason: String::new(),
                        message: String::new(),
                    },
                    RuntimeCondition {
                        r#type: "NetworkReady".into(),
                        status: true,
                        reason: String::new(),
                        message: String::new(),
                    },
                ],
            },
            info: Default::default(),
        }
    }

    pub async fn run_pod_sandbox(
        &self,
        request: RunPodSandboxRequest,
    ) -> Result<RunPodSandboxResponse> {
        let config = request.config;

        let options = SandboxOptions {
            metadata: SandboxMetadata {
                name: config.metadata.name,
                namespace: config.metadata.namespace,
                uid: config.metadata.uid,
                attempt: config.metadata.attempt,
            },
            port_mappings: config
                .port_mappings
                .iter()
                .map(|p| format!("{}:{}/{}", p.host_port, p.container_port, proto_name(p.protocol)))
                .collect(),
            dns_config: config
                .dns_config
                .map(|d| d.servers)
                .unwrap_or_default(),
            hostname: if config.hostname.is_empty() {
                None
            } else {
                Some(config.hostname)
            },
            log_directory: if config.log_directory.is_empty() {
                None
            } else {
                Some(PathBuf::from(config.log_directory))
            },
            labels: config.labels,
            annotations: config.annotations,
        };

        let pod_sandbox_id = self.sandboxes.run(options).await?;
        Ok(RunPodSandboxResponse { pod_sandbox_id })
    }

    pub async fn stop_pod_sandbox(&self, request: PodSandboxIdRequest) -> Result<EmptyResponse> {
        self.sandboxes
            .stop(&request.pod_sandbox_id, &self.engine)
            .await?;
        Ok(EmptyResponse {})
    }

    pub async fn remove_pod_sandbox(&self, request: PodSandboxIdRequest) -> Result<EmptyResponse> {
        self.sandboxes
            .remove(&request.pod_sandbox_id, &self.engine)
            .await?;
        Ok(EmptyResponse {})
    }

    pub fn pod_sandbox_status(
        &self,
        request: PodSandboxIdRequest,
    ) -> Result<PodSandboxStatusResponse> {
        let record = self.sandboxes.inspect(&request.pod_sandbox_id)?;

        Ok(PodSandboxStatusResponse {
            status: PodSandboxStatus {
                id: record.id.clone(),
                metadata: PodSandboxMetadata {
                    name: record.metadata.name.clone(),
                    uid: record.metadata.uid.clone(),
                    namespace: record.metadata.namespace.clone(),
                    attempt: record.metadata.attempt,
                },
                state: match record.state {
                    SandboxState::Ready => SANDBOX_READY,
                    SandboxState::NotReady => SANDBOX_NOTREADY,
                },
                created_at: Self::timestamp(Some(record.created_at)),
                network: PodSandboxNetworkStatus {
                    ip: record.ip.clone().unwrap_or_default(),
                },
                labels: record.labels.clone(),
                annotations: record.annotations.clone(),
            },
        })
    }

    pub fn list_pod_sandbox(&self, request: ListPodSandboxRequest) -> ListPodSandboxResponse {
        let filter = request.filter.unwrap_or_default();

        let items = self
            .sandboxes
            .list()
            .into_iter()
            .filter(|s| filter.id.is_empty() || s.id == filter.id)
            .filter(|s| {
                filter
                    .label_selector
                    .iter()
                    .all(|(k, v)| s.labels.get(k) == Some(v))
            })
            .map(|s| PodSandboxSummary {
                id: s.id.clone(),
                metadata: PodSandboxMetadata {
                    name: s.metadata.name.clone(),
                    uid: s.metadata.uid.clone(),
                    namespace: s.metadata.namespace.clone(),
                    attempt: s.metadata.attempt,
                },
                state: match s.state {
                    SandboxState::Ready => SANDBOX_READY,
                    SandboxState::NotReady => SANDBOX_NOTREADY,
                },
                created_at: Self::timestamp(Some(s.created_at)),
                labels: s.labels,
            })
            .collect();

        ListPodSandboxResponse { items }
    }

    pub async fn create_container(
        &self,
        request: CreateContainerRequest,
    ) -> Result<CreateContainerResponse> {
        // A container cannot join a sandbox that is not Ready
        let sandbox = self.sandboxes.check_ready(&request.pod_sandbox_id)?;

        let config = request.config;
        let name = format!(
            "{}_{}_{}_{}",
            config.metadata.name,
            sandbox.metadata.name,
            sandbox.metadata.namespace,
            config.metadata.attempt
        );

        let log_path = if config.log_path.is_empty() {
            None
        } else {
            Some(sandbox.log_directory.join(&config.log_path))
        };

        let resources = config
            .linux
            .as_ref()
            .and_then(|l| l.resources.as_ref())
            .map(|r| ResourceLimits {
                memory_bytes: r.memory_limit_in_bytes.max(0) as u64,
                cpu_shares: r.cpu_shares.max(0) as u64,
                cpu_quota: r.cpu_quota,
                cpu_period: r.cpu_period,
                pids_limit: r.pids_limit,
                blkio_weight: 0,
            })
            .unwrap_or_default();

        let options = CreateOptions {
            name: Some(name),
            image: config.image.image.clone(),
            config: ContainerConfig {
                entrypoint: config.command.clone(),
                cmd: config.args.clone(),
                env: config
                    .envs
                    .iter()
                    .map(|e| format!("{}={}", e.key, e.value))
                    .collect(),
                working_dir: if config.working_dir.is_empty() {
                    None
                } else {
                    Some(config.working_dir.clone())
                },
                tty: config.tty,
                stdin_open: config.stdin,
                labels: config.labels.clone(),
                resources,
                dns: sandbox.dns_config.clone(),
                hostname: sandbox.hostname.clone(),
                ..Default::default()
            },
            mounts: config
                .mounts
                .iter()
                .map(|m| crate::backend::MountSpec {
                    source: m.host_path.clone(),
                    target: m.container_path.clone(),
                    kind: crate::backend::MountKind::Bind,
                    readonly: m.readonly,
                    propagation: None,
                    tmpfs_size: None,
                })
                .collect(),
            network: Default::default(),
            sandbox_id: Some(sandbox.id.clone()),
            network_namespace_handle: sandbox.network_namespace_handle.clone(),
            log_path,
        };

        let record = self.engine.create(options).await?;
        self.sandboxes.add_member(&sandbox.id, &record.id)?;

        Ok(CreateContainerResponse {
            container_id: record.id,
        })
    }

    pub async fn start_container(&self, request: ContainerIdRequest) -> Result<EmptyResponse> {
        self.engine.start(&request.container_id).await?;
        Ok(EmptyResponse {})
    }

    pub async fn stop_container(&self, request: StopContainerRequest) -> Result<EmptyResponse> {
        match self
            .engine
            .stop(&request.container_id, Some(request.timeout.max(0) as u64))
            .await
        {
            Ok(()) => Ok(EmptyResponse {}),
            // CRI StopContainer is idempotent on already-stopped containers
            Err(e) if e.kind == crate::error::ErrorKind::InvalidState => Ok(EmptyResponse {}),
            Err(e) => Err(e),
        }
    }

    pub async fn remove_container(&self, request: ContainerIdRequest) -> Result<EmptyResponse> {
        let sandbox_id = self
            .engine
            .inspect(&request.container_id)
            .ok()
            .and_then(|c| c.sandbox_id);

        self.engine.remove(&request.container_id, false).await?;

        if let Some(sandbox_id) = sandbox_id {
            let _ = self.sandboxes.remove_member(&sandbox_id, &request.container_id);
        }
        Ok(EmptyResponse {})
    }

    fn cri_state(state: ContainerState) -> i32 {
        match state {
            ContainerState::Created => CONTAINER_CREATED,
            ContainerState::Running | ContainerState::Paused => CONTAINER_RUNNING,
            ContainerState::Stopped => CONTAINER_EXITED,
            ContainerState::Removing => CONTAINER_UNKNOWN,
        }
    }

    pub fn list_containers(&self, request: ListContainersRequest) -> ListContainersResponse {
        let filter = request.filter.unwrap_or_default();

        let containers = self
            .engine
            .list(true)
            .into_iter()
            .filter(|c| filter.id.is_empty() || c.id == filter.id)
            .filter(|c| {
                filter.pod_sandbox_id.is_empty()
                    || c.sandbox_id.as_deref() == Some(filter.pod_sandbox_id.as_str())
            })
            .filter(|c| {
                filter
                    .label_selector
                    .iter()
                    .all(|(k, v)| c.config.labels.get(k) == Some(v))
            })
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                pod_sandbox_id: c.sandbox_id.clone().unwrap_or_default(),
                metadata: ContainerMetadata {
                    name: c.names.first().cloned().unwrap_or_default(),
                    attempt: 0,
                },
                image: ImageSpec {
                    image: c.image_name.clone(),
                },
                image_ref: c.image_ref.clone(),
                state: Self::cri_state(c.state),
                created_at: Self::timestamp(Some(c.created_at)),
                labels: c.config.labels,
            })
            .collect();

        ListContainersResponse { containers }
    }

    pub fn container_status(&self, request: ContainerIdRequest) -> Result<ContainerStatusResponse> {
        let c = self.engine.inspect(&request.container_id)?;

        Ok(ContainerStatusResponse {
            status: ContainerStatus {
                id: c.id.clone(),
                metadata: ContainerMetadata {
                    name: c.names.first().cloned().unwrap_or_default(),
                    attempt: 0,
                },
                state: Self::cri_state(c.state),
                created_at: Self::timestamp(Some(c.created_at)),
                started_at: Self::timestamp(c.started_at),
                finished_at: Self::timestamp(c.finished_at),
                exit_code: c.exit_code.unwrap_or(0) as i32,
                image: ImageSpec {
                    image: c.image_name.clone(),
                },
                image_ref: c.image_ref.clone(),
                reason: if c.oom_killed {
                    "OOMKilled".into()
                } else {
                    c.reason.clone().unwrap_or_default()
                },
                message: String::new(),
                log_path: c.log_path.display().to_string(),
                labels: c.config.labels.clone(),
            },
        })
    }

    pub async fn update_container_resources(
        &self,
        request: UpdateContainerResourcesRequest,
    ) -> Result<EmptyResponse> {
        let Some(resources) = request.linux else {
            return Ok(EmptyResponse {});
        };

        self.engine
            .update_resources(
                &request.container_id,
                ResourceLimits {
                    memory_bytes: resources.memory_limit_in_bytes.max(0) as u64,
                    cpu_shares: resources.cpu_shares.max(0) as u64,
                    cpu_quota: resources.cpu_quota,
                    cpu_period: resources.cpu_period,
                    pids_limit: resources.pids_limit,
                    blkio_weight: 0,
                },
            )
            .await?;
        Ok(EmptyResponse {})
    }

    pub async fn exec_sync(&self, request: ExecSyncRequest) -> Result<ExecSyncResponse> {
        let timeout = if request.timeout > 0 {
            Some(std::time::Duration::from_secs(request.timeout as u64))
        } else {
            None
        };

        let (exit_code, stdout, stderr) = self
            .engine
            .exec_sync(&request.container_id, request.cmd, timeout)
            .await?;

        Ok(ExecSyncResponse {
            stdout: base64::engine::general_purpose::STANDARD.encode(stdout),
            stderr: base64::engine::general_purpose::STANDARD.encode(stderr),
            exit_code: exit_code as i32,
        })
    }

    fn stream_url(&self, kind: &str, token: &str) -> String {
        format!("{}/stream/{}/{}", self.stream_base_url, kind, token)
    }

    pub fn exec(&self, request: ExecRequest) -> Result<StreamUrlResponse> {
        // The container must exist and be running when the URL is minted
        let c = self.engine.inspect(&request.container_id)?;
        if c.state != ContainerState::Running {
            return Err(DaemonError::invalid_state(
                "exec",
                format!("container is {}", c.state),
            )
            .with_id(c.id));
        }
        if request.cmd.is_empty() {
            return Err(DaemonError::invalid_argument("exec", "empty command"));
        }

        let token = self.hub.register(PendingOp::Exec {
            container_id: c.id,
            command: request.cmd,
            env: vec![],
            tty: request.tty,
        });
        Ok(StreamUrlResponse {
            url: self.stream_url("exec", &token),
        })
    }

    pub fn attach(&self, request: AttachRequest) -> Result<StreamUrlResponse> {
        let c = self.engine.inspect(&request.container_id)?;
        if c.state != ContainerState::Running {
            return Err(DaemonError::invalid_state(
                "attach",
                format!("container is {}", c.state),
            )
            .with_id(c.id));
        }

        let token = self.hub.register(PendingOp::Attach { container_id: c.id });
        Ok(StreamUrlResponse {
            url: self.stream_url("attach", &token),
        })
    }

    pub fn port_forward(&self, request: PortForwardRequest) -> Result<StreamUrlResponse> {
        let sandbox = self.sandboxes.inspect(&request.pod_sandbox_id)?;
        let port = request
            .port
            .first()
            .copied()
            .filter(|p| *p > 0 && *p < 65536)
            .ok_or_else(|| DaemonError::invalid_argument("port_forward", "no valid port"))?;

        let token = self.hub.register(PendingOp::PortForward {
            sandbox_id: sandbox.id,
            port: port as u16,
        });
        Ok(StreamUrlResponse {
            url: self.stream_url("port-forward", &token),
        })
    }

    // ========================================================================
    // Image service
    // ========================================================================

    fn cri_image(image: &crate::image::Image) -> CriImage {
        CriImage {
            id: image.id.clone(),
            repo_tags: image.repo_tags.clone(),
            repo_digests: image.layers.clone(),
            size: image.size_bytes,
        }
    }

    pub fn list_images(&self, request: ListImagesRequest) -> ListImagesResponse {
        let wanted = request.filter.and_then(|f| f.image).map(|s| s.image);

        let images = self
            .images
            .list()
            .iter()
            .filter(|i| wanted.as_deref().map(|w| i.matches(w)).unwrap_or(true))
            .map(Self::cri_image)
            .collect();

        ListImagesResponse { images }
    }

    pub fn image_status(&self, request: ImageStatusRequest) -> ImageStatusResponse {
        ImageStatusResponse {
            image: self
                .images
                .inspect(&request.image.image)
                .ok()
                .map(|i| Self::cri_image(&i)),
        }
    }

    pub async fn pull_image(&self, request: PullImageRequest) -> Result<PullImageResponse> {
        let image = self
            .images
            .pull(&request.image.image, self.fetcher.as_ref())
            .await?;
        Ok(PullImageResponse {
            image_ref: image.id,
        })
    }

    pub fn remove_image(&self, request: RemoveImageRequest) -> Result<EmptyResponse> {
        match self.images.remove(&request.image.image, false) {
            Ok(()) => Ok(EmptyResponse {}),
            // Removing a missing image succeeds per the CRI contract
            Err(e) if e.kind == crate::error::ErrorKind::NotFound => Ok(EmptyResponse {}),
            Err(e) => Err(e),
        }
    }

    pub fn image_fs_info(&self) -> ImageFsInfoResponse {
        let (_, used_bytes) = self.images.disk_usage();
        ImageFsInfoResponse {
            image_filesystems: vec![FilesystemUsage {
                timestamp: Utc::now().timestamp_nanos_opt().unwrap_or(0),
                storage_path: String::new(),
                used_bytes,
                inodes_used: 0,
            }],
        }
    }
}

fn proto_name(protocol: i32) -> &'static str {
    match protocol {
        1 => "udp",
        2 => "sctp",
        _ => "tcp",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RuntimeBackend;
    use crate::config::{NetworkConfiguration, RuntimeConfiguration};
    use crate::events::EventBus;
    use crate::image::import::test_support::build_tarball;
    use crate::vm::providers::DevelopmentProvider;
    use crate::vm::{VmBackend, VmInstanceConfig, VmManager};
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        service: CriService,
        provider: Arc<DevelopmentProvider>,
        vm: Arc<VmManager>,
    }

    /// The registry is never hit in tests
    struct NoFetcher;

    #[async_trait::async_trait]
    impl ImageFetcher for NoFetcher {
        async fn fetch(&self, reference: &str, _scratch: &Path) -> crate::error::Result<std::path::PathBuf> {
            Err(DaemonError::not_found("pull_image", reference))
        }
    }

    /// Full stack over the development VM provider
    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let bus = EventBus::new();

        let images = Arc::new(
            crate::image::ImageStore::open(temp.path().join("images"), bus.clone()).unwrap(),
        );
        for reference in ["alpine:latest", "nginx:latest", "busybox:latest"] {
            let tarball = temp.path().join("img.tar.gz");
            build_tarball(&tarball, &[("etc/image", reference.as_bytes())]);
            images.import(&tarball, reference).await.unwrap();
        }

        let volumes = Arc::new(
            crate::volume::VolumeManager::open(temp.path().join("volumes"), bus.clone()).unwrap(),
        );

        let provider = Arc::new(DevelopmentProvider::new(temp.path().to_path_buf()));
        let vm = Arc::new(VmManager::new(
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
            bus.clone(),
        ));
        let backend: Arc<dyn RuntimeBackend> = Arc::new(VmBackend::new(vm.clone()));

        let engine = Arc::new(ContainerEngine::new(
            temp.path().join("containers"),
            images.clone(),
            volumes,
            backend.clone(),
            bus.clone(),
            RuntimeConfiguration::default(),
            crate::backend::ExecutionMode::Vm,
        ));

        let sandboxes = Arc::new(
            crate::sandbox::SandboxManager::open(
                temp.path().join("sandboxes"),
                backend,
                NetworkConfiguration::default(),
                bus,
            )
            .unwrap(),
        );

        let hub = Arc::new(StreamingHub::new(60, 64));
        let service = CriService::new(
            engine,
            sandboxes,
            images,
            hub,
            Arc::new(NoFetcher),
            "unix:///tmp/servin-test.sock".into(),
        );

        Fixture {
            _temp: temp,
            service,
            provider,
            vm,
        }
    }

    fn sandbox_config(name: &str, attempt: u32) -> PodSandboxConfig {
        PodSandboxConfig {
            metadata: PodSandboxMetadata {
                name: name.into(),
                uid: "u1".into(),
                namespace: "default".into(),
                attempt,
            },
            ..Default::default()
        }
    }

    fn container_config(name: &str, image: &str, command: &[&str]) -> CriContainerConfig {
        CriContainerConfig {
            metadata: ContainerMetadata {
                name: name.into(),
                attempt: 0,
            },
            image: ImageSpec {
                image: image.into(),
            },
            command: command.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_version_shape() {
        let f = fixture().await;
        let version = f.service.version(VersionRequest::default());
        assert_eq!(version.runtime_name, "servin");
        assert_eq!(version.runtime_api_version, "v1alpha2");
    }

    #[tokio::test]
    async fn test_pod_with_two_containers_sharing_network() {
        let f = fixture().await;

        let sandbox = f
            .service
            .run_pod_sandbox(RunPodSandboxRequest {
                config: sandbox_config("web", 0),
                runtime_handler: String::new(),
            })
            .await
            .unwrap();

        // Server container stays up
        let server = f
            .service
            .create_container(CreateContainerRequest {
                pod_sandbox_id: sandbox.pod_sandbox_id.clone(),
                config: container_config("nginx", "nginx:latest", &["nginx", "-g", "daemon off;"]),
                sandbox_config: None,
            })
            .await
            .unwrap();
        f.service
            .start_container(ContainerIdRequest {
                container_id: server.container_id.clone(),
            })
            .await
            .unwrap();

        // Client fetches over the shared loopback
        let client = f
            .service
            .create_container(CreateContainerRequest {
                pod_sandbox_id: sandbox.pod_sandbox_id.clone(),
                config: container_config(
                    "fetch",
                    "busybox:latest",
                    &["wget", "-qO-", "http://127.0.0.1:80"],
                ),
                sandbox_config: None,
            })
            .await
            .unwrap();
        f.service
            .start_container(ContainerIdRequest {
                container_id: client.container_id.clone(),
            })
            .await
            .unwrap();

        // Both members are forced into the sandbox namespace
        let record = f.service.engine.inspect(&client.container_id).unwrap();
        assert_eq!(
            record.network.mode,
            format!("container:{}", sandbox.pod_sandbox_id)
        );

        let exit_code = f.service.engine.wait(&client.container_id).await.unwrap();
        assert_eq!(exit_code, 0);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let logs =
            crate::container::read_log_tail(&record.log_path, None).unwrap();
        let output: String = logs.iter().map(|r| r.log.as_str()).collect();
        assert!(output.contains("HTTP"), "no HTTP response in logs: {}", output);

        // Status reflects membership and readiness
        let status = f
            .service
            .pod_sandbox_status(PodSandboxIdRequest {
                pod_sandbox_id: sandbox.pod_sandbox_id.clone(),
            })
            .unwrap();
        assert_eq!(status.status.state, SANDBOX_READY);

        let listed = f.service.list_containers(ListContainersRequest {
            filter: Some(ContainerFilter {
                pod_sandbox_id: sandbox.pod_sandbox_id.clone(),
                ..Default::default()
            }),
        });
        assert_eq!(listed.containers.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_sandbox_rejected_new_attempt_ok() {
        let f = fixture().await;

        f.service
            .run_pod_sandbox(RunPodSandboxRequest {
                config: sandbox_config("web", 0),
                runtime_handler: String::new(),
            })
            .await
            .unwrap();

        let err = f
            .service
            .run_pod_sandbox(RunPodSandboxRequest {
                config: sandbox_config("web", 0),
                runtime_handler: String::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);

        f.service
            .run_pod_sandbox(RunPodSandboxRequest {
                config: sandbox_config("web", 1),
                runtime_handler: String::new(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_in_stopped_sandbox_fails() {
        let f = fixture().await;

        let sandbox = f
            .service
            .run_pod_sandbox(RunPodSandboxRequest {
                config: sandbox_config("web", 0),
                runtime_handler: String::new(),
            })
            .await
            .unwrap();

        f.service
            .stop_pod_sandbox(PodSandboxIdRequest {
                pod_sandbox_id: sandbox.pod_sandbox_id.clone(),
            })
            .await
            .unwrap();

        let err = f
            .service
            .create_container(CreateContainerRequest {
                pod_sandbox_id: sandbox.pod_sandbox_id.clone(),
                config: container_config("late", "alpine:latest", &["echo", "x"]),
                sandbox_config: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidState);

        // Stop is idempotent; remove succeeds afterwards
        f.service
            .stop_pod_sandbox(PodSandboxIdRequest {
                pod_sandbox_id: sandbox.pod_sandbox_id.clone(),
            })
            .await
            .unwrap();
        f.service
            .remove_pod_sandbox(PodSandboxIdRequest {
                pod_sandbox_id: sandbox.pod_sandbox_id.clone(),
            })
            .await
            .unwrap();
        assert!(f
            .service
            .pod_sandbox_status(PodSandboxIdRequest {
                pod_sandbox_id: sandbox.pod_sandbox_id,
            })
            .is_err());
    }

    #[tokio::test]
    async fn test_oom_boundary() {
        let f = fixture().await;

        let sandbox = f
            .service
            .run_pod_sandbox(RunPodSandboxRequest {
                config: sandbox_config("oomy", 0),
                runtime_handler: String::new(),
            })
            .await
            .unwrap();

        let mut config = container_config("hog", "alpine:latest", &["stress", "--vm", "1"]);
        config.envs.push(KeyValue {
            key: "SIMULATE_OOM".into(),
            value: "1".into(),
        });
        config.linux = Some(LinuxContainerConfig {
            resources: Some(LinuxContainerResources {
                memory_limit_in_bytes: 64 << 20,
                ..Default::default()
            }),
        });

        let created = f
            .service
            .create_container(CreateContainerRequest {
                pod_sandbox_id: sandbox.pod_sandbox_id,
                config,
                sandbox_config: None,
            })
            .await
            .unwrap();
        f.service
            .start_container(ContainerIdRequest {
                container_id: created.container_id.clone(),
            })
            .await
            .unwrap();

        f.service.engine.wait(&created.container_id).await.unwrap();

        let record = f.service.engine.inspect(&created.container_id).unwrap();
        assert!(record.oom_killed);
        assert_eq!(record.exit_code, Some(137));

        let status = f
            .service
            .container_status(ContainerIdRequest {
                container_id: created.container_id,
            })
            .unwrap();
        assert_eq!(status.status.exit_code, 137);
        assert_eq!(status.status.reason, "OOMKilled");
    }

    #[tokio::test]
    async fn test_vm_loss_recovery_scenario() {
        let f = fixture().await;

        let sandbox = f
            .service
            .run_pod_sandbox(RunPodSandboxRequest {
                config: sandbox_config("web", 0),
                runtime_handler: String::new(),
            })
            .await
            .unwrap();

        let mut config = container_config("svc", "alpine:latest", &["sleep", "3600"]);
        config.annotations.insert("keep".into(), "up".into());
        let created = f
            .service
            .create_container(CreateContainerRequest {
                pod_sandbox_id: sandbox.pod_sandbox_id,
                config,
                sandbox_config: None,
            })
            .await
            .unwrap();
        f.service
            .start_container(ContainerIdRequest {
                container_id: created.container_id.clone(),
            })
            .await
            .unwrap();

        // Kill the guest out from under the daemon
        f.provider.simulate_crash();
        f.service.engine.wait(&created.container_id).await.unwrap();

        let record = f.service.engine.inspect(&created.container_id).unwrap();
        assert_eq!(
            record.state,
            crate::container::ContainerState::Stopped
        );
        assert_eq!(record.exit_code, Some(255));
        assert_eq!(record.reason.as_deref(), Some("vm_lost"));
        assert!(f.vm.in_lost_window());

        // Restarting the VM does not auto-restart the container
        f.vm.ensure_started().await.unwrap();
        assert!(!f.vm.in_lost_window());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let record = f.service.engine.inspect(&created.container_id).unwrap();
        assert_eq!(record.state, crate::container::ContainerState::Stopped);

        // A manual start succeeds
        f.service
            .start_container(ContainerIdRequest {
                container_id: created.container_id.clone(),
            })
            .await
            .unwrap();
        let record = f.service.engine.inspect(&created.container_id).unwrap();
        assert_eq!(record.state, crate::container::ContainerState::Running);
    }

    #[tokio::test]
    async fn test_exec_url_token_flow() {
        let f = fixture().await;

        let sandbox = f
            .service
            .run_pod_sandbox(RunPodSandboxRequest {
                config: sandbox_config("web", 0),
                runtime_handler: String::new(),
            })
            .await
            .unwrap();
        let created = f
            .service
            .create_container(CreateContainerRequest {
                pod_sandbox_id: sandbox.pod_sandbox_id,
                config: container_config("svc", "alpine:latest", &["sleep", "3600"]),
                sandbox_config: None,
            })
            .await
            .unwrap();
        f.service
            .start_container(ContainerIdRequest {
                container_id: created.container_id.clone(),
            })
            .await
            .unwrap();

        let response = f
            .service
            .exec(ExecRequest {
                container_id: created.container_id.clone(),
                cmd: vec!["echo".into(), "hi".into()],
                tty: false,
                stdin: false,
            })
            .unwrap();
        assert!(response.url.contains("/stream/exec/"));

        let token = response.url.rsplit('/').next().unwrap().to_string();
        let op = f.service.hub.claim(&token).unwrap();
        assert!(matches!(op, crate::streaming::PendingOp::Exec { .. }));

        // Single use
        assert!(f.service.hub.claim(&token).is_err());
    }

    #[tokio::test]
    async fn test_image_service_surface() {
        let f = fixture().await;

        let listed = f.service.list_images(ListImagesRequest { filter: None });
        assert_eq!(listed.images.len(), 3);

        let status = f.service.image_status(ImageStatusRequest {
            image: ImageSpec {
                image: "alpine:latest".into(),
            },
            verbose: false,
        });
        assert!(status.image.is_some());

        // Pull of a present reference is a no-op even with a dead fetcher
        let pulled = f
            .service
            .pull_image(PullImageRequest {
                image: ImageSpec {
                    image: "alpine:latest".into(),
                },
            })
            .await
            .unwrap();
        assert_eq!(pulled.image_ref, status.image.unwrap().id);

        // Missing image removal succeeds per contract
        f.service
            .remove_image(RemoveImageRequest {
                image: ImageSpec {
                    image: "ghost:latest".into(),
                },
            })
            .unwrap();

        let fs_info = f.service.image_fs_info();
        assert_eq!(fs_info.image_filesystems.len(), 1);
        assert!(fs_info.image_filesystems[0].used_bytes > 0);
    }
}
