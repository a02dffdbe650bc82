//! CRI v1alpha2 message shapes
//!
//! Reference: https://github.com/kubernetes/cri-api (v1alpha2). Only the
//! fields the runtime consumes are modeled; unknown fields are ignored on
//! input and omitted on output.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Version / status
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct VersionRequest {
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub runtime_name: String,
    pub runtime_version: String,
    pub runtime_api_version: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusRequest {
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Serialize)]
pub struct RuntimeCondition {
    pub r#type: String,
    pub status: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct RuntimeStatus {
    pub conditions: Vec<RuntimeCondition>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: RuntimeStatus,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub info: HashMap<String, String>,
}

// ============================================================================
// Pod sandbox
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSandboxMetadata {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub searches: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(default)]
    pub protocol: i32,
    #[serde(default)]
    pub container_port: i32,
    #[serde(default)]
    pub host_port: i32,
    #[serde(default)]
    pub host_ip: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSandboxConfig {
    pub metadata: PodSandboxMetadata,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub log_directory: String,
    #[serde(default)]
    pub dns_config: Option<DnsConfig>,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct RunPodSandboxRequest {
    pub config: PodSandboxConfig,
    #[serde(default)]
    pub runtime_handler: String,
}

#[derive(Debug, Serialize)]
pub struct RunPodSandboxResponse {
    pub pod_sandbox_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PodSandboxIdRequest {
    pub pod_sandbox_id: String,
}

#[derive(Debug, Serialize)]
pub struct EmptyResponse {}

/// PodSandboxState enum values per the CRI proto
pub const SANDBOX_READY: i32 = 0;
pub const SANDBOX_NOTREADY: i32 = 1;

#[derive(Debug, Serialize)]
pub struct PodSandboxNetworkStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
}

#[derive(Debug, Serialize)]
pub struct PodSandboxStatus {
    pub id: String,
    pub metadata: PodSandboxMetadata,
    pub state: i32,
    pub created_at: i64,
    pub network: PodSandboxNetworkStatus,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct PodSandboxStatusResponse {
    pub status: PodSandboxStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct PodSandboxFilter {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label_selector: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListPodSandboxRequest {
    #[serde(default)]
    pub filter: Option<PodSandboxFilter>,
}

#[derive(Debug, Serialize)]
pub struct PodSandboxSummary {
    pub id: String,
    pub metadata: PodSandboxMetadata,
    pub state: i32,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ListPodSandboxResponse {
    pub items: Vec<PodSandboxSummary>,
}

// ============================================================================
// Containers
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub name: String,
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageSpec {
    pub image: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CriMount {
    #[serde(default)]
    pub container_path: String,
    #[serde(default)]
    pub host_path: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinuxContainerResources {
    #[serde(default)]
    pub cpu_period: i64,
    #[serde(default)]
    pub cpu_quota: i64,
    #[serde(default)]
    pub cpu_shares: i64,
    #[serde(default)]
    pub memory_limit_in_bytes: i64,
    #[serde(default)]
    pub pids_limit: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinuxContainerConfig {
    #[serde(default)]
    pub resources: Option<LinuxContainerResources>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CriContainerConfig {
    pub metadata: ContainerMetadata,
    pub image: ImageSpec,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub envs: Vec<KeyValue>,
    #[serde(default)]
    pub mounts: Vec<CriMount>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub log_path: String,
    #[serde(default)]
    pub stdin: bool,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub linux: Option<LinuxContainerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct CreateContainerRequest {
    pub pod_sandbox_id: String,
    pub config: CriContainerConfig,
    #[serde(default)]
    pub sandbox_config: Option<PodSandboxConfig>,
}

#[derive(Debug, Serialize)]
pub struct CreateContainerResponse {
    pub container_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ContainerIdRequest {
    pub container_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StopContainerRequest {
    pub container_id: String,
    #[serde(default)]
    pub timeout: i64,
}

/// ContainerState enum values per the CRI proto
pub const CONTAINER_CREATED: i32 = 0;
pub const CONTAINER_RUNNING: i32 = 1;
pub const CONTAINER_EXITED: i32 = 2;
pub const CONTAINER_UNKNOWN: i32 = 3;

#[derive(Debug, Default, Deserialize)]
pub struct ContainerFilter {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub pod_sandbox_id: String,
    #[serde(default)]
    pub label_selector: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListContainersRequest {
    #[serde(default)]
    pub filter: Option<ContainerFilter>,
}

#[derive(Debug, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub pod_sandbox_id: String,
    pub metadata: ContainerMetadata,
    pub image: ImageSpec,
    pub image_ref: String,
    pub state: i32,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ListContainersResponse {
    pub containers: Vec<ContainerSummary>,
}

#[derive(Debug, Serialize)]
pub struct ContainerStatus {
    pub id: String,
    pub metadata: ContainerMetadata,
    pub state: i32,
    pub created_at: i64,
    pub started_at: i64,
    pub finished_at: i64,
    pub exit_code: i32,
    pub image: ImageSpec,
    pub image_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub log_path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ContainerStatusResponse {
    pub status: ContainerStatus,
}

#[derive(Debug, Deserialize)]
pub struct UpdateContainerResourcesRequest {
    pub container_id: String,
    #[serde(default)]
    pub linux: Option<LinuxContainerResources>,
}

// ============================================================================
// Exec / attach / port-forward
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ExecSyncRequest {
    pub container_id: String,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub timeout: i64,
}

#[derive(Debug, Serialize)]
pub struct ExecSyncResponse {
    /// Base64-encoded captured output
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub container_id: String,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub stdin: bool,
}

#[derive(Debug, Serialize)]
pub struct StreamUrlResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct AttachRequest {
    pub container_id: String,
    #[serde(default)]
    pub stdin: bool,
    #[serde(default)]
    pub tty: bool,
}

#[derive(Debug, Deserialize)]
pub struct PortForwardRequest {
    pub pod_sandbox_id: String,
    #[serde(default)]
    pub port: Vec<i32>,
}

// ============================================================================
// Image service
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ImageFilter {
    #[serde(default)]
    pub image: Option<ImageSpec>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListImagesRequest {
    #[serde(default)]
    pub filter: Option<ImageFilter>,
}

#[derive(Debug, Serialize)]
pub struct CriImage {
    pub id: String,
    pub repo_tags: Vec<String>,
    #[serde(default)]
    pub repo_digests: Vec<String>,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct ListImagesResponse {
    pub images: Vec<CriImage>,
}

#[derive(Debug, Deserialize)]
pub struct ImageStatusRequest {
    pub image: ImageSpec,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Serialize)]
pub struct ImageStatusResponse {
    pub image: Option<CriImage>,
}

#[derive(Debug, Deserialize)]
pub struct PullImageRequest {
    pub image: ImageSpec,
}

#[derive(Debug, Serialize)]
pub struct PullImageResponse {
    pub image_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct RemoveImageRequest {
    pub image: ImageSpec,
}

#[derive(Debug, Serialize)]
pub struct FilesystemUsage {
    pub timestamp: i64,
    pub storage_path: String,
    pub used_bytes: u64,
    pub inodes_used: u64,
}

#[derive(Debug, Serialize)]
pub struct ImageFsInfoResponse {
    pub image_filesystems: Vec<FilesystemUsage>,
}
