//! Configuration structures and loading

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// CRI service configuration
    #[serde(default)]
    pub cri: CriConfiguration,

    /// Docker-compatible REST API configuration
    #[serde(default)]
    pub api: ApiConfiguration,

    /// System paths and settings
    #[serde(default)]
    pub system: SystemConfiguration,

    /// Runtime behavior tuning
    #[serde(default)]
    pub runtime: RuntimeConfiguration,

    /// VM mode configuration
    #[serde(default)]
    pub vm: VmConfiguration,

    /// Network plugin integration
    #[serde(default)]
    pub network: NetworkConfiguration,

    /// Image registry endpoint for the default fetcher
    #[serde(default)]
    pub registry: RegistryConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file, then overlay environment
    /// variables. CLI flags are applied afterwards by the caller.
    pub fn load(path: &str) -> Result<Self> {
        let config_path = std::path::Path::new(path);

        let mut config: Configuration = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file: {}", path))?;
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?
        } else {
            // Missing file means defaults; flags/env can still override
            Configuration::default()
        };

        // Resolve relative paths against the config file's parent directory
        let base_dir = config_path
            .parent()
            .and_then(|p| {
                if p.as_os_str().is_empty() {
                    None
                } else {
                    Some(p)
                }
            })
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        config.system.resolve_paths(&base_dir);
        config.apply_env();

        // Ensure directories exist
        std::fs::create_dir_all(&config.system.data_root)?;
        std::fs::create_dir_all(&config.system.state_root)?;
        std::fs::create_dir_all(config.system.images_dir())?;
        std::fs::create_dir_all(config.system.containers_dir())?;
        std::fs::create_dir_all(config.system.sandboxes_dir())?;
        std::fs::create_dir_all(config.system.volumes_dir())?;

        Ok(config)
    }

    /// Overlay `SERVIN_*` environment variables onto the loaded file values
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("SERVIN_DEBUG") {
            self.debug = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("SERVIN_DATA_ROOT") {
            self.system.data_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SERVIN_STATE_ROOT") {
            self.system.state_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SERVIN_CRI_SOCKET") {
            self.cri.socket = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SERVIN_API_SOCKET") {
            self.api.socket = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SERVIN_API_TCP") {
            self.api.tcp_bind = Some(v);
        }
        if let Ok(v) = std::env::var("SERVIN_VM_PROVIDER") {
            self.vm.provider = Some(v);
        }
        if let Ok(v) = std::env::var("SERVIN_VM_MODE") {
            self.vm.enabled = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("SERVIN_DEV_MODE") {
            self.vm.development = matches!(v.as_str(), "1" | "true" | "yes");
        }
    }
}

/// CRI service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CriConfiguration {
    /// Unix socket the CRI service listens on
    #[serde(default = "default_cri_socket")]
    pub socket: PathBuf,

    /// Grace window for streaming tokens, in seconds
    #[serde(default = "default_stream_token_grace")]
    pub stream_token_grace: u64,
}

impl Default for CriConfiguration {
    fn default() -> Self {
        Self {
            socket: default_cri_socket(),
            stream_token_grace: default_stream_token_grace(),
        }
    }
}

fn default_cri_socket() -> PathBuf {
    PathBuf::from("/var/run/servin/servin.sock")
}

fn default_stream_token_grace() -> u64 {
    60
}

/// Authentication mode for the REST API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    Tls,
    Bearer,
    ApiKey,
}

/// REST API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfiguration {
    /// Unix socket for the Docker-compatible API
    #[serde(default = "default_api_socket")]
    pub socket: PathBuf,

    /// Optional TCP bind, e.g. "0.0.0.0:2375"
    #[serde(default)]
    pub tcp_bind: Option<String>,

    /// TLS configuration for the TCP listener
    #[serde(default)]
    pub tls: TlsConfiguration,

    /// Authentication mode
    #[serde(default)]
    pub auth: AuthMode,

    /// Bearer token / API key value when auth requires one
    #[serde(default)]
    pub auth_token: String,

    /// Header name for api-key auth
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            socket: default_api_socket(),
            tcp_bind: None,
            tls: TlsConfiguration::default(),
            auth: AuthMode::None,
            auth_token: String::new(),
            api_key_header: default_api_key_header(),
        }
    }
}

fn default_api_socket() -> PathBuf {
    PathBuf::from("/var/run/servin.sock")
}

fn default_api_key_header() -> String {
    "X-Api-Key".into()
}

/// TLS configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfiguration {
    /// Enable TLS on the TCP listener
    #[serde(default)]
    pub enabled: bool,

    /// Path to certificate file
    #[serde(default)]
    pub cert: String,

    /// Path to key file
    #[serde(default)]
    pub key: String,
}

/// System paths and settings
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfiguration {
    /// Root directory for persistent data
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Root directory for runtime state (markers, pid files)
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,
}

impl SystemConfiguration {
    /// Resolve relative paths against the given base directory
    pub fn resolve_paths(&mut self, base_dir: &std::path::Path) {
        self.data_root = Self::resolve_path(&self.data_root, base_dir);
        self.state_root = Self::resolve_path(&self.state_root, base_dir);
    }

    fn resolve_path(path: &std::path::Path, base_dir: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            let resolved = base_dir.join(path);
            resolved
                .canonicalize()
                .unwrap_or_else(|_| Self::normalize_path(&resolved))
        }
    }

    /// Resolve `.` and `..` without requiring the path to exist
    fn normalize_path(path: &std::path::Path) -> PathBuf {
        let mut components = Vec::new();
        for component in path.components() {
            match component {
                std::path::Component::ParentDir => {
                    components.pop();
                }
                std::path::Component::CurDir => {}
                c => components.push(c),
            }
        }
        components.iter().collect()
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_root.join("images")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.data_root.join("containers")
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.data_root.join("sandboxes")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.data_root.join("volumes")
    }

    /// Marker file denoting "VM should be running" across daemon restarts
    pub fn vm_running_marker(&self) -> PathBuf {
        self.state_root.join("vm-running")
    }
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            state_root: default_state_root(),
        }
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from(".servin/data")
}

fn default_state_root() -> PathBuf {
    PathBuf::from(".servin/state")
}

/// Runtime behavior tuning
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfiguration {
    /// Default graceful stop timeout in seconds
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,

    /// Use an overlay upper dir instead of copy-up on the Linux native path
    #[serde(default)]
    pub overlay_rootfs: bool,

    /// Frames buffered per direction on streaming endpoints
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,

    /// Log file rotation threshold in bytes
    #[serde(default = "default_log_rotate_bytes")]
    pub log_rotate_bytes: u64,
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        Self {
            stop_timeout: default_stop_timeout(),
            overlay_rootfs: false,
            stream_buffer: default_stream_buffer(),
            log_rotate_bytes: default_log_rotate_bytes(),
        }
    }
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_stream_buffer() -> usize {
    64
}

fn default_log_rotate_bytes() -> u64 {
    16 * 1024 * 1024
}

/// VM mode configuration
#[derive(Debug, Clone, Deserialize)]
pub struct VmConfiguration {
    /// Force VM mode even on Linux
    #[serde(default)]
    pub enabled: bool,

    /// Explicit provider override: "applevz", "hyperv", "kvm", "development"
    #[serde(default)]
    pub provider: Option<String>,

    /// Development mode: simulate VM behavior without a hypervisor
    #[serde(default)]
    pub development: bool,

    /// Guest CPU count
    #[serde(default = "default_vm_cpus")]
    pub cpus: u32,

    /// Guest memory in MB
    #[serde(default = "default_vm_memory_mb")]
    pub memory_mb: u64,

    /// Guest disk in GB
    #[serde(default = "default_vm_disk_gb")]
    pub disk_gb: u64,

    /// Host port forwarded to the guest SSH port
    #[serde(default = "default_vm_ssh_port")]
    pub ssh_port: u16,

    /// Host port forwarded to the in-guest agent
    #[serde(default = "default_vm_agent_port")]
    pub agent_port: u16,

    /// Path to the guest base image
    #[serde(default)]
    pub base_image_path: Option<PathBuf>,
}

impl Default for VmConfiguration {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: None,
            development: false,
            cpus: default_vm_cpus(),
            memory_mb: default_vm_memory_mb(),
            disk_gb: default_vm_disk_gb(),
            ssh_port: default_vm_ssh_port(),
            agent_port: default_vm_agent_port(),
            base_image_path: None,
        }
    }
}

fn default_vm_cpus() -> u32 {
    2
}

fn default_vm_memory_mb() -> u64 {
    2048
}

fn default_vm_disk_gb() -> u64 {
    16
}

fn default_vm_ssh_port() -> u16 {
    2222
}

fn default_vm_agent_port() -> u16 {
    7777
}

/// Network plugin integration contract
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfiguration {
    /// External CNI plugin binary invoked for sandbox network setup
    #[serde(default)]
    pub network_plugin: Option<PathBuf>,

    /// DNS servers handed to containers
    #[serde(default)]
    pub dns: Vec<String>,

    /// Bridge subnet used when no plugin is configured
    #[serde(default = "default_bridge_subnet")]
    pub bridge_subnet: String,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            network_plugin: None,
            dns: Vec::new(),
            bridge_subnet: default_bridge_subnet(),
        }
    }
}

fn default_bridge_subnet() -> String {
    "10.88.0.0/16".into()
}

/// Registry fetcher configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfiguration {
    /// Base URL the default HTTP fetcher resolves references against
    #[serde(default = "default_registry_base_url")]
    pub base_url: String,
}

impl Default for RegistryConfiguration {
    fn default() -> Self {
        Self {
            base_url: default_registry_base_url(),
        }
    }
}

fn default_registry_base_url() -> String {
    "https://images.servin.dev".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Configuration::default();
        assert_eq!(config.cri.socket, PathBuf::from("/var/run/servin/servin.sock"));
        assert_eq!(config.runtime.stop_timeout, 10);
        assert_eq!(config.runtime.stream_buffer, 64);
        assert_eq!(config.vm.cpus, 2);
        assert_eq!(config.api.auth, AuthMode::None);
    }

    #[test]
    fn test_parse_toml() {
        let parsed: Configuration = toml::from_str(
            r#"
            debug = true

            [system]
            data_root = "/tmp/servin/data"

            [vm]
            enabled = true
            provider = "development"
            memory_mb = 4096

            [api]
            tcp_bind = "127.0.0.1:2375"
            auth = "bearer"
            auth_token = "secret"
            "#,
        )
        .unwrap();

        assert!(parsed.debug);
        assert_eq!(parsed.system.data_root, PathBuf::from("/tmp/servin/data"));
        assert!(parsed.vm.enabled);
        assert_eq!(parsed.vm.provider.as_deref(), Some("development"));
        assert_eq!(parsed.vm.memory_mb, 4096);
        assert_eq!(parsed.api.auth, AuthMode::Bearer);
        assert_eq!(parsed.api.auth_token, "secret");
    }

    #[test]
    fn test_layout_paths() {
        let system = SystemConfiguration {
            data_root: PathBuf::from("/data"),
            state_root: PathBuf::from("/state"),
        };
        assert_eq!(system.images_dir(), PathBuf::from("/data/images"));
        assert_eq!(system.containers_dir(), PathBuf::from("/data/containers"));
        assert_eq!(system.sandboxes_dir(), PathBuf::from("/data/sandboxes"));
        assert_eq!(system.volumes_dir(), PathBuf::from("/data/volumes"));
        assert_eq!(system.vm_running_marker(), PathBuf::from("/state/vm-running"));
    }

    #[test]
    fn test_normalize_path() {
        let normalized =
            SystemConfiguration::normalize_path(std::path::Path::new("/a/b/../c/./d"));
        assert_eq!(normalized, PathBuf::from("/a/c/d"));
    }
}
