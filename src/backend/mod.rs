//! Execution backend abstraction
//!
//! The lifecycle engine is agnostic of how a container process actually runs.
//! A backend receives a fully resolved [`ExecSpec`] and supervises the
//! process: native Linux isolation, the VM dispatcher, or the portable
//! process backend used in development mode.

mod process;

#[cfg(target_os = "linux")]
mod native;

pub use process::ProcessBackend;

#[cfg(target_os = "linux")]
pub use native::NativeBackend;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Error type for backend operations
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Container process not found: {0}")]
    NotFound(String),

    #[error("Container process already running: {0}")]
    AlreadyRunning(String),

    #[error("Container process not running: {0}")]
    NotRunning(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out")]
    Timeout,

    #[error("Execution environment unavailable: {0}")]
    Unavailable(String),

    #[error("Isolation setup failed: {0}")]
    Isolation(String),

    #[error("Command not executable: {0}")]
    NotExecutable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

impl From<BackendError> for crate::error::DaemonError {
    fn from(e: BackendError) -> Self {
        use crate::error::{DaemonError, ErrorKind};
        let kind = match &e {
            BackendError::NotFound(_) => ErrorKind::NotFound,
            BackendError::AlreadyRunning(_) | BackendError::NotRunning(_) => {
                ErrorKind::InvalidState
            }
            BackendError::Cancelled | BackendError::Timeout => ErrorKind::Timeout,
            BackendError::Unavailable(_) => ErrorKind::Unavailable,
            BackendError::Isolation(_) => ErrorKind::PermissionDenied,
            BackendError::NotExecutable(_) => ErrorKind::InvalidArgument,
            BackendError::Io(_) => ErrorKind::Io,
            BackendError::Other(_) => ErrorKind::Internal,
        };
        DaemonError::new(kind, "backend", e.to_string())
    }
}

/// Which execution path a container runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Native,
    Vm,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Native => write!(f, "native"),
            ExecutionMode::Vm => write!(f, "vm"),
        }
    }
}

/// A mount applied inside the container, in declaration order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub target: String,

    /// "bind", "volume" or "tmpfs"
    pub kind: MountKind,

    #[serde(default)]
    pub readonly: bool,

    /// Bind propagation: "private", "rslave", "rshared"
    #[serde(default)]
    pub propagation: Option<String>,

    /// Size cap for tmpfs mounts, bytes
    #[serde(default)]
    pub tmpfs_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

/// Resource limits applied before the first exec
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Hard memory cap in bytes (0 = unlimited)
    #[serde(default)]
    pub memory_bytes: u64,

    /// Relative CPU weight
    #[serde(default)]
    pub cpu_shares: u64,

    /// CFS bandwidth: quota in microseconds per period (0 = unlimited)
    #[serde(default)]
    pub cpu_quota: i64,

    #[serde(default)]
    pub cpu_period: i64,

    /// Task cap (0 = unlimited)
    #[serde(default)]
    pub pids_limit: i64,

    /// Block I/O weight (10-1000, 0 = default)
    #[serde(default)]
    pub blkio_weight: u16,
}

/// Network attachment for the spec
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// "bridge", "host", "none", or "container:<id>"
    #[serde(default)]
    pub mode: String,

    /// Opaque handle of the sandbox network namespace to join, if any
    #[serde(default)]
    pub namespace_handle: Option<String>,

    #[serde(default)]
    pub dns: Vec<String>,

    #[serde(default)]
    pub hostname: Option<String>,
}

/// Fully resolved execution spec handed to a backend.
///
/// Serializable so the VM path can forward it to the in-guest agent
/// unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSpec {
    /// Container id
    pub id: String,

    /// Writable rootfs prepared by the image store
    pub rootfs: PathBuf,

    /// argv, entrypoint already merged
    pub command: Vec<String>,

    /// KEY=VALUE pairs
    #[serde(default)]
    pub env: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    /// "uid[:gid]" or a user name resolvable inside the rootfs
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub tty: bool,

    #[serde(default)]
    pub stdin_open: bool,

    #[serde(default)]
    pub mounts: Vec<MountSpec>,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub network: NetworkSpec,

    /// Capabilities to retain after the drop; empty = default minimal set
    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default)]
    pub privileged: bool,

    /// Seccomp profile name; absence is non-fatal
    #[serde(default)]
    pub seccomp_profile: Option<String>,

    /// AppArmor profile name; absence is non-fatal
    #[serde(default)]
    pub apparmor_profile: Option<String>,

    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Stdout/stderr discriminator for captured output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StdStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StdStream::Stdout => write!(f, "stdout"),
            StdStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Callback invoked with every captured output chunk
pub type OutputCallback = Arc<dyn Fn(StdStream, &[u8]) + Send + Sync>;

/// Exit information for a finished process
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExitStatus {
    pub exit_code: i64,

    /// Process was killed by the memory limit
    #[serde(default)]
    pub oom_killed: bool,

    /// The VM hosting the container disappeared; restart-policy evaluation
    /// is suppressed for this exit
    #[serde(default)]
    pub vm_lost: bool,
}

impl ExitStatus {
    pub fn clean(exit_code: i64) -> Self {
        Self {
            exit_code,
            ..Default::default()
        }
    }

    pub fn oom() -> Self {
        Self {
            exit_code: 137,
            oom_killed: true,
            ..Default::default()
        }
    }

    pub fn lost_vm() -> Self {
        Self {
            exit_code: 255,
            oom_killed: false,
            vm_lost: true,
        }
    }
}

/// Handle returned by `start`
#[derive(Debug, Clone)]
pub struct StartedProcess {
    /// Host pid, when the backend has one
    pub pid: Option<u32>,
}

/// A live exec session with bidirectional streams
pub struct ExecSession {
    /// Write end of the process stdin; drop to half-close (EOF)
    pub stdin: Option<mpsc::Sender<Bytes>>,

    /// Captured output chunks in arrival order
    pub output: mpsc::Receiver<(StdStream, Bytes)>,

    /// Resolves once with the exit status
    pub exit: oneshot::Receiver<ExitStatus>,
}

/// Point-in-time resource usage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStats {
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub cpu_nanos: u64,
    pub pids: u64,
}

/// Execution backend contract.
///
/// One backend instance serves every container on its path; per-container
/// state is keyed by container id.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    /// The execution mode this backend represents
    fn mode(&self) -> ExecutionMode;

    /// Start the container main process. Output chunks flow through
    /// `output` until exit.
    async fn start(&self, spec: &ExecSpec, output: OutputCallback)
        -> BackendResult<StartedProcess>;

    /// Await the main process exit. Resolves immediately if it already
    /// exited; errors with `NotFound` if the container was never started.
    async fn wait(&self, container_id: &str) -> BackendResult<ExitStatus>;

    /// Deliver a signal ("SIGTERM", "SIGKILL", ...) to the main process
    async fn signal(&self, container_id: &str, signal: &str) -> BackendResult<()>;

    /// Freeze all tasks
    async fn pause(&self, container_id: &str) -> BackendResult<()>;

    /// Thaw all tasks
    async fn resume(&self, container_id: &str) -> BackendResult<()>;

    /// Run an auxiliary command inside the container
    async fn exec(
        &self,
        container_id: &str,
        command: Vec<String>,
        env: Vec<String>,
        tty: bool,
    ) -> BackendResult<ExecSession>;

    /// Open stdin of the running main process, when `stdin_open` was set
    async fn attach_stdin(&self, container_id: &str) -> BackendResult<mpsc::Sender<Bytes>>;

    /// Resource usage snapshot
    async fn stats(&self, container_id: &str) -> BackendResult<ContainerStats>;

    /// Liveness probe used by live-restore after a daemon restart. The pid
    /// hint is the last persisted host pid, when one exists.
    async fn is_alive(&self, container_id: &str, pid: Option<u32>) -> BackendResult<bool>;

    /// Update resource limits of a running container, when supported
    async fn update_resources(
        &self,
        container_id: &str,
        resources: &ResourceLimits,
    ) -> BackendResult<()>;
}

/// Parse a signal name to its number. Accepts "SIGKILL", "KILL" and "9".
pub fn parse_signal(signal: &str) -> Option<i32> {
    if let Ok(n) = signal.parse::<i32>() {
        return (n > 0 && n < 65).then_some(n);
    }
    let name = signal.trim_start_matches("SIG").to_ascii_uppercase();
    let n = match name.as_str() {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "KILL" => 9,
        "USR1" => 10,
        "USR2" => 12,
        "TERM" => 15,
        "STOP" => 19,
        "CONT" => 18,
        "WINCH" => 28,
        _ => return None,
    };
    Some(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal("SIGTERM"), Some(15));
        assert_eq!(parse_signal("KILL"), Some(9));
        assert_eq!(parse_signal("9"), Some(9));
        assert_eq!(parse_signal("SIGWAT"), None);
        assert_eq!(parse_signal("0"), None);
    }

    #[test]
    fn test_exec_spec_roundtrips_through_json() {
        let spec = ExecSpec {
            id: "c1".into(),
            rootfs: PathBuf::from("/data/containers/c1/rootfs"),
            command: vec!["echo".into(), "hello".into()],
            env: vec!["PATH=/bin".into()],
            working_dir: Some("/".into()),
            user: None,
            tty: false,
            stdin_open: false,
            mounts: vec![MountSpec {
                source: "/tmp/data".into(),
                target: "/data".into(),
                kind: MountKind::Bind,
                readonly: true,
                propagation: None,
                tmpfs_size: None,
            }],
            resources: ResourceLimits {
                memory_bytes: 64 << 20,
                ..Default::default()
            },
            network: NetworkSpec::default(),
            capabilities: vec![],
            privileged: false,
            seccomp_profile: None,
            apparmor_profile: None,
            labels: HashMap::new(),
        };

        let json = serde_json::to_string(&spec).unwrap();
        let back: ExecSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.command, spec.command);
        assert_eq!(back.mounts.len(), 1);
        assert_eq!(back.resources.memory_bytes, 64 << 20);
    }
}
