//! Container records and the lifecycle state machine

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{ExecutionMode, MountSpec, ResourceLimits};
use crate::error::{DaemonError, Result};

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Stopped,
    Removing,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Stopped => write!(f, "stopped"),
            ContainerState::Removing => write!(f, "removing"),
        }
    }
}

impl ContainerState {
    /// Validate a transition per the lifecycle graph. `remove` is handled
    /// separately because force-removal cuts across states.
    pub fn can_transition(self, next: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Stopped, Running)
        )
    }

    /// Guard used by every mutating operation
    pub fn check_transition(self, next: ContainerState, op: &str, id: &str) -> Result<()> {
        if self.can_transition(next) {
            Ok(())
        } else {
            Err(DaemonError::invalid_state(
                op,
                format!("cannot go from {} to {}", self, next),
            )
            .with_id(id))
        }
    }
}

/// Restart policies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    Always,
    UnlessStopped,
    OnFailure { max: u32 },
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::No
    }
}

impl RestartPolicy {
    /// Parse the Docker-style string form, e.g. "on-failure:3"
    pub fn parse(s: &str) -> Result<Self> {
        let (name, arg) = match s.split_once(':') {
            Some((n, a)) => (n, Some(a)),
            None => (s, None),
        };
        match name {
            "" | "no" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            "on-failure" => {
                let max = arg
                    .map(|a| {
                        a.parse().map_err(|_| {
                            DaemonError::invalid_argument(
                                "restart_policy",
                                format!("bad retry count: {}", a),
                            )
                        })
                    })
                    .transpose()?
                    .unwrap_or(u32::MAX);
                Ok(RestartPolicy::OnFailure { max })
            }
            other => Err(DaemonError::invalid_argument(
                "restart_policy",
                format!("unknown policy: {}", other),
            )),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Check command: `["CMD", ...argv]` or `["CMD-SHELL", script]`
    pub test: Vec<String>,

    /// Seconds between checks
    #[serde(default = "default_health_interval")]
    pub interval: u64,

    /// Seconds before a single check is failed
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,

    /// Consecutive failures before unhealthy
    #[serde(default = "default_health_retries")]
    pub retries: u32,

    /// Grace seconds after start during which failures do not count
    #[serde(default)]
    pub start_period: u64,
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    30
}

fn default_health_retries() -> u32 {
    3
}

/// Health state surfaced in the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    None,
    Starting,
    Healthy,
    Unhealthy,
}

/// Network attachment of a container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerNetwork {
    /// "bridge", "host", "none", or "container:<id>"
    #[serde(default)]
    pub mode: String,

    /// Port mappings "host:container/proto"
    #[serde(default)]
    pub ports: Vec<String>,

    #[serde(default)]
    pub ip: Option<String>,

    #[serde(default)]
    pub mac: Option<String>,

    #[serde(default)]
    pub aliases: Vec<String>,
}

/// User-supplied container configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Entrypoint override; empty means use the image's
    #[serde(default)]
    pub entrypoint: Vec<String>,

    /// Command; empty means use the image's
    #[serde(default)]
    pub cmd: Vec<String>,

    #[serde(default)]
    pub env: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub tty: bool,

    #[serde(default)]
    pub stdin_open: bool,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub dns: Vec<String>,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub restart_policy: RestartPolicy,

    #[serde(default)]
    pub resources: ResourceLimits,

    /// Signal sent first on stop; SIGTERM when unset
    #[serde(default)]
    pub stop_signal: Option<String>,

    /// Default graceful stop timeout in seconds
    #[serde(default)]
    pub stop_timeout: Option<u64>,

    #[serde(default)]
    pub health: Option<HealthConfig>,

    #[serde(default)]
    pub privileged: bool,

    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default)]
    pub seccomp_profile: Option<String>,

    #[serde(default)]
    pub apparmor_profile: Option<String>,
}

/// A container record; the persisted unit of state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// 64 hex chars, process-unique
    pub id: String,

    /// User-facing names, each unique in the daemon
    pub names: Vec<String>,

    /// Image id the rootfs was derived from
    pub image_ref: String,

    /// Image reference as given by the user ("alpine:latest")
    pub image_name: String,

    pub state: ContainerState,

    #[serde(default)]
    pub exit_code: Option<i64>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub oom_killed: bool,

    /// Supervisor was lost and could not be re-attached
    #[serde(default)]
    pub dead: bool,

    #[serde(default)]
    pub health_status: HealthStatus,

    pub config: ContainerConfig,

    /// Fully resolved argv (entrypoint + cmd, image defaults merged)
    pub command: Vec<String>,

    #[serde(default)]
    pub mounts: Vec<MountSpec>,

    #[serde(default)]
    pub network: ContainerNetwork,

    /// Set when the container belongs to a pod
    #[serde(default)]
    pub sandbox_id: Option<String>,

    pub rootfs_path: PathBuf,

    pub log_path: PathBuf,

    pub execution_mode: ExecutionMode,

    /// Host pid of the main process while Running (native path)
    #[serde(default)]
    pub pid: Option<u32>,

    /// Starts performed so far; drives on-failure accounting
    #[serde(default)]
    pub restart_count: u32,

    /// Explicit stop was the last state change (unless-stopped policy)
    #[serde(default)]
    pub stop_requested: bool,

    /// Why the container stopped outside its own exit ("vm_lost",
    /// "supervisor lost")
    #[serde(default)]
    pub reason: Option<String>,

    /// Namespace handle inherited from the sandbox
    #[serde(default)]
    pub network_namespace_handle: Option<String>,
}

impl Container {
    /// Docker-style exit summary, e.g. "Exited (0)"
    pub fn status_line(&self) -> String {
        match self.state {
            ContainerState::Running => match self.started_at {
                Some(at) => format!("Up since {}", at.to_rfc3339()),
                None => "Up".into(),
            },
            ContainerState::Stopped => {
                format!("Exited ({})", self.exit_code.unwrap_or(255))
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_paths() {
        use ContainerState::*;

        assert!(Created.can_transition(Running));
        assert!(Running.can_transition(Paused));
        assert!(Paused.can_transition(Running));
        assert!(Running.can_transition(Stopped));
        assert!(Stopped.can_transition(Running));

        assert!(!Created.can_transition(Paused));
        assert!(!Created.can_transition(Stopped));
        assert!(!Stopped.can_transition(Paused));
        assert!(!Paused.can_transition(Stopped));
        assert!(!Stopped.can_transition(Stopped));
    }

    #[test]
    fn test_check_transition_error_kind() {
        let err = ContainerState::Stopped
            .check_transition(ContainerState::Paused, "pause_container", "abc")
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidState);
        assert_eq!(err.id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_restart_policy_parse() {
        assert_eq!(RestartPolicy::parse("no").unwrap(), RestartPolicy::No);
        assert_eq!(RestartPolicy::parse("").unwrap(), RestartPolicy::No);
        assert_eq!(
            RestartPolicy::parse("always").unwrap(),
            RestartPolicy::Always
        );
        assert_eq!(
            RestartPolicy::parse("unless-stopped").unwrap(),
            RestartPolicy::UnlessStopped
        );
        assert_eq!(
            RestartPolicy::parse("on-failure:3").unwrap(),
            RestartPolicy::OnFailure { max: 3 }
        );
        assert_eq!(
            RestartPolicy::parse("on-failure").unwrap(),
            RestartPolicy::OnFailure { max: u32::MAX }
        );
        assert!(RestartPolicy::parse("sometimes").is_err());
        assert!(RestartPolicy::parse("on-failure:lots").is_err());
    }
}
