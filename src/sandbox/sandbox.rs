//! Sandbox records

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cluster-unique identity of a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxMetadata {
    pub name: String,
    pub namespace: String,
    pub uid: String,

    /// Attempt counter; a re-run of the same pod bumps it
    #[serde(default)]
    pub attempt: u32,
}

impl SandboxMetadata {
    /// Two sandboxes collide when everything including attempt matches
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.namespace, self.name, self.uid, self.attempt
        )
    }
}

impl Default for SandboxMetadata {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: "default".into(),
            uid: String::new(),
            attempt: 0,
        }
    }
}

/// Sandbox lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxState {
    Ready,
    NotReady,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxState::Ready => write!(f, "ready"),
            SandboxState::NotReady => write!(f, "notready"),
        }
    }
}

/// A pod sandbox record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSandbox {
    /// 64 hex chars
    pub id: String,

    pub metadata: SandboxMetadata,

    pub state: SandboxState,

    pub created_at: DateTime<Utc>,

    /// Opaque handle shared by all member containers
    #[serde(default)]
    pub network_namespace_handle: Option<String>,

    #[serde(default)]
    pub ipc_namespace_handle: Option<String>,

    #[serde(default)]
    pub uts_namespace_handle: Option<String>,

    /// Pod IP assigned by the network plugin
    #[serde(default)]
    pub ip: Option<String>,

    /// "host:container/proto" mappings requested for the pod
    #[serde(default)]
    pub port_mappings: Vec<String>,

    #[serde(default)]
    pub dns_config: Vec<String>,

    #[serde(default)]
    pub hostname: Option<String>,

    pub log_directory: PathBuf,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub annotations: HashMap<String, String>,

    /// Member container ids
    #[serde(default)]
    pub members: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_key_includes_attempt() {
        let a = SandboxMetadata {
            name: "web".into(),
            namespace: "default".into(),
            uid: "u1".into(),
            attempt: 0,
        };
        let mut b = a.clone();
        assert_eq!(a.key(), b.key());

        b.attempt = 1;
        assert_ne!(a.key(), b.key());
    }
}
