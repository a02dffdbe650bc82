//! Image metadata records

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Runtime configuration an image carries for containers derived from it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Environment variables, KEY=VALUE form
    #[serde(default)]
    pub env: Vec<String>,

    /// Default command
    #[serde(default)]
    pub cmd: Vec<String>,

    /// Entrypoint prefix
    #[serde(default)]
    pub entrypoint: Vec<String>,

    /// Working directory
    #[serde(default)]
    pub working_dir: String,

    /// User the process runs as
    #[serde(default)]
    pub user: String,

    /// Exposed ports, "80/tcp" form
    #[serde(default)]
    pub exposed_ports: Vec<String>,

    /// Arbitrary labels
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// A stored image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    /// Content-derived id, 32 hex chars
    pub id: String,

    /// `repository:tag` references; unique across the store
    pub repo_tags: Vec<String>,

    pub created_at: DateTime<Utc>,

    /// Extracted tree size
    pub size_bytes: u64,

    /// Layer ids; a single synthetic layer for tarball imports
    pub layers: Vec<String>,

    /// Materialized read-only tree owned by the store
    pub rootfs_path: PathBuf,

    /// Runtime defaults
    #[serde(default)]
    pub config: ImageConfig,

    /// Containers whose rootfs was derived from this image
    #[serde(default)]
    pub ref_count: u32,
}

impl Image {
    /// Whether `reference` resolves to this image (full id, id prefix, or tag)
    pub fn matches(&self, reference: &str) -> bool {
        if self.id == reference || (reference.len() >= 6 && self.id.starts_with(reference)) {
            return true;
        }
        self.repo_tags.iter().any(|t| t == reference)
    }
}

/// Validate and normalize a `repository:tag` reference.
///
/// A bare repository gets the `latest` tag.
pub fn normalize_reference(reference: &str) -> Option<String> {
    let (repo, tag) = match reference.rsplit_once(':') {
        // A colon followed by a path separator is a port, not a tag
        Some((r, t)) if !t.contains('/') && !r.is_empty() => (r, t),
        _ => (reference, "latest"),
    };

    let re = regex::Regex::new(r"^[a-z0-9]+(?:[._\-/][a-z0-9]+)*$").ok()?;
    let tag_re = regex::Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._\-]{0,127}$").ok()?;

    if re.is_match(repo) && tag_re.is_match(tag) {
        Some(format!("{}:{}", repo, tag))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_reference() {
        assert_eq!(
            normalize_reference("alpine").as_deref(),
            Some("alpine:latest")
        );
        assert_eq!(
            normalize_reference("alpine:3.19").as_deref(),
            Some("alpine:3.19")
        );
        assert_eq!(
            normalize_reference("library/nginx:stable").as_deref(),
            Some("library/nginx:stable")
        );
        assert!(normalize_reference("UPPER:tag").is_none());
        assert!(normalize_reference(":").is_none());
        assert!(normalize_reference("").is_none());
    }

    #[test]
    fn test_matches() {
        let image = Image {
            id: "0123456789abcdef0123456789abcdef".into(),
            repo_tags: vec!["alpine:latest".into()],
            created_at: Utc::now(),
            size_bytes: 0,
            layers: vec![],
            rootfs_path: PathBuf::new(),
            config: ImageConfig::default(),
            ref_count: 0,
        };

        assert!(image.matches("alpine:latest"));
        assert!(image.matches("0123456789abcdef0123456789abcdef"));
        assert!(image.matches("0123456789ab"));
        assert!(!image.matches("0123")); // too short to be a prefix
        assert!(!image.matches("busybox:latest"));
    }
}
