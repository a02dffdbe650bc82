//! On-disk image index
//!
//! `<data_root>/images/index.json` maps ids to metadata. Writes go through
//! temp-file + rename so a crash never leaves a truncated index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};
use crate::system::{atomic_write_json, read_json};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ImageIndex {
    /// id -> metadata
    pub images: HashMap<String, super::Image>,
}

impl ImageIndex {
    /// Load the index, or start empty when the file does not exist yet
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            read_json(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Persist atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)
    }

    /// Resolve a reference (tag, id, or unambiguous id prefix) to an id
    pub fn resolve(&self, reference: &str) -> Option<String> {
        if self.images.contains_key(reference) {
            return Some(reference.to_string());
        }
        // Exactly-one match keeps prefix resolution unambiguous
        let mut matches = self
            .images
            .values()
            .filter(|img| img.matches(reference))
            .map(|img| img.id.clone());
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// The id a tag currently points at, if any
    pub fn id_for_tag(&self, tag: &str) -> Option<String> {
        self.images
            .values()
            .find(|img| img.repo_tags.iter().any(|t| t == tag))
            .map(|img| img.id.clone())
    }

    /// All materialized directories the index knows about
    pub fn known_dirs(&self) -> Vec<PathBuf> {
        self.images.values().map(|i| i.rootfs_path.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Result<&super::Image> {
        self.images
            .get(id)
            .ok_or_else(|| DaemonError::not_found("image_lookup", id))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut super::Image> {
        self.images
            .get_mut(id)
            .ok_or_else(|| DaemonError::not_found("image_lookup", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Image, ImageConfig};
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample(id: &str, tags: &[&str]) -> Image {
        Image {
            id: id.into(),
            repo_tags: tags.iter().map(|s| s.to_string()).collect(),
            created_at: Utc::now(),
            size_bytes: 1,
            layers: vec![format!("sha256:{}", id)],
            rootfs_path: PathBuf::from(format!("/images/{}", id)),
            config: ImageConfig::default(),
            ref_count: 0,
        }
    }

    #[test]
    fn test_load_save_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("index.json");

        let mut index = ImageIndex::default();
        index
            .images
            .insert("aaaa".into(), sample("aaaa", &["alpine:latest"]));
        index.save(&path).unwrap();

        let loaded = ImageIndex::load(&path).unwrap();
        assert_eq!(loaded.images.len(), 1);
        assert_eq!(loaded.images["aaaa"].repo_tags, vec!["alpine:latest"]);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let temp = TempDir::new().unwrap();
        let index = ImageIndex::load(&temp.path().join("index.json")).unwrap();
        assert!(index.images.is_empty());
    }

    #[test]
    fn test_resolve() {
        let mut index = ImageIndex::default();
        index.images.insert(
            "0123456789abcdef0123456789abcdef".into(),
            sample("0123456789abcdef0123456789abcdef", &["alpine:latest"]),
        );

        assert_eq!(
            index.resolve("alpine:latest").as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
        assert_eq!(
            index.resolve("0123456789ab").as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
        assert!(index.resolve("nope:latest").is_none());
    }

    #[test]
    fn test_resolve_ambiguous_prefix() {
        let mut index = ImageIndex::default();
        index.images.insert(
            "abcdef111111111111111111111111".into(),
            sample("abcdef111111111111111111111111", &["one:latest"]),
        );
        index.images.insert(
            "abcdef222222222222222222222222".into(),
            sample("abcdef222222222222222222222222", &["two:latest"]),
        );

        assert!(index.resolve("abcdef").is_none());
    }
}
