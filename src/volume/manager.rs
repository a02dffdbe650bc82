//! Named volume manager
//!
//! Volumes live under `<data_root>/volumes/<name>/` with a `volume.json`
//! metadata file beside a `data/` mountpoint directory.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DaemonError, Result};
use crate::events::{EventBus, EventType};
use crate::system::{atomic_write_json, dir_size, read_json};

/// A named volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,

    /// Only the "local" driver is built in
    pub driver: String,

    /// Directory bind-mounted into containers
    pub mountpoint: PathBuf,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    pub created_at: DateTime<Utc>,

    /// Containers currently mounting this volume
    #[serde(default)]
    pub ref_count: u32,
}

/// Manager for named volumes
pub struct VolumeManager {
    /// `<data_root>/volumes`
    root: PathBuf,

    volumes: DashMap<String, Volume>,

    event_bus: EventBus,
}

impl VolumeManager {
    /// Open the manager, rehydrating volume records from disk
    pub fn open(root: PathBuf, event_bus: EventBus) -> Result<Self> {
        std::fs::create_dir_all(&root)?;

        let volumes = DashMap::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let meta_path = entry.path().join("volume.json");
            if meta_path.exists() {
                let volume: Volume = read_json(&meta_path)?;
                volumes.insert(volume.name.clone(), volume);
            }
        }

        Ok(Self {
            root,
            volumes,
            event_bus,
        })
    }

    fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name.len() <= 128
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if valid {
            Ok(())
        } else {
            Err(DaemonError::invalid_argument(
                "create_volume",
                format!("invalid volume name: {}", name),
            ))
        }
    }

    /// Create a volume. Creating an existing name returns the existing
    /// volume when labels match the request, `Conflict` otherwise.
    pub fn create(&self, name: &str, labels: HashMap<String, String>) -> Result<Volume> {
        Self::validate_name(name)?;

        if let Some(existing) = self.volumes.get(name) {
            if existing.labels == labels {
                return Ok(existing.clone());
            }
            return Err(DaemonError::conflict(
                "create_volume",
                format!("volume {} already exists", name),
            )
            .with_id(name));
        }

        let dir = self.root.join(name);
        let mountpoint = dir.join("data");
        std::fs::create_dir_all(&mountpoint)?;

        let volume = Volume {
            name: name.to_string(),
            driver: "local".into(),
            mountpoint,
            labels,
            created_at: Utc::now(),
            ref_count: 0,
        };

        atomic_write_json(&dir.join("volume.json"), &volume)?;
        self.volumes.insert(name.to_string(), volume.clone());

        info!("created volume {}", name);
        self.event_bus.emit(EventType::Volume, "create", name);
        Ok(volume)
    }

    /// Look up a volume, creating it on first use (anonymous mounts)
    pub fn get_or_create(&self, name: &str) -> Result<Volume> {
        match self.volumes.get(name) {
            Some(v) => Ok(v.clone()),
            None => self.create(name, HashMap::new()),
        }
    }

    pub fn inspect(&self, name: &str) -> Result<Volume> {
        self.volumes
            .get(name)
            .map(|v| v.clone())
            .ok_or_else(|| DaemonError::not_found("inspect_volume", name))
    }

    pub fn list(&self) -> Vec<Volume> {
        let mut volumes: Vec<Volume> = self.volumes.iter().map(|v| v.clone()).collect();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        volumes
    }

    /// Remove a volume. Requires `ref_count == 0` unless `force`.
    pub fn remove(&self, name: &str, force: bool) -> Result<()> {
        let volume = self.inspect(name)?;

        if volume.ref_count > 0 && !force {
            return Err(DaemonError::in_use(
                "remove_volume",
                format!("volume {} is mounted by {} container(s)", name, volume.ref_count),
            )
            .with_id(name));
        }

        std::fs::remove_dir_all(self.root.join(name))?;
        self.volumes.remove(name);

        info!("removed volume {}", name);
        self.event_bus.emit(EventType::Volume, "remove", name);
        Ok(())
    }

    /// Bump the mount reference for a container attach
    pub fn acquire(&self, name: &str) -> Result<()> {
        let mut volume = self
            .volumes
            .get_mut(name)
            .ok_or_else(|| DaemonError::not_found("acquire_volume", name))?;
        volume.ref_count += 1;
        atomic_write_json(&self.root.join(name).join("volume.json"), volume.value())?;
        Ok(())
    }

    /// Drop the mount reference on container removal
    pub fn release(&self, name: &str) -> Result<()> {
        if let Some(mut volume) = self.volumes.get_mut(name) {
            volume.ref_count = volume.ref_count.saturating_sub(1);
            atomic_write_json(&self.root.join(name).join("volume.json"), volume.value())?;
        }
        Ok(())
    }

    /// Aggregate disk usage for `/system/df`
    pub fn disk_usage(&self) -> (usize, u64) {
        let count = self.volumes.len();
        let bytes = self
            .volumes
            .iter()
            .map(|v| dir_size(&v.mountpoint))
            .sum();
        (count, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_manager(temp: &TempDir) -> VolumeManager {
        VolumeManager::open(temp.path().join("volumes"), EventBus::new()).unwrap()
    }

    #[test]
    fn test_create_and_inspect() {
        let temp = TempDir::new().unwrap();
        let manager = new_manager(&temp);

        let volume = manager.create("data", HashMap::new()).unwrap();
        assert_eq!(volume.driver, "local");
        assert!(volume.mountpoint.exists());

        let inspected = manager.inspect("data").unwrap();
        assert_eq!(inspected.name, "data");
    }

    #[test]
    fn test_create_conflict_on_label_mismatch() {
        let temp = TempDir::new().unwrap();
        let manager = new_manager(&temp);

        manager.create("data", HashMap::new()).unwrap();
        // Same request is idempotent
        manager.create("data", HashMap::new()).unwrap();

        let mut labels = HashMap::new();
        labels.insert("env".into(), "prod".into());
        let err = manager.create("data", labels).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn test_remove_in_use() {
        let temp = TempDir::new().unwrap();
        let manager = new_manager(&temp);

        manager.create("data", HashMap::new()).unwrap();
        manager.acquire("data").unwrap();

        let err = manager.remove("data", false).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InUse);

        // force overrides
        manager.remove("data", true).unwrap();
        assert!(manager.inspect("data").is_err());
    }

    #[test]
    fn test_rehydrate() {
        let temp = TempDir::new().unwrap();
        {
            let manager = new_manager(&temp);
            manager.create("data", HashMap::new()).unwrap();
        }

        let manager = new_manager(&temp);
        assert_eq!(manager.list().len(), 1);
        assert_eq!(manager.list()[0].name, "data");
    }

    #[test]
    fn test_invalid_name() {
        let temp = TempDir::new().unwrap();
        let manager = new_manager(&temp);
        assert!(manager.create("../escape", HashMap::new()).is_err());
        assert!(manager.create("", HashMap::new()).is_err());
    }
}
