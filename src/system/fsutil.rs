//! Filesystem helpers for durable state
//!
//! All index and record writes go through write-temp-then-rename so a crash
//! never leaves a truncated file behind.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DaemonError, Result};

/// Serialize `value` as pretty JSON and atomically replace `path`.
///
/// The temp file lives in the same directory so the rename stays on one
/// filesystem.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| DaemonError::internal("atomic_write", "path has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| DaemonError::internal("atomic_write", e.to_string()))?;

    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("record"),
        std::process::id()
    ));

    std::fs::write(&tmp, &data)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Read and deserialize a JSON file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data)
        .map_err(|e| DaemonError::io("read_json", format!("{}: {}", path.display(), e)))
}

/// Total size in bytes of every regular file under `path`
pub fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        name: String,
        count: u32,
    }

    #[test]
    fn test_atomic_write_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/record.json");

        let record = Record {
            name: "alpine".into(),
            count: 3,
        };
        atomic_write_json(&path, &record).unwrap();

        let loaded: Record = read_json(&path).unwrap();
        assert_eq!(loaded, record);

        // No temp droppings left behind
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_atomic_write_replaces() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("record.json");

        atomic_write_json(&path, &Record { name: "a".into(), count: 1 }).unwrap();
        atomic_write_json(&path, &Record { name: "b".into(), count: 2 }).unwrap();

        let loaded: Record = read_json(&path).unwrap();
        assert_eq!(loaded.name, "b");
    }

    #[test]
    fn test_dir_size() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(temp.path().join("sub")).unwrap();
        std::fs::write(temp.path().join("sub/b"), vec![0u8; 50]).unwrap();

        assert_eq!(dir_size(temp.path()), 150);
    }
}
