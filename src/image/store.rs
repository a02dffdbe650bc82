//! Image store
//!
//! Owns `<data_root>/images/`: the metadata index and one materialized tree
//! per image. Serves rootfs allocation for containers on both execution
//! paths.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{DaemonError, Result};
use crate::events::{EventBus, EventType};
use crate::system::{dir_size, new_image_id};

use super::import;
use super::index::ImageIndex;
use super::metadata::normalize_reference;
use super::{Image, ImageConfig, ImageFetcher};

/// Content-addressable image store
pub struct ImageStore {
    /// `<data_root>/images`
    root: PathBuf,

    /// In-memory index, mirrored to `index.json` on every write
    index: RwLock<ImageIndex>,

    event_bus: EventBus,

    /// Answers "does a Running container derive its rootfs from this image
    /// id". Installed once the lifecycle engine exists; removal refuses such
    /// images even with `force`.
    running_probe: RwLock<Option<Box<dyn Fn(&str) -> bool + Send + Sync>>>,
}

impl ImageStore {
    /// Open the store, loading the index and garbage-collecting orphaned
    /// directories (materialized trees without index entries).
    pub fn open(root: PathBuf, event_bus: EventBus) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        let index = ImageIndex::load(&root.join("index.json"))?;

        let store = Self {
            root,
            index: RwLock::new(index),
            event_bus,
            running_probe: RwLock::new(None),
        };
        store.collect_orphans()?;
        Ok(store)
    }

    /// Install the running-container probe. The daemon wires this after
    /// building the lifecycle engine; until then removal only enforces
    /// ref_count.
    pub fn set_running_probe(&self, probe: Box<dyn Fn(&str) -> bool + Send + Sync>) {
        *self.running_probe.write() = Some(probe);
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    /// Remove materialized directories the index does not reference
    fn collect_orphans(&self) -> Result<()> {
        let known: Vec<PathBuf> = self.index.read().known_dirs();

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if !known.iter().any(|k| k == &path) {
                warn!("garbage-collecting orphaned image dir {}", path.display());
                std::fs::remove_dir_all(&path)?;
            }
        }
        Ok(())
    }

    /// Import a gzip tarball under `reference`.
    ///
    /// Idempotent: re-importing identical content attaches the tag to the
    /// existing entry. A tag can point at exactly one id, so retagging moves
    /// the tag off the previous image.
    pub async fn import(&self, tarball: &Path, reference: &str) -> Result<Image> {
        let reference = normalize_reference(reference).ok_or_else(|| {
            DaemonError::invalid_argument("import_image", format!("invalid reference: {}", reference))
        })?;

        let tarball = tarball.to_path_buf();
        let digest = {
            let tarball = tarball.clone();
            tokio::task::spawn_blocking(move || import::content_digest(&tarball))
                .await
                .map_err(|e| DaemonError::internal("import_image", e.to_string()))??
        };
        let id = new_image_id(&reference, &digest);

        // Existing content: just attach the tag
        {
            let mut index = self.index.write();
            if index.images.contains_key(&id) {
                Self::detach_tag(&mut index, &reference, &id);
                let image = index.get_mut(&id)?;
                if !image.repo_tags.iter().any(|t| t == &reference) {
                    image.repo_tags.push(reference.clone());
                }
                index.save(&self.index_path())?;
                info!("image {} already present, tagged {}", id, reference);
                return index.get(&id).cloned();
            }
        }

        let dest = self.root.join(&id);
        let extract_dest = dest.clone();
        let extract_tarball = tarball.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            import::extract_tarball(&extract_tarball, &extract_dest)
        })
        .await
        .map_err(|e| DaemonError::internal("import_image", e.to_string()))?;

        let entries = match extracted {
            Ok(n) => n,
            Err(e) => {
                // Partial trees never survive a failed import
                let _ = std::fs::remove_dir_all(&dest);
                return Err(e);
            }
        };

        let image = Image {
            id: id.clone(),
            repo_tags: vec![reference.clone()],
            created_at: chrono::Utc::now(),
            size_bytes: dir_size(&dest),
            layers: vec![format!("sha256:{}", hex::encode(&digest))],
            rootfs_path: dest,
            config: ImageConfig::default(),
            ref_count: 0,
        };

        {
            let mut index = self.index.write();
            Self::detach_tag(&mut index, &reference, &id);
            index.images.insert(id.clone(), image.clone());
            if let Err(e) = index.save(&self.index_path()) {
                index.images.remove(&id);
                let _ = std::fs::remove_dir_all(&image.rootfs_path);
                return Err(e);
            }
        }

        info!(
            "imported {} as {} ({} entries, {} bytes)",
            reference, id, entries, image.size_bytes
        );
        self.event_bus.emit(EventType::Image, "import", &id);

        Ok(image)
    }

    /// Move `tag` off whatever image currently holds it (other than `keep_id`)
    fn detach_tag(index: &mut ImageIndex, tag: &str, keep_id: &str) {
        if let Some(old_id) = index.id_for_tag(tag) {
            if old_id != keep_id {
                if let Some(old) = index.images.get_mut(&old_id) {
                    old.repo_tags.retain(|t| t != tag);
                }
            }
        }
    }

    /// Pull via the configured fetcher. Pulling a reference that already
    /// resolves is a no-op returning the existing image.
    pub async fn pull(&self, reference: &str, fetcher: &dyn ImageFetcher) -> Result<Image> {
        let normalized = normalize_reference(reference).ok_or_else(|| {
            DaemonError::invalid_argument("pull_image", format!("invalid reference: {}", reference))
        })?;

        if let Some(id) = self.index.read().resolve(&normalized) {
            info!("pull {}: already present as {}", normalized, id);
            return self.inspect(&id);
        }

        // Registry fetches are the transient-failure hot spot; retry briefly
        let scratch = self.root.join("tmp");
        let tarball = crate::error::retry_transient("pull_image", || {
            fetcher.fetch(&normalized, &scratch)
        })
        .await?;
        let result = self.import(&tarball, &normalized).await;
        let _ = tokio::fs::remove_file(&tarball).await;
        result
    }

    /// Export the materialized tree for `reference` as a gzip tarball
    pub async fn export(&self, reference: &str, output: &Path) -> Result<()> {
        let image = self.resolve_image(reference)?;
        let tree = image.rootfs_path.clone();
        let output = output.to_path_buf();

        tokio::task::spawn_blocking(move || import::export_tree(&tree, &output))
            .await
            .map_err(|e| DaemonError::internal("export_image", e.to_string()))?
    }

    /// Remove an image by tag or id.
    ///
    /// Removing a tag that is not the last tag only detaches it. The last
    /// tag requires `ref_count == 0` unless `force`, and `force` only
    /// overrides references held by Stopped containers; a Running consumer
    /// refuses removal unconditionally.
    pub fn remove(&self, reference: &str, force: bool) -> Result<()> {
        let mut index = self.index.write();

        let id = index
            .resolve(reference)
            .ok_or_else(|| DaemonError::not_found("remove_image", reference))?;

        let image = index.get(&id)?.clone();

        // A tag reference that is not the last tag: detach only
        let is_tag_ref = image.repo_tags.iter().any(|t| t == reference);
        if is_tag_ref && image.repo_tags.len() > 1 {
            let entry = index.get_mut(&id)?;
            entry.repo_tags.retain(|t| t != reference);
            index.save(&self.index_path())?;
            info!("detached tag {} from image {}", reference, id);
            return Ok(());
        }

        if image.ref_count > 0 {
            let running = self
                .running_probe
                .read()
                .as_ref()
                .map(|probe| probe(&id))
                .unwrap_or(false);
            if running {
                return Err(DaemonError::in_use(
                    "remove_image",
                    format!("image {} is in use by a running container", id),
                )
                .with_id(id));
            }
            if !force {
                return Err(DaemonError::in_use(
                    "remove_image",
                    format!(
                        "image {} is referenced by {} container(s)",
                        id, image.ref_count
                    ),
                )
                .with_id(id));
            }
        }

        std::fs::remove_dir_all(&image.rootfs_path)?;
        index.images.remove(&id);
        index.save(&self.index_path())?;

        info!("removed image {}", id);
        self.event_bus.emit(EventType::Image, "remove", &id);
        Ok(())
    }

    /// Metadata snapshot for a reference
    pub fn inspect(&self, reference: &str) -> Result<Image> {
        self.resolve_image(reference)
    }

    /// Resolve a reference to an id
    pub fn resolve(&self, reference: &str) -> Result<String> {
        self.index
            .read()
            .resolve(reference)
            .ok_or_else(|| DaemonError::not_found("resolve_image", reference))
    }

    fn resolve_image(&self, reference: &str) -> Result<Image> {
        let index = self.index.read();
        let id = index
            .resolve(reference)
            .ok_or_else(|| DaemonError::not_found("inspect_image", reference))?;
        index.get(&id).cloned()
    }

    /// All images, newest first
    pub fn list(&self) -> Vec<Image> {
        let mut images: Vec<Image> = self.index.read().images.values().cloned().collect();
        images.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        images
    }

    /// Allocate a writable rootfs for a container by copying the image tree.
    ///
    /// Bumps the image's ref_count; `release_rootfs` undoes it.
    pub async fn allocate_rootfs(
        &self,
        image_ref: &str,
        container_id: &str,
        container_dir: &Path,
    ) -> Result<PathBuf> {
        let image = self.resolve_image(image_ref)?;
        let rootfs = container_dir.join("rootfs");

        let source = image.rootfs_path.clone();
        let dest = rootfs.clone();
        tokio::task::spawn_blocking(move || copy_tree(&source, &dest))
            .await
            .map_err(|e| DaemonError::internal("allocate_rootfs", e.to_string()))??;

        {
            let mut index = self.index.write();
            let entry = index.get_mut(&image.id)?;
            entry.ref_count += 1;
            index.save(&self.index_path())?;
        }

        info!(
            "allocated rootfs for container {} from image {}",
            crate::system::short_id(container_id),
            image.id
        );
        Ok(rootfs)
    }

    /// Drop a container's reference on its image. The rootfs directory itself
    /// is removed with the container directory by the lifecycle engine.
    pub fn release_rootfs(&self, image_ref: &str) -> Result<()> {
        let mut index = self.index.write();
        let id = match index.resolve(image_ref) {
            Some(id) => id,
            // Image may have been force-removed already
            None => return Ok(()),
        };
        let entry = index.get_mut(&id)?;
        entry.ref_count = entry.ref_count.saturating_sub(1);
        index.save(&self.index_path())?;
        Ok(())
    }

    /// Aggregate disk usage for `/system/df`
    pub fn disk_usage(&self) -> (usize, u64) {
        let index = self.index.read();
        let total = index.images.values().map(|i| i.size_bytes).sum();
        (index.images.len(), total)
    }
}

/// Recursive copy preserving permissions and symlinks (copy-up strategy)
fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;

    for entry in walkdir::WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| DaemonError::io("copy_tree", e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| DaemonError::internal("copy_tree", e.to_string()))?;
        let target = dest.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)?;
            #[cfg(not(unix))]
            let _ = link;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::import::test_support::{build_hostile_tarball, build_tarball};
    use tempfile::TempDir;

    fn new_store(temp: &TempDir) -> ImageStore {
        ImageStore::open(temp.path().join("images"), EventBus::new()).unwrap()
    }

    fn sample_tarball(temp: &TempDir) -> PathBuf {
        let path = temp.path().join("alpine.tar.gz");
        build_tarball(
            &path,
            &[("bin/echo", b"echo".as_slice()), ("etc/os-release", b"alpine".as_slice())],
        );
        path
    }

    #[tokio::test]
    async fn test_import_and_inspect() {
        let temp = TempDir::new().unwrap();
        let store = new_store(&temp);
        let tarball = sample_tarball(&temp);

        let image = store.import(&tarball, "alpine:latest").await.unwrap();
        assert_eq!(image.id.len(), 32);
        assert_eq!(image.repo_tags, vec!["alpine:latest"]);
        assert!(image.rootfs_path.join("etc/os-release").exists());

        let inspected = store.inspect("alpine:latest").unwrap();
        assert_eq!(inspected.id, image.id);

        // Index on disk parses equal to memory
        let reloaded = ImageIndex::load(&temp.path().join("images/index.json")).unwrap();
        assert_eq!(reloaded.images.len(), 1);
        assert_eq!(reloaded.images[&image.id].size_bytes, image.size_bytes);
    }

    #[tokio::test]
    async fn test_import_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = new_store(&temp);
        let tarball = sample_tarball(&temp);

        let first = store.import(&tarball, "alpine:latest").await.unwrap();
        let second = store.import(&tarball, "alpine:latest").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.repo_tags, vec!["alpine:latest"]);
        assert_eq!(store.list().len(), 1);
    }

    #[tokio::test]
    async fn test_hostile_tarball_rejected_and_cleaned() {
        let temp = TempDir::new().unwrap();
        let store = new_store(&temp);
        let tarball = temp.path().join("evil.tar.gz");
        build_hostile_tarball(&tarball);

        let err = store.import(&tarball, "evil:latest").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);

        // No partial tree, no index entry
        assert!(store.list().is_empty());
        let dirs: Vec<_> = std::fs::read_dir(temp.path().join("images"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .collect();
        assert!(dirs.is_empty(), "partial dir left behind: {:?}", dirs);
    }

    #[tokio::test]
    async fn test_remove_in_use() {
        let temp = TempDir::new().unwrap();
        let store = new_store(&temp);
        let tarball = sample_tarball(&temp);
        store.import(&tarball, "alpine:latest").await.unwrap();

        let container_dir = temp.path().join("ctr");
        store
            .allocate_rootfs("alpine:latest", "c1", &container_dir)
            .await
            .unwrap();

        let err = store.remove("alpine:latest", false).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InUse);

        store.release_rootfs("alpine:latest").unwrap();
        store.remove("alpine:latest", false).unwrap();
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn test_tag_detach_keeps_tree() {
        let temp = TempDir::new().unwrap();
        let store = new_store(&temp);
        let tarball = sample_tarball(&temp);

        let image = store.import(&tarball, "alpine:latest").await.unwrap();
        store.import(&tarball, "alpine:3.19").await.unwrap();

        let tagged = store.inspect(&image.id).unwrap();
        assert_eq!(tagged.repo_tags.len(), 2);

        store.remove("alpine:3.19", false).unwrap();
        let remaining = store.inspect("alpine:latest").unwrap();
        assert_eq!(remaining.repo_tags, vec!["alpine:latest"]);
        assert!(remaining.rootfs_path.exists());
    }

    #[tokio::test]
    async fn test_allocate_rootfs_is_writable_copy() {
        let temp = TempDir::new().unwrap();
        let store = new_store(&temp);
        let tarball = sample_tarball(&temp);
        let image = store.import(&tarball, "alpine:latest").await.unwrap();

        let container_dir = temp.path().join("ctr");
        let rootfs = store
            .allocate_rootfs("alpine:latest", "c1", &container_dir)
            .await
            .unwrap();

        // Mutating the copy leaves the image tree untouched
        std::fs::write(rootfs.join("etc/os-release"), b"mutated").unwrap();
        assert_eq!(
            std::fs::read(image.rootfs_path.join("etc/os-release")).unwrap(),
            b"alpine"
        );
    }

    #[tokio::test]
    async fn test_orphan_gc_on_open() {
        let temp = TempDir::new().unwrap();
        {
            let store = new_store(&temp);
            let tarball = sample_tarball(&temp);
            store.import(&tarball, "alpine:latest").await.unwrap();
        }

        // Drop an orphan dir next to the real one
        let orphan = temp.path().join("images/deadbeefdeadbeefdeadbeefdeadbeef");
        std::fs::create_dir_all(&orphan).unwrap();

        let store = new_store(&temp);
        assert!(!orphan.exists());
        assert_eq!(store.list().len(), 1);
    }

    #[tokio::test]
    async fn test_export_roundtrip_law() {
        let temp = TempDir::new().unwrap();
        let store = new_store(&temp);
        let tarball = sample_tarball(&temp);
        store.import(&tarball, "alpine:latest").await.unwrap();

        let exported = temp.path().join("exported.tar.gz");
        store.export("alpine:latest", &exported).await.unwrap();

        let second = store.import(&exported, "alpine:copy").await.unwrap();
        assert!(second.rootfs_path.join("etc/os-release").exists());
        assert_eq!(
            std::fs::read(second.rootfs_path.join("etc/os-release")).unwrap(),
            b"alpine"
        );
    }

    #[tokio::test]
    async fn test_invalid_reference() {
        let temp = TempDir::new().unwrap();
        let store = new_store(&temp);
        let err = store
            .import(Path::new("/nope.tar.gz"), "BAD REF")
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
    }
}
