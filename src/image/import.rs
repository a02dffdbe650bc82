//! Tarball import and export
//!
//! Images arrive as gzip-compressed POSIX tar streams. Extraction rejects
//! path traversal: every entry's normalized path must stay within the
//! destination root, and symlink targets are never followed while writing.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{DaemonError, Result};

/// Streaming content digest of the decompressed tar bytes
pub fn content_digest(tarball: &Path) -> Result<Vec<u8>> {
    let file = std::fs::File::open(tarball)?;
    let mut decoder = GzDecoder::new(file);
    let mut hasher = Sha256::new();

    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = decoder
            .read(&mut buf)
            .map_err(|e| DaemonError::invalid_argument("import_image", format!("bad gzip stream: {}", e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize().to_vec())
}

/// Normalize a tar entry path, rejecting anything that would land outside
/// the extraction root.
fn safe_entry_path(root: &Path, entry_path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in entry_path.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(DaemonError::invalid_argument(
                    "import_image",
                    format!("entry escapes extraction root: {}", entry_path.display()),
                ));
            }
        }
    }
    Ok(root.join(out))
}

/// Extract a gzip tarball into `dest`, preserving mode, ownership and
/// symlinks. Returns the number of entries written.
///
/// The caller owns cleanup of `dest` on error.
pub fn extract_tarball(tarball: &Path, dest: &Path) -> Result<usize> {
    let file = std::fs::File::open(tarball)?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    std::fs::create_dir_all(dest)?;

    let mut written = 0usize;
    for entry in archive
        .entries()
        .map_err(|e| DaemonError::invalid_argument("import_image", format!("bad tar stream: {}", e)))?
    {
        let mut entry = entry
            .map_err(|e| DaemonError::invalid_argument("import_image", format!("bad tar entry: {}", e)))?;

        let entry_path = entry
            .path()
            .map_err(|e| DaemonError::invalid_argument("import_image", e.to_string()))?
            .into_owned();
        let target = safe_entry_path(dest, &entry_path)?;

        let kind = entry.header().entry_type();

        match kind {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&target)?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut out = std::fs::File::create(&target)?;
                std::io::copy(&mut entry, &mut out)?;
            }
            tar::EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(|e| DaemonError::invalid_argument("import_image", e.to_string()))?
                    .ok_or_else(|| {
                        DaemonError::invalid_argument("import_image", "symlink without target")
                    })?;

                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                // The target is written as-is, never resolved. A dangling
                // link is legal inside an image.
                if !dest.join(link.as_ref()).exists() {
                    warn!(
                        "symlink {} -> {} points at a nonexistent target",
                        entry_path.display(),
                        link.display()
                    );
                }

                #[cfg(unix)]
                {
                    let _ = std::fs::remove_file(&target);
                    std::os::unix::fs::symlink(link.as_ref(), &target)?;
                }
                #[cfg(not(unix))]
                {
                    debug!("skipping symlink {} on non-unix host", target.display());
                }
            }
            tar::EntryType::Link => {
                let link = entry
                    .link_name()
                    .map_err(|e| DaemonError::invalid_argument("import_image", e.to_string()))?
                    .ok_or_else(|| {
                        DaemonError::invalid_argument("import_image", "hardlink without target")
                    })?;
                let source = safe_entry_path(dest, &link)?;
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if source.exists() {
                    std::fs::hard_link(&source, &target)?;
                } else {
                    warn!("hardlink source missing, skipping {}", entry_path.display());
                    continue;
                }
            }
            other => {
                debug!("skipping unsupported tar entry type {:?}: {}", other, entry_path.display());
                continue;
            }
        }

        #[cfg(unix)]
        apply_unix_metadata(&target, entry.header(), kind);

        written += 1;
    }

    Ok(written)
}

#[cfg(unix)]
fn apply_unix_metadata(target: &Path, header: &tar::Header, kind: tar::EntryType) {
    use std::os::unix::fs::PermissionsExt;

    // Symlink modes are meaningless on Linux; chmod would follow the link
    if kind != tar::EntryType::Symlink {
        if let Ok(mode) = header.mode() {
            let _ = std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode));
        }
    }

    // Ownership restore needs privilege; failure is expected for rootless runs
    if let (Ok(uid), Ok(gid)) = (header.uid(), header.gid()) {
        let c_path = match std::ffi::CString::new(target.as_os_str().as_encoded_bytes()) {
            Ok(p) => p,
            Err(_) => return,
        };
        // SAFETY: path is a valid NUL-terminated string; lchown does not
        // retain the pointer.
        let _ = unsafe { libc::lchown(c_path.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) };
    }
}

/// Package a materialized tree back into a gzip tarball.
///
/// The inverse of import modulo member ordering and timestamps.
pub fn export_tree(tree: &Path, output: &Path) -> Result<()> {
    let file = std::fs::File::create(output)?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    builder
        .append_dir_all(".", tree)
        .map_err(|e| DaemonError::io("export_image", e.to_string()))?;

    builder
        .into_inner()
        .and_then(|gz| gz.finish())
        .map_err(|e| DaemonError::io("export_image", e.to_string()))?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    /// Build a small gzip tarball from (path, contents) pairs
    pub fn build_tarball(dest: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(dest).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }

        builder.into_inner().and_then(|gz| gz.finish()).unwrap();
    }

    /// Build a tarball containing a traversal attempt.
    ///
    /// `tar::Builder::append_data` rejects `..` components itself, so the
    /// malicious entry is written with a hand-built header that bypasses
    /// that path validation.
    pub fn build_hostile_tarball(dest: &Path) {
        let file = std::fs::File::create(dest).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let contents: &[u8] = b"pwned";
        let mut header = tar::Header::new_gnu();
        let name = b"../escape.txt";
        header.as_mut_bytes()[..name.len()].copy_from_slice(name);
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, contents).unwrap();

        builder.into_inner().and_then(|gz| gz.finish()).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_extract_and_digest() {
        let temp = TempDir::new().unwrap();
        let tarball = temp.path().join("image.tar.gz");
        test_support::build_tarball(
            &tarball,
            &[("bin/sh", b"#!/bin/sh\n"), ("etc/hostname", b"alpine\n")],
        );

        let digest_a = content_digest(&tarball).unwrap();
        let digest_b = content_digest(&tarball).unwrap();
        assert_eq!(digest_a, digest_b);

        let dest = temp.path().join("rootfs");
        let written = extract_tarball(&tarball, &dest).unwrap();
        assert_eq!(written, 2);
        assert_eq!(std::fs::read(dest.join("etc/hostname")).unwrap(), b"alpine\n");
    }

    #[test]
    fn test_traversal_rejected() {
        let temp = TempDir::new().unwrap();
        let tarball = temp.path().join("evil.tar.gz");
        test_support::build_hostile_tarball(&tarball);

        let dest = temp.path().join("rootfs");
        let err = extract_tarball(&tarball, &dest).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);

        // Nothing escaped the root
        assert!(!temp.path().join("escape.txt").exists());
    }

    #[test]
    fn test_absolute_path_rejected() {
        let root = Path::new("/tmp/x");
        assert!(safe_entry_path(root, Path::new("/etc/passwd")).is_err());
        assert!(safe_entry_path(root, Path::new("a/../../b")).is_err());
        assert_eq!(
            safe_entry_path(root, Path::new("./a/b")).unwrap(),
            PathBuf::from("/tmp/x/a/b")
        );
    }

    #[test]
    fn test_export_roundtrip() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("tree");
        std::fs::create_dir_all(tree.join("etc")).unwrap();
        std::fs::write(tree.join("etc/issue"), b"servin\n").unwrap();

        let tarball = temp.path().join("out.tar.gz");
        export_tree(&tree, &tarball).unwrap();

        let dest = temp.path().join("back");
        extract_tarball(&tarball, &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("etc/issue")).unwrap(), b"servin\n");
    }
}
