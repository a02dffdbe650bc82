//! Container mount plan
//!
//! Applied in declaration order inside the fresh mount namespace, followed
//! by pivot_root so the host tree is unobservable, then the restricted
//! pseudo-filesystems.

use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::backend::{BackendError, BackendResult, MountKind, MountSpec};

fn isolation_err(context: &str, e: impl std::fmt::Display) -> BackendError {
    BackendError::Isolation(format!("{}: {}", context, e))
}

/// Make every mount in this namespace private so nothing propagates back
/// to the host.
pub fn make_private() -> BackendResult<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| isolation_err("remount / private", e))
}

/// Bind the rootfs onto itself so it becomes a mount point for pivot_root
pub fn bind_rootfs(rootfs: &Path) -> BackendResult<()> {
    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| isolation_err("bind rootfs", e))
}

/// Apply user mounts in declaration order
pub fn apply_mounts(rootfs: &Path, mounts: &[MountSpec]) -> BackendResult<()> {
    for spec in mounts {
        let target = rootfs.join(spec.target.trim_start_matches('/'));
        std::fs::create_dir_all(&target).map_err(|e| isolation_err("mount target", e))?;

        match spec.kind {
            MountKind::Bind | MountKind::Volume => {
                let mut flags = MsFlags::MS_BIND | MsFlags::MS_REC;
                if let Some(propagation) = spec.propagation.as_deref() {
                    flags |= match propagation {
                        "rshared" => MsFlags::MS_SHARED | MsFlags::MS_REC,
                        "rslave" => MsFlags::MS_SLAVE | MsFlags::MS_REC,
                        _ => MsFlags::MS_PRIVATE,
                    };
                }
                mount(
                    Some(spec.source.as_str()),
                    &target,
                    None::<&str>,
                    flags,
                    None::<&str>,
                )
                .map_err(|e| isolation_err(&format!("bind {}", spec.source), e))?;

                // Read-only needs a remount pass on the bind
                if spec.readonly {
                    mount(
                        None::<&str>,
                        &target,
                        None::<&str>,
                        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                        None::<&str>,
                    )
                    .map_err(|e| isolation_err("remount readonly", e))?;
                }
            }
            MountKind::Tmpfs => {
                let data = spec
                    .tmpfs_size
                    .map(|size| format!("size={}", size))
                    .unwrap_or_default();
                mount(
                    Some("tmpfs"),
                    &target,
                    Some("tmpfs"),
                    MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                    if data.is_empty() {
                        None
                    } else {
                        Some(data.as_str())
                    },
                )
                .map_err(|e| isolation_err("tmpfs", e))?;
            }
        }
    }
    Ok(())
}

/// Pivot into the rootfs and detach the old root so the container cannot
/// observe the host filesystem.
pub fn pivot_into(rootfs: &Path) -> BackendResult<()> {
    let old_root = rootfs.join(".pivot_old");
    std::fs::create_dir_all(&old_root).map_err(|e| isolation_err("pivot dir", e))?;

    nix::unistd::pivot_root(rootfs, &old_root).map_err(|e| isolation_err("pivot_root", e))?;
    nix::unistd::chdir("/").map_err(|e| isolation_err("chdir /", e))?;

    umount2("/.pivot_old", MntFlags::MNT_DETACH).map_err(|e| isolation_err("umount old root", e))?;
    let _ = std::fs::remove_dir("/.pivot_old");

    Ok(())
}

/// Mount the standard pseudo-filesystems with restricted options.
/// Runs after pivot_root, so paths are container-absolute.
pub fn mount_pseudo_filesystems() -> BackendResult<()> {
    std::fs::create_dir_all("/proc").map_err(|e| isolation_err("mkdir /proc", e))?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| isolation_err("mount /proc", e))?;

    std::fs::create_dir_all("/sys").map_err(|e| isolation_err("mkdir /sys", e))?;
    mount(
        Some("sysfs"),
        "/sys",
        Some("sysfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| isolation_err("mount /sys", e))?;

    std::fs::create_dir_all("/dev/pts").map_err(|e| isolation_err("mkdir /dev/pts", e))?;
    mount(
        Some("devpts"),
        "/dev/pts",
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=0620"),
    )
    .map_err(|e| isolation_err("mount /dev/pts", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Mount syscalls need privilege; only the plan shaping is unit-testable
    #[test]
    fn test_target_path_joining() {
        let rootfs = Path::new("/data/ctr/rootfs");
        let spec = MountSpec {
            source: "/host/data".into(),
            target: "/mnt/data".into(),
            kind: MountKind::Bind,
            readonly: false,
            propagation: None,
            tmpfs_size: None,
        };
        let target = rootfs.join(spec.target.trim_start_matches('/'));
        assert_eq!(target, Path::new("/data/ctr/rootfs/mnt/data"));
    }
}
