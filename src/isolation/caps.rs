//! Capability bounding-set management
//!
//! Default policy: drop everything, then re-add the minimal set. The
//! privileged flag skips the drop entirely.

use tracing::debug;

use crate::backend::{BackendError, BackendResult};

/// Capability numbers from linux/capability.h
const CAP_CHOWN: u32 = 0;
const CAP_DAC_OVERRIDE: u32 = 1;
const CAP_FOWNER: u32 = 3;
const CAP_FSETID: u32 = 4;
const CAP_KILL: u32 = 5;
const CAP_SETGID: u32 = 6;
const CAP_SETUID: u32 = 7;
const CAP_SETPCAP: u32 = 8;
const CAP_NET_BIND_SERVICE: u32 = 10;
const CAP_NET_RAW: u32 = 13;
const CAP_SYS_CHROOT: u32 = 18;
const CAP_MKNOD: u32 = 27;
const CAP_AUDIT_WRITE: u32 = 29;
const CAP_SETFCAP: u32 = 31;

/// Highest capability number probed when dropping
const CAP_LAST: u32 = 40;

/// The default minimal retained set
pub const DEFAULT_CAPABILITIES: &[(&str, u32)] = &[
    ("CHOWN", CAP_CHOWN),
    ("DAC_OVERRIDE", CAP_DAC_OVERRIDE),
    ("FSETID", CAP_FSETID),
    ("FOWNER", CAP_FOWNER),
    ("MKNOD", CAP_MKNOD),
    ("NET_RAW", CAP_NET_RAW),
    ("SETGID", CAP_SETGID),
    ("SETUID", CAP_SETUID),
    ("SETFCAP", CAP_SETFCAP),
    ("SETPCAP", CAP_SETPCAP),
    ("NET_BIND_SERVICE", CAP_NET_BIND_SERVICE),
    ("SYS_CHROOT", CAP_SYS_CHROOT),
    ("KILL", CAP_KILL),
    ("AUDIT_WRITE", CAP_AUDIT_WRITE),
];

/// Resolve a requested capability name ("NET_ADMIN" or "CAP_NET_ADMIN")
fn lookup(name: &str) -> Option<u32> {
    let name = name.trim_start_matches("CAP_").to_ascii_uppercase();
    match name.as_str() {
        "CHOWN" => Some(CAP_CHOWN),
        "DAC_OVERRIDE" => Some(CAP_DAC_OVERRIDE),
        "FOWNER" => Some(CAP_FOWNER),
        "FSETID" => Some(CAP_FSETID),
        "KILL" => Some(CAP_KILL),
        "SETGID" => Some(CAP_SETGID),
        "SETUID" => Some(CAP_SETUID),
        "SETPCAP" => Some(CAP_SETPCAP),
        "NET_BIND_SERVICE" => Some(CAP_NET_BIND_SERVICE),
        "NET_RAW" => Some(CAP_NET_RAW),
        "NET_ADMIN" => Some(12),
        "IPC_LOCK" => Some(14),
        "SYS_CHROOT" => Some(CAP_SYS_CHROOT),
        "SYS_PTRACE" => Some(19),
        "SYS_ADMIN" => Some(21),
        "SYS_NICE" => Some(23),
        "SYS_RESOURCE" => Some(24),
        "SYS_TIME" => Some(25),
        "MKNOD" => Some(CAP_MKNOD),
        "AUDIT_WRITE" => Some(CAP_AUDIT_WRITE),
        "SETFCAP" => Some(CAP_SETFCAP),
        _ => None,
    }
}

/// Compute the retained capability set for a container.
///
/// Unknown requested names are skipped with a log line rather than failing
/// the start.
pub fn retained_set(requested: &[String]) -> Vec<u32> {
    if requested.is_empty() {
        return DEFAULT_CAPABILITIES.iter().map(|(_, n)| *n).collect();
    }

    requested
        .iter()
        .filter_map(|name| {
            let cap = lookup(name);
            if cap.is_none() {
                debug!("ignoring unknown capability {}", name);
            }
            cap
        })
        .collect()
}

/// Drop every bounding-set capability not in `retain`. Runs pre-exec in the
/// child.
pub fn drop_bounding_set(retain: &[u32]) -> BackendResult<()> {
    for cap in 0..=CAP_LAST {
        if retain.contains(&cap) {
            continue;
        }
        // SAFETY: prctl with PR_CAPBSET_DROP takes plain integers and does
        // not dereference anything.
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
        if rc != 0 {
            let errno = std::io::Error::last_os_error();
            // EINVAL means the kernel has fewer capabilities than we probe
            if errno.raw_os_error() == Some(libc::EINVAL) {
                break;
            }
            return Err(BackendError::Isolation(format!(
                "drop capability {}: {}",
                cap, errno
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_set_matches_policy() {
        let retained = retained_set(&[]);
        assert_eq!(retained.len(), DEFAULT_CAPABILITIES.len());
        assert!(retained.contains(&CAP_NET_BIND_SERVICE));
        assert!(!retained.contains(&21)); // SYS_ADMIN never retained by default
    }

    #[test]
    fn test_requested_set() {
        let retained = retained_set(&["CAP_NET_ADMIN".into(), "SYS_PTRACE".into()]);
        assert_eq!(retained, vec![12, 19]);
    }

    #[test]
    fn test_unknown_names_skipped() {
        let retained = retained_set(&["NOT_A_CAP".into(), "KILL".into()]);
        assert_eq!(retained, vec![CAP_KILL]);
    }
}
