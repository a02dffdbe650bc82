//! Platform probing

use serde::Serialize;
use sysinfo::System;
use tracing::debug;

/// Host operating system family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostOs {
    Linux,
    Macos,
    Windows,
    Other,
}

impl std::fmt::Display for HostOs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostOs::Linux => write!(f, "linux"),
            HostOs::Macos => write!(f, "macos"),
            HostOs::Windows => write!(f, "windows"),
            HostOs::Other => write!(f, "other"),
        }
    }
}

/// Privilege level the daemon runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeLevel {
    /// Root / administrator
    Privileged,

    /// Regular user; native isolation needs user namespaces
    Unprivileged,
}

/// Snapshot of the host platform, taken once at startup
#[derive(Debug, Clone, Serialize)]
pub struct Platform {
    /// Operating system family
    pub os: HostOs,

    /// Machine architecture, e.g. "x86_64", "aarch64"
    pub arch: String,

    /// Kernel/OS version string
    pub os_version: String,

    /// Logical CPU count
    pub cpus: usize,

    /// Total memory in bytes
    pub total_memory: u64,

    /// Whether hardware virtualization appears usable
    pub virtualization: bool,

    /// Privilege level of the daemon process
    pub privilege: PrivilegeLevel,
}

impl Platform {
    /// Probe the host. Cheap enough to run once per process.
    pub fn probe() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        let os = match std::env::consts::OS {
            "linux" => HostOs::Linux,
            "macos" => HostOs::Macos,
            "windows" => HostOs::Windows,
            _ => HostOs::Other,
        };

        let platform = Self {
            os,
            arch: std::env::consts::ARCH.to_string(),
            os_version: System::long_os_version().unwrap_or_else(|| "unknown".into()),
            cpus: num_cpus::get(),
            total_memory: sys.total_memory(),
            virtualization: Self::detect_virtualization(os),
            privilege: Self::detect_privilege(),
        };

        debug!(
            "platform probe: os={} arch={} cpus={} virt={} privilege={:?}",
            platform.os, platform.arch, platform.cpus, platform.virtualization, platform.privilege
        );

        platform
    }

    /// Native-path eligibility: Linux host with enough privilege to create
    /// namespaces and write cgroups.
    pub fn supports_native(&self) -> bool {
        self.os == HostOs::Linux && self.privilege == PrivilegeLevel::Privileged
    }

    fn detect_virtualization(os: HostOs) -> bool {
        match os {
            // /dev/kvm is the gate for the KVM provider
            HostOs::Linux => std::path::Path::new("/dev/kvm").exists(),
            // Virtualization.framework ships with the OS on arm64/x86_64
            HostOs::Macos => true,
            // Hyper-V presence cannot be cheaply probed without WMI; assume
            // available and let provider start surface the real error
            HostOs::Windows => true,
            HostOs::Other => false,
        }
    }

    fn detect_privilege() -> PrivilegeLevel {
        #[cfg(unix)]
        {
            // Effective uid 0 means we can unshare/mount/write cgroups.
            // SAFETY: geteuid has no failure modes.
            if unsafe { libc::geteuid() } == 0 {
                return PrivilegeLevel::Privileged;
            }
            PrivilegeLevel::Unprivileged
        }
        #[cfg(not(unix))]
        {
            PrivilegeLevel::Unprivileged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_fills_fields() {
        let platform = Platform::probe();
        assert!(!platform.arch.is_empty());
        assert!(platform.cpus > 0);
    }

    #[test]
    fn test_native_requires_linux() {
        let platform = Platform {
            os: HostOs::Macos,
            arch: "aarch64".into(),
            os_version: "macOS 14".into(),
            cpus: 8,
            total_memory: 16 << 30,
            virtualization: true,
            privilege: PrivilegeLevel::Privileged,
        };
        assert!(!platform.supports_native());
    }

    #[test]
    fn test_native_requires_privilege() {
        let platform = Platform {
            os: HostOs::Linux,
            arch: "x86_64".into(),
            os_version: "Linux 6".into(),
            cpus: 4,
            total_memory: 8 << 30,
            virtualization: true,
            privilege: PrivilegeLevel::Unprivileged,
        };
        assert!(!platform.supports_native());
    }
}
