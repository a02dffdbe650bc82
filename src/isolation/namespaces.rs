//! Namespace creation

use nix::sched::{unshare, CloneFlags};

use crate::backend::{BackendError, BackendResult, NetworkSpec};

/// Build the unshare flag set for a container.
///
/// PID unsharing places descendants of the exec'd process in the fresh pid
/// namespace; the main process itself stays visible to the host supervisor.
pub fn clone_flags(network: &NetworkSpec, with_user_ns: bool) -> CloneFlags {
    let mut flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWPID;

    // host networking and sandbox-joined containers keep the existing netns
    if network.mode != "host" && network.namespace_handle.is_none() {
        flags |= CloneFlags::CLONE_NEWNET;
    }

    if with_user_ns {
        flags |= CloneFlags::CLONE_NEWUSER;
    }

    flags
}

/// Enter fresh namespaces. Runs pre-exec in the child.
pub fn enter(flags: CloneFlags) -> BackendResult<()> {
    unshare(flags).map_err(|e| BackendError::Isolation(format!("unshare: {}", e)))
}

/// Join an existing network namespace by bind-mounted handle path.
///
/// Sandbox members share the sandbox netns this way.
pub fn join_network_namespace(handle: &str) -> BackendResult<()> {
    let file = std::fs::File::open(handle)
        .map_err(|e| BackendError::Isolation(format!("open netns {}: {}", handle, e)))?;

    nix::sched::setns(&file, CloneFlags::CLONE_NEWNET)
        .map_err(|e| BackendError::Isolation(format!("setns {}: {}", handle, e)))
}

/// Set the UTS hostname inside the fresh namespace
pub fn set_hostname(hostname: &str) -> BackendResult<()> {
    nix::unistd::sethostname(hostname)
        .map_err(|e| BackendError::Isolation(format!("sethostname: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_flags_bridge() {
        let network = NetworkSpec {
            mode: "bridge".into(),
            ..Default::default()
        };
        let flags = clone_flags(&network, false);
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn test_clone_flags_host_network() {
        let network = NetworkSpec {
            mode: "host".into(),
            ..Default::default()
        };
        let flags = clone_flags(&network, false);
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn test_clone_flags_sandbox_member() {
        let network = NetworkSpec {
            mode: "container:abc".into(),
            namespace_handle: Some("/run/netns/abc".into()),
            ..Default::default()
        };
        let flags = clone_flags(&network, false);
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
    }
}
