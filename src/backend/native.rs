//! Native Linux execution backend
//!
//! Spawns the container process through a pre-exec phase that enters fresh
//! namespaces, applies the mount plan, pivots into the rootfs and drops
//! capabilities. Resource limits are cgroup writes performed before the
//! first exec; the child enrolls itself in the cgroup between fork and exec.

#![cfg(target_os = "linux")]

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::isolation::{caps, cgroup::Cgroup, mounts, namespaces};

use super::{
    BackendError, BackendResult, ContainerStats, ExecSession, ExecSpec, ExecutionMode, ExitStatus,
    OutputCallback, ResourceLimits, RuntimeBackend, StartedProcess, StdStream,
};

struct NativeHandle {
    pid: Option<u32>,
    stdin: Option<mpsc::Sender<Bytes>>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    env: Vec<String>,
}

/// Kernel-isolation execution backend
pub struct NativeBackend {
    procs: DashMap<String, NativeHandle>,
}

impl NativeBackend {
    pub fn new() -> Self {
        Self {
            procs: DashMap::new(),
        }
    }

    fn handle(
        &self,
        container_id: &str,
    ) -> BackendResult<dashmap::mapref::one::Ref<'_, String, NativeHandle>> {
        self.procs
            .get(container_id)
            .ok_or_else(|| BackendError::NotFound(container_id.to_string()))
    }

    /// Parse "uid[:gid]" into numeric ids
    fn parse_user(user: &str) -> Option<(u32, u32)> {
        let (uid, gid) = match user.split_once(':') {
            Some((u, g)) => (u.parse().ok()?, g.parse().ok()?),
            None => {
                let uid = user.parse().ok()?;
                (uid, uid)
            }
        };
        Some((uid, gid))
    }

    fn exit_status_of(status: std::process::ExitStatus) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        let exit_code = status
            .code()
            .map(|c| c as i64)
            .or_else(|| status.signal().map(|s| 128 + s as i64))
            .unwrap_or(255);
        ExitStatus {
            exit_code,
            oom_killed: false,
            vm_lost: false,
        }
    }

    fn spawn_output_pump<R>(reader: R, stream: StdStream, output: OutputCallback)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut reader = reader;
            let mut buf = vec![0u8; 8192];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => output(stream, &buf[..n]),
                }
            }
        });
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeBackend for NativeBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Native
    }

    async fn start(
        &self,
        spec: &ExecSpec,
        output: OutputCallback,
    ) -> BackendResult<StartedProcess> {
        if let Some(existing) = self.procs.get(&spec.id) {
            if existing.exit_rx.borrow().is_none() {
                return Err(BackendError::AlreadyRunning(spec.id.clone()));
            }
        }

        // Limits land in the cgroup before the first exec
        let cgroup = Cgroup::new(&spec.id);
        cgroup.apply(&spec.resources)?;

        let program = spec
            .command
            .first()
            .cloned()
            .ok_or_else(|| BackendError::NotExecutable("empty command".into()))?;

        let mut command = Command::new(&program);
        command.args(&spec.command[1..]);
        command.env_clear();
        command.env(
            "PATH",
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
        );
        for pair in &spec.env {
            if let Some((key, value)) = pair.split_once('=') {
                command.env(key, value);
            }
        }
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        command.stdin(if spec.stdin_open || spec.tty {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.kill_on_drop(true);

        // Everything the child phase needs, moved into the closure
        let container_id = spec.id.clone();
        let rootfs = spec.rootfs.clone();
        let mounts_plan = spec.mounts.clone();
        let network = spec.network.clone();
        let hostname = network
            .hostname
            .clone()
            .unwrap_or_else(|| crate::system::short_id(&spec.id).to_string());
        let privileged = spec.privileged;
        let retained = caps::retained_set(&spec.capabilities);
        let user = spec.user.as_deref().and_then(Self::parse_user);
        let workdir = spec.working_dir.clone();
        let flags = namespaces::clone_flags(&network, false);

        // SAFETY: the closure only performs syscalls; it runs between fork
        // and exec in the child.
        unsafe {
            command.pre_exec(move || {
                let fail =
                    |e: BackendError| std::io::Error::new(std::io::ErrorKind::Other, e.to_string());

                // Enroll in the cgroup first so every limit applies to the
                // whole isolated subtree
                let cgroup = Cgroup::new(&container_id);
                cgroup
                    .add_pid(std::process::id())
                    .map_err(fail)?;

                if let Some(handle) = network.namespace_handle.as_deref() {
                    namespaces::join_network_namespace(handle).map_err(fail)?;
                }
                namespaces::enter(flags).map_err(fail)?;
                namespaces::set_hostname(&hostname).map_err(fail)?;

                mounts::make_private().map_err(fail)?;
                mounts::bind_rootfs(&rootfs).map_err(fail)?;
                mounts::apply_mounts(&rootfs, &mounts_plan).map_err(fail)?;
                mounts::pivot_into(&rootfs).map_err(fail)?;
                mounts::mount_pseudo_filesystems().map_err(fail)?;

                if !privileged {
                    caps::drop_bounding_set(&retained).map_err(fail)?;
                }

                if let Some((uid, gid)) = user {
                    nix::unistd::setgid(nix::unistd::Gid::from_raw(gid))
                        .map_err(|e| fail(BackendError::Isolation(format!("setgid: {}", e))))?;
                    nix::unistd::setuid(nix::unistd::Uid::from_raw(uid))
                        .map_err(|e| fail(BackendError::Isolation(format!("setuid: {}", e))))?;
                }

                if let Some(dir) = workdir.as_deref() {
                    std::env::set_current_dir(dir)?;
                }

                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                BackendError::NotExecutable(spec.command.join(" "))
            }
            _ => BackendError::Io(e),
        })?;

        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            Self::spawn_output_pump(stdout, StdStream::Stdout, output.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            Self::spawn_output_pump(stderr, StdStream::Stderr, output.clone());
        }

        let stdin_tx = child.stdin.take().map(|mut stdin| {
            let (tx, mut rx) = mpsc::channel::<Bytes>(64);
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    if stdin.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                let _ = stdin.shutdown().await;
            });
            tx
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let container_id = spec.id.clone();
        tokio::spawn(async move {
            let cgroup = Cgroup::new(&container_id);
            let mut exit = match child.wait().await {
                Ok(status) => Self::exit_status_of(status),
                Err(e) => {
                    warn!("wait failed for {}: {}", container_id, e);
                    ExitStatus {
                        exit_code: 255,
                        oom_killed: false,
                        vm_lost: false,
                    }
                }
            };

            // The kernel's oom_kill counter is authoritative; a SIGKILL exit
            // with the counter raised becomes the 137/oom_killed record
            if cgroup.oom_killed() {
                exit.oom_killed = true;
                exit.exit_code = 137;
            }
            cgroup.cleanup();

            debug!(
                "container {} main process exited with {} (oom={})",
                container_id, exit.exit_code, exit.oom_killed
            );
            let _ = exit_tx.send(Some(exit));
        });

        self.procs.insert(
            spec.id.clone(),
            NativeHandle {
                pid,
                stdin: stdin_tx,
                exit_rx,
                env: spec.env.clone(),
            },
        );

        Ok(StartedProcess { pid })
    }

    async fn wait(&self, container_id: &str) -> BackendResult<ExitStatus> {
        let mut exit_rx = self.handle(container_id)?.exit_rx.clone();

        loop {
            if let Some(exit) = *exit_rx.borrow() {
                return Ok(exit);
            }
            exit_rx
                .changed()
                .await
                .map_err(|_| BackendError::Other("supervisor dropped".into()))?;
        }
    }

    async fn signal(&self, container_id: &str, signal: &str) -> BackendResult<()> {
        let pid = {
            let handle = self.handle(container_id)?;
            if handle.exit_rx.borrow().is_some() {
                return Err(BackendError::NotRunning(container_id.to_string()));
            }
            handle
                .pid
                .ok_or_else(|| BackendError::NotRunning(container_id.to_string()))?
        };

        let number = super::parse_signal(signal)
            .ok_or_else(|| BackendError::Other(format!("unknown signal: {}", signal)))?;
        let sig = nix::sys::signal::Signal::try_from(number)
            .map_err(|e| BackendError::Other(format!("signal {}: {}", signal, e)))?;

        match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig) {
            Ok(()) => Ok(()),
            // ESRCH races with exit; the waiter records the status
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(BackendError::Other(format!("kill: {}", e))),
        }
    }

    async fn pause(&self, container_id: &str) -> BackendResult<()> {
        let _ = self.handle(container_id)?;
        Cgroup::new(container_id).freeze()
    }

    async fn resume(&self, container_id: &str) -> BackendResult<()> {
        let _ = self.handle(container_id)?;
        Cgroup::new(container_id).thaw()
    }

    async fn exec(
        &self,
        container_id: &str,
        command_argv: Vec<String>,
        env: Vec<String>,
        _tty: bool,
    ) -> BackendResult<ExecSession> {
        let (pid, mut merged_env) = {
            let handle = self.handle(container_id)?;
            if handle.exit_rx.borrow().is_some() {
                return Err(BackendError::NotRunning(container_id.to_string()));
            }
            let pid = handle
                .pid
                .ok_or_else(|| BackendError::NotRunning(container_id.to_string()))?;
            (pid, handle.env.clone())
        };
        merged_env.extend(env);

        let program = command_argv
            .first()
            .cloned()
            .ok_or_else(|| BackendError::NotExecutable("empty command".into()))?;

        let mut command = Command::new(&program);
        command.args(&command_argv[1..]);
        command.env_clear();
        for pair in &merged_env {
            if let Some((key, value)) = pair.split_once('=') {
                command.env(key, value);
            }
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Re-enter the running container's namespaces by pid
        let ns_pid = pid as i32;
        unsafe {
            command.pre_exec(move || {
                let fail =
                    |m: String| std::io::Error::new(std::io::ErrorKind::Other, m);

                for ns in ["ipc", "uts", "net", "pid", "mnt"] {
                    let path = format!("/proc/{}/ns/{}", ns_pid, ns);
                    let file = std::fs::File::open(&path)
                        .map_err(|e| fail(format!("open {}: {}", path, e)))?;
                    nix::sched::setns(&file, nix::sched::CloneFlags::empty())
                        .map_err(|e| fail(format!("setns {}: {}", ns, e)))?;
                }

                // The mount namespace join already placed us in the pivoted
                // tree; chdir to a stable location
                std::env::set_current_dir("/")
                    .map_err(|e| fail(format!("chdir: {}", e)))?;

                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BackendError::NotExecutable(command_argv.join(" ")),
            _ => BackendError::Io(e),
        })?;

        let (out_tx, out_rx) = mpsc::channel::<(StdStream, Bytes)>(64);
        let (exit_tx, exit_rx) = oneshot::channel();

        let stdin_tx = child.stdin.take().map(|mut stdin| {
            let (tx, mut rx) = mpsc::channel::<Bytes>(64);
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    if stdin.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                let _ = stdin.shutdown().await;
            });
            tx
        });

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::spawn(async move {
            let mut tasks = Vec::new();
            if let Some(mut r) = stdout {
                let tx = out_tx.clone();
                tasks.push(tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    loop {
                        match r.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if tx
                                    .send((StdStream::Stdout, Bytes::copy_from_slice(&buf[..n])))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                }));
            }
            if let Some(mut r) = stderr {
                let tx = out_tx.clone();
                tasks.push(tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    loop {
                        match r.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if tx
                                    .send((StdStream::Stderr, Bytes::copy_from_slice(&buf[..n])))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                }));
            }
            drop(out_tx);
            for task in tasks {
                let _ = task.await;
            }

            let exit = match child.wait().await {
                Ok(status) => Self::exit_status_of(status),
                Err(_) => ExitStatus {
                    exit_code: 255,
                    oom_killed: false,
                    vm_lost: false,
                },
            };
            let _ = exit_tx.send(exit);
        });

        Ok(ExecSession {
            stdin: stdin_tx,
            output: out_rx,
            exit: exit_rx,
        })
    }

    async fn attach_stdin(&self, container_id: &str) -> BackendResult<mpsc::Sender<Bytes>> {
        let handle = self.handle(container_id)?;
        handle
            .stdin
            .clone()
            .ok_or_else(|| BackendError::Other("stdin not open".into()))
    }

    async fn stats(&self, container_id: &str) -> BackendResult<ContainerStats> {
        let _ = self.handle(container_id)?;
        Ok(Cgroup::new(container_id).stats())
    }

    async fn is_alive(&self, container_id: &str, pid: Option<u32>) -> BackendResult<bool> {
        if let Some(handle) = self.procs.get(container_id) {
            return Ok(handle.exit_rx.borrow().is_none());
        }

        // Adopted containers after a daemon restart: /proc existence check
        if let Some(pid) = pid {
            return Ok(std::path::Path::new(&format!("/proc/{}", pid)).exists());
        }
        Ok(false)
    }

    async fn update_resources(
        &self,
        container_id: &str,
        resources: &ResourceLimits,
    ) -> BackendResult<()> {
        let _ = self.handle(container_id)?;
        Cgroup::new(container_id).apply(resources)
    }
}
