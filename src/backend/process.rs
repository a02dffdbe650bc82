//! Portable process backend
//!
//! Runs the container command as a plain host child process with no kernel
//! isolation: the development-mode execution path, and the substrate the
//! test suite drives. The rootfs becomes the working directory; resource
//! limits are recorded but not enforced.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::{
    BackendError, BackendResult, ContainerStats, ExecSession, ExecSpec, ExecutionMode, ExitStatus,
    OutputCallback, ResourceLimits, RuntimeBackend, StartedProcess, StdStream,
};

/// Supervisor-side control for a running process
enum ProcCmd {
    /// Force-kill when platform signals are unavailable
    Kill,
}

struct ProcHandle {
    pid: Option<u32>,
    stdin: Option<mpsc::Sender<Bytes>>,
    cmd_tx: mpsc::Sender<ProcCmd>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    /// Remembered for exec sessions
    rootfs: std::path::PathBuf,
    env: Vec<String>,
}

/// Plain-process execution backend
pub struct ProcessBackend {
    procs: DashMap<String, ProcHandle>,
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self {
            procs: DashMap::new(),
        }
    }

    fn handle(
        &self,
        container_id: &str,
    ) -> BackendResult<dashmap::mapref::one::Ref<'_, String, ProcHandle>> {
        self.procs
            .get(container_id)
            .ok_or_else(|| BackendError::NotFound(container_id.to_string()))
    }

    fn build_command(spec_env: &[String], rootfs: &std::path::Path, argv: &[String]) -> BackendResult<Command> {
        let program = argv
            .first()
            .ok_or_else(|| BackendError::NotExecutable("empty command".into()))?;

        let mut command = Command::new(program);
        command.args(&argv[1..]);
        command.env_clear();
        // A usable PATH keeps shell fragments working without the caller
        // spelling it out
        command.env("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin");
        for pair in spec_env {
            if let Some((key, value)) = pair.split_once('=') {
                command.env(key, value);
            }
        }
        if rootfs.is_dir() {
            command.current_dir(rootfs);
        }
        command.kill_on_drop(true);
        Ok(command)
    }

    fn spawn_output_pump<R>(
        reader: R,
        stream: StdStream,
        output: OutputCallback,
    ) -> tokio::task::JoinHandle<()>
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
        })
    }

    fn exit_status_of(status: std::process::ExitStatus) -> ExitStatus {
        let exit_code = if let Some(code) = status.code() {
            code as i64
        } else {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                status.signal().map(|s| 128 + s as i64).unwrap_or(255)
            }
            #[cfg(not(unix))]
            {
                255
            }
        };
        ExitStatus {
            exit_code,
            oom_killed: false,
            vm_lost: false,
        }
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeBackend for ProcessBackend {
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

        let mut command = Self::build_command(&spec.env, &spec.rootfs, &spec.command)?;
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        command.stdin(if spec.stdin_open || spec.tty {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                BackendError::NotExecutable(spec.command.join(" "))
            }
            std::io::ErrorKind::PermissionDenied => {
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

        // stdin writer task
        let stdin_tx = if let Some(mut stdin) = child.stdin.take() {
            let (tx, mut rx) = mpsc::channel::<Bytes>(64);
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    if stdin.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                // Dropping stdin half-closes the pipe: EOF to the child
                let _ = stdin.shutdown().await;
            });
            Some(tx)
        } else {
            None
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ProcCmd>(4);

        let container_id = spec.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        let exit = match status {
                            Ok(s) => Self::exit_status_of(s),
                            Err(e) => {
                                warn!("wait failed for {}: {}", container_id, e);
                                ExitStatus { exit_code: 255, oom_killed: false, vm_lost: false }
                            }
                        };
                        debug!("process for {} exited with {}", container_id, exit.exit_code);
                        let _ = exit_tx.send(Some(exit));
                        break;
                    }
                    Some(cmd) = cmd_rx.recv() => {
                        match cmd {
                            ProcCmd::Kill => {
                                let _ = child.start_kill();
                            }
                        }
                    }
                }
            }
        });

        self.procs.insert(
            spec.id.clone(),
            ProcHandle {
                pid,
                stdin: stdin_tx,
                cmd_tx,
                exit_rx,
                rootfs: spec.rootfs.clone(),
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
        let handle = self.handle(container_id)?;

        if handle.exit_rx.borrow().is_some() {
            return Err(BackendError::NotRunning(container_id.to_string()));
        }

        let number = super::parse_signal(signal)
            .ok_or_else(|| BackendError::Other(format!("unknown signal: {}", signal)))?;

        #[cfg(unix)]
        {
            if let Some(pid) = handle.pid {
                // SAFETY: plain kill(2) on a pid we spawned
                let rc = unsafe { libc::kill(pid as libc::pid_t, number) };
                if rc != 0 {
                    let e = std::io::Error::last_os_error();
                    // ESRCH races with exit; the waiter records the status
                    if e.raw_os_error() != Some(libc::ESRCH) {
                        return Err(BackendError::Io(e));
                    }
                }
                return Ok(());
            }
        }

        // No pid or non-unix host: only a hard kill is expressible
        if number == 9 {
            handle
                .cmd_tx
                .send(ProcCmd::Kill)
                .await
                .map_err(|_| BackendError::NotRunning(container_id.to_string()))?;
            Ok(())
        } else {
            Err(BackendError::Other(format!(
                "signal {} unsupported on this host",
                signal
            )))
        }
    }

    async fn pause(&self, container_id: &str) -> BackendResult<()> {
        self.signal(container_id, "SIGSTOP").await
    }

    async fn resume(&self, container_id: &str) -> BackendResult<()> {
        self.signal(container_id, "SIGCONT").await
    }

    async fn exec(
        &self,
        container_id: &str,
        command: Vec<String>,
        env: Vec<String>,
        _tty: bool,
    ) -> BackendResult<ExecSession> {
        let (rootfs, mut merged_env) = {
            let handle = self.handle(container_id)?;
            if handle.exit_rx.borrow().is_some() {
                return Err(BackendError::NotRunning(container_id.to_string()));
            }
            (handle.rootfs.clone(), handle.env.clone())
        };
        merged_env.extend(env);

        let mut cmd = Self::build_command(&merged_env, &rootfs, &command)?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BackendError::NotExecutable(command.join(" ")),
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
        // No cgroup on the portable path; report zeros
        Ok(ContainerStats::default())
    }

    async fn is_alive(&self, container_id: &str, pid: Option<u32>) -> BackendResult<bool> {
        if let Some(handle) = self.procs.get(container_id) {
            return Ok(handle.exit_rx.borrow().is_none());
        }

        // After a daemon restart the map is empty; fall back to a pid probe
        #[cfg(unix)]
        if let Some(pid) = pid {
            // SAFETY: signal 0 only checks existence
            let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
            return Ok(rc == 0);
        }

        let _ = pid;
        Ok(false)
    }

    async fn update_resources(
        &self,
        container_id: &str,
        _resources: &ResourceLimits,
    ) -> BackendResult<()> {
        let _ = self.handle(container_id)?;
        // Unenforced on the portable path
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    fn spec(id: &str, command: &[&str]) -> ExecSpec {
        ExecSpec {
            id: id.into(),
            rootfs: PathBuf::from("/"),
            command: command.iter().map(|s| s.to_string()).collect(),
            env: vec![],
            working_dir: None,
            user: None,
            tty: false,
            stdin_open: false,
            mounts: vec![],
            resources: ResourceLimits::default(),
            network: Default::default(),
            capabilities: vec![],
            privileged: false,
            seccomp_profile: None,
            apparmor_profile: None,
            labels: Default::default(),
        }
    }

    fn collecting_callback() -> (OutputCallback, Arc<Mutex<Vec<u8>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        let callback: OutputCallback = Arc::new(move |_stream, data: &[u8]| {
            sink.lock().extend_from_slice(data);
        });
        (callback, collected)
    }

    #[tokio::test]
    async fn test_start_wait_captures_output() {
        let backend = ProcessBackend::new();
        let (callback, collected) = collecting_callback();

        backend
            .start(&spec("c1", &["echo", "hello"]), callback)
            .await
            .unwrap();

        let exit = backend.wait("c1").await.unwrap();
        assert_eq!(exit.exit_code, 0);

        // Pump tasks race the waiter by a hair
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(String::from_utf8_lossy(&collected.lock()), "hello\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let backend = ProcessBackend::new();
        let (callback, _) = collecting_callback();

        backend
            .start(&spec("c2", &["sh", "-c", "exit 3"]), callback)
            .await
            .unwrap();

        let exit = backend.wait("c2").await.unwrap();
        assert_eq!(exit.exit_code, 3);
    }

    #[tokio::test]
    async fn test_missing_binary_not_executable() {
        let backend = ProcessBackend::new();
        let (callback, _) = collecting_callback();

        let err = backend
            .start(&spec("c3", &["definitely-not-a-binary-xyz"]), callback)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotExecutable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigkill_yields_137() {
        let backend = ProcessBackend::new();
        let (callback, _) = collecting_callback();

        backend
            .start(&spec("c4", &["sleep", "30"]), callback)
            .await
            .unwrap();

        backend.signal("c4", "SIGKILL").await.unwrap();
        let exit = backend.wait("c4").await.unwrap();
        assert_eq!(exit.exit_code, 137);
    }

    #[tokio::test]
    async fn test_exec_session() {
        let backend = ProcessBackend::new();
        let (callback, _) = collecting_callback();

        backend
            .start(&spec("c5", &["sleep", "5"]), callback)
            .await
            .unwrap();

        let mut session = backend
            .exec("c5", vec!["echo".into(), "inside".into()], vec![], false)
            .await
            .unwrap();

        let mut collected = Vec::new();
        while let Some((stream, chunk)) = session.output.recv().await {
            assert_eq!(stream, StdStream::Stdout);
            collected.extend_from_slice(&chunk);
        }
        let exit = session.exit.await.unwrap();
        assert_eq!(exit.exit_code, 0);
        assert_eq!(String::from_utf8_lossy(&collected), "inside\n");

        backend.signal("c5", "SIGKILL").await.unwrap();
    }

    #[tokio::test]
    async fn test_is_alive_lifecycle() {
        let backend = ProcessBackend::new();
        let (callback, _) = collecting_callback();

        assert!(!backend.is_alive("c6", None).await.unwrap());

        backend
            .start(&spec("c6", &["sleep", "5"]), callback)
            .await
            .unwrap();
        assert!(backend.is_alive("c6", None).await.unwrap());

        backend.signal("c6", "SIGKILL").await.unwrap();
        backend.wait("c6").await.unwrap();
        assert!(!backend.is_alive("c6", None).await.unwrap());
    }
}
