use crate::config::{OrchestratorConfig, Role};
use crate::log::{LogSink, LogStream, spawn_log_copier, worker_log_path};
use crate::paths::Paths;
use crate::sys;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_KILL_SIGNAL: &str = "SIGTERM";

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("worker executable not found at: {0}")]
    ExecutableNotFound(PathBuf),
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(#[source] std::io::Error),
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
    #[error("failed to signal process: {0}")]
    Kill(#[source] std::io::Error),
}

/// Whether this handle spawned the process or merely found it running.
/// Owned workers have their exit reaped by the exit watcher; external ones
/// are only observed through liveness polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Owned,
    External,
}

/// A live worker the supervisor can act on. Both kinds terminate through
/// the platform layer by pid, so a rediscovered worker is as controllable
/// as one we spawned.
#[derive(Debug)]
pub struct WorkerHandle {
    pub owner_id: String,
    pub pid: u32,
    pub port: u16,
    pub kind: WorkerKind,
    killed: bool,
}

impl WorkerHandle {
    /// Handle for a worker found already running.
    pub fn external(owner_id: &str, pid: u32, port: u16) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            pid,
            port,
            kind: WorkerKind::External,
            killed: false,
        }
    }

    fn owned(owner_id: &str, pid: u32, port: u16) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            pid,
            port,
            kind: WorkerKind::Owned,
            killed: false,
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.killed && sys::is_pid_alive(self.pid)
    }

    pub fn was_killed(&self) -> bool {
        self.killed
    }

    /// Graceful termination with forced escalation after `timeout`.
    /// Idempotent; a second call on a killed handle is a no-op.
    pub async fn terminate(&mut self, signal: &str, timeout: Duration) -> Result<(), ProcessError> {
        if self.killed {
            return Ok(());
        }
        if sys::is_pid_alive(self.pid) {
            sys::terminate_gracefully(self.pid, signal, timeout).await?;
        }
        self.killed = true;
        Ok(())
    }
}

/// Command-line arguments for the worker invocation. The `--port=` form is
/// load-bearing: the emergency sweep matches on it.
pub fn worker_args(role: Role, port: u16, env_file: &Path, use_local_address: bool) -> Vec<String> {
    let mut args = vec![format!("--port={port}")];
    if use_local_address {
        args.push("--use-local-address".to_string());
    }
    args.extend([
        "--mode=peer".to_string(),
        format!("--buyer-or-seller={role}"),
        role.counterparty_source_flag().to_string(),
        format!("--envFile={}", env_file.display()),
        format!("--ws-port={port}"),
    ]);
    args
}

/// Spawn the worker for one owner, wiring its stdout/stderr to log copier
/// tasks. The returned `Child` must be awaited (the exit watcher does) or
/// the process leaks as a zombie on unix.
pub async fn spawn_worker(
    owner_id: &str,
    role: Role,
    port: u16,
    config: &OrchestratorConfig,
    paths: &Paths,
) -> Result<(WorkerHandle, Child), ProcessError> {
    if !config.worker_path.exists() {
        return Err(ProcessError::ExecutableNotFound(config.worker_path.clone()));
    }

    let env_file = paths.worker_env_file(role, owner_id);
    let args = worker_args(role, port, &env_file, config.use_local_address);

    let mut child = Command::new(&config.worker_path)
        .args(&args)
        .current_dir(paths.env_dir())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false)
        .spawn()
        .map_err(ProcessError::SpawnFailed)?;

    let pid = child
        .id()
        .ok_or_else(|| ProcessError::SpawnFailed(std::io::Error::other("child exited at spawn")))?;

    let (stdout_sink, stderr_sink) = match &config.log_dir {
        Some(dir) => {
            let _ = tokio::fs::create_dir_all(dir).await;
            (
                LogSink::File(worker_log_path(dir, role, owner_id, LogStream::Stdout)),
                LogSink::File(worker_log_path(dir, role, owner_id, LogStream::Stderr)),
            )
        }
        None => {
            let tag = format!("{role}-{owner_id}");
            (
                LogSink::Console { tag: tag.clone() },
                LogSink::Console { tag },
            )
        }
    };

    if let Some(stdout) = child.stdout.take() {
        spawn_log_copier(LogStream::Stdout, stdout, stdout_sink);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_log_copier(LogStream::Stderr, stderr, stderr_sink);
    }

    Ok((WorkerHandle::owned(owner_id, pid, port), child))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_args_shape() {
        let args = worker_args(Role::Buyer, 6650, Path::new("/data/.buyer-env-n1"), true);
        assert_eq!(args[0], "--port=6650");
        assert!(args.contains(&"--use-local-address".to_string()));
        assert!(args.contains(&"--mode=peer".to_string()));
        assert!(args.contains(&"--buyer-or-seller=buyer".to_string()));
        assert!(args.contains(&"--list-of-sellers-source=env".to_string()));
        assert!(args.contains(&"--envFile=/data/.buyer-env-n1".to_string()));
        assert!(args.contains(&"--ws-port=6650".to_string()));
    }

    #[test]
    fn test_worker_args_without_local_address() {
        let args = worker_args(Role::Seller, 6651, Path::new("/d/.seller-env-n2"), false);
        assert!(!args.contains(&"--use-local-address".to_string()));
        assert!(args.contains(&"--buyer-or-seller=seller".to_string()));
        assert!(args.contains(&"--list-of-buyers-source=env".to_string()));
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let config = OrchestratorConfig::new("/nonexistent/peer-worker");

        let err = spawn_worker("node-1", Role::Buyer, 6650, &config, &paths)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::ExecutableNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_and_terminate_real_process() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        tokio::fs::create_dir_all(paths.env_dir()).await.unwrap();

        // Stand-in worker that ignores its arguments and just stays up.
        let script = dir.path().join("peer-worker");
        tokio::fs::write(&script, "#!/bin/sh\nexec sleep 300\n")
            .await
            .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let mut config = OrchestratorConfig::new(&script);
        config.log_dir = Some(dir.path().join("logs"));

        let (mut handle, mut child) = spawn_worker("node-1", Role::Buyer, 6650, &config, &paths)
            .await
            .unwrap();
        assert!(handle.is_alive());
        assert_eq!(handle.kind, WorkerKind::Owned);

        handle
            .terminate(DEFAULT_KILL_SIGNAL, Duration::from_secs(5))
            .await
            .unwrap();
        child.wait().await.unwrap();
        assert!(!handle.is_alive());

        // Second terminate is a no-op.
        handle
            .terminate(DEFAULT_KILL_SIGNAL, Duration::from_secs(1))
            .await
            .unwrap();
    }
}
