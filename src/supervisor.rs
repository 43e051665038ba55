use crate::config::{ConfigError, DeviceInfo, OrchestratorConfig, Role};
use crate::env_file::{EnvFileError, write_worker_env};
use crate::health::{ExitEvent, spawn_health_monitor};
use crate::paths::Paths;
use crate::ports::{PortError, PortRegistry, PortStats};
use crate::probe::Probe;
use crate::process::{
    DEFAULT_KILL_SIGNAL, ProcessError, WorkerHandle, WorkerKind, spawn_worker,
};
use crate::registry::{
    ExitInfo, ProcessRegistry, ProcessState, RegistryError, RegistryStats,
};
use crate::status::{NullStatusSink, StatusFill, StatusShape, StatusSink, StatusUpdate};
use crate::sys;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock, broadcast, watch};

const EXIT_CHANNEL_CAPACITY: usize = 64;
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Precondition failures that retrying cannot fix.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("failed to spawn worker for '{owner_id}': {source}")]
    Spawn {
        owner_id: String,
        #[source]
        source: ProcessError,
    },
    #[error("worker for '{owner_id}' never became ready on port {port}")]
    NotReady { owner_id: String, port: u16 },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    EnvFile(#[from] EnvFileError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Errors that no amount of retrying will fix.
    fn is_fatal(&self) -> bool {
        matches!(
            self,
            SupervisorError::Config(_) | SupervisorError::Configuration(_)
        )
    }
}

/// What `ensure_process` hands back: the worker now serving the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRef {
    pub owner_id: String,
    pub pid: u32,
    pub port: u16,
    /// True when an already-running worker was adopted instead of spawned.
    pub reused: bool,
}

/// Orchestrates one worker process per logical owner: port reservation,
/// discovery and reuse of survivors, spawn with readiness verification,
/// liveness monitoring, and teardown.
///
/// All spawn-or-reuse resolutions are serialized through one fair lock, so
/// concurrent `ensure_process` calls resolve in FIFO order and two owners
/// can never race each other onto the same port.
pub struct Supervisor {
    config: OrchestratorConfig,
    paths: Paths,
    ports: Arc<RwLock<PortRegistry>>,
    registry: Arc<RwLock<ProcessRegistry>>,
    active: Arc<RwLock<HashMap<String, WorkerHandle>>>,
    monitors: Arc<RwLock<HashMap<String, watch::Sender<bool>>>>,
    spawn_gate: Mutex<()>,
    probe: Probe,
    exit_tx: broadcast::Sender<ExitEvent>,
    status: Arc<dyn StatusSink>,
}

impl Supervisor {
    /// Validate the configuration, create the data directories, load both
    /// registries, and sweep expired reservations and stale records.
    pub async fn new(config: OrchestratorConfig, paths: Paths) -> Result<Self, SupervisorError> {
        config.validate()?;

        tokio::fs::create_dir_all(paths.data_dir()).await?;
        tokio::fs::create_dir_all(paths.devices_dir()).await?;
        tokio::fs::create_dir_all(paths.env_dir()).await?;

        let mut ports = PortRegistry::load(
            paths.port_reservations_file(),
            config.port_range,
            config.reservation_ttl,
        );
        let mut registry = ProcessRegistry::load(paths.process_registry_file());

        let expired = ports.cleanup_expired_reservations().await?;
        if expired > 0 {
            eprintln!("peermgr: dropped {expired} expired port reservation(s) at startup");
        }
        let stale = registry.cleanup_stale_entries(config.stale_ttl_hours).await?;
        if stale > 0 {
            eprintln!("peermgr: dropped {stale} stale process record(s) at startup");
        }

        let (exit_tx, _) = broadcast::channel(EXIT_CHANNEL_CAPACITY);
        let probe = Probe::WebSocket(config.probe.clone());

        Ok(Self {
            config,
            paths,
            ports: Arc::new(RwLock::new(ports)),
            registry: Arc::new(RwLock::new(registry)),
            active: Arc::new(RwLock::new(HashMap::new())),
            monitors: Arc::new(RwLock::new(HashMap::new())),
            spawn_gate: Mutex::new(()),
            probe,
            exit_tx,
            status: Arc::new(NullStatusSink),
        })
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status = sink;
        self
    }

    pub fn with_probe(mut self, probe: Probe) -> Self {
        self.probe = probe;
        self
    }

    /// Subscribe to worker exit notifications. Restart policy lives with
    /// the subscriber; the supervisor never respawns on its own.
    pub fn exit_events(&self) -> broadcast::Receiver<ExitEvent> {
        self.exit_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Ensure
    // -----------------------------------------------------------------------

    /// Make sure a ready worker is serving `owner_id`, adopting a healthy
    /// survivor when one exists and spawning otherwise.
    pub async fn ensure_process(
        &self,
        owner_id: &str,
        device_info: &DeviceInfo,
        role: Role,
    ) -> Result<WorkerRef, SupervisorError> {
        // Fair mutex: concurrent callers queue and resolve in arrival order.
        let _gate = self.spawn_gate.lock().await;

        if let Some(worker) = self.discover_existing(owner_id, role).await? {
            return Ok(worker);
        }
        self.spawn_new(owner_id, device_info, role).await
    }

    /// `ensure_process` with exponential backoff between attempts. Fatal
    /// configuration errors are returned immediately; anything else gets
    /// cleaned up and retried.
    pub async fn ensure_process_with_retry(
        &self,
        owner_id: &str,
        device_info: &DeviceInfo,
        role: Role,
        max_attempts: u32,
    ) -> Result<WorkerRef, SupervisorError> {
        let mut last_err = None;
        for attempt in 1..=max_attempts.max(1) {
            match self.ensure_process(owner_id, device_info, role).await {
                Ok(worker) => return Ok(worker),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    eprintln!(
                        "peermgr: attempt {attempt}/{max_attempts} failed for '{owner_id}': {e}"
                    );
                    last_err = Some(e);
                    self.cleanup_failed_attempt(owner_id).await;
                    if attempt < max_attempts {
                        let backoff = Duration::from_secs(1 << attempt.min(5)).min(RETRY_BACKOFF_CAP);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        // max_attempts >= 1, so at least one attempt ran and set last_err.
        Err(last_err.unwrap_or(SupervisorError::Configuration(
            "retry loop ran zero attempts".to_string(),
        )))
    }

    /// Look for a usable survivor in the registry: pid still alive and the
    /// control channel still accepting connections. Dead or unresponsive
    /// survivors are cleaned out of the registry on the way through.
    async fn discover_existing(
        &self,
        owner_id: &str,
        role: Role,
    ) -> Result<Option<WorkerRef>, SupervisorError> {
        let record = {
            let reg = self.registry.read().await;
            reg.get_process(owner_id).cloned()
        };
        let Some(record) = record else {
            return Ok(None);
        };
        if record.status != ProcessState::Running {
            return Ok(None);
        }

        if !sys::is_pid_alive(record.pid) {
            let mut reg = self.registry.write().await;
            reg.mark_stopped(owner_id, None).await?;
            return Ok(None);
        }

        if !self
            .probe
            .test_connection(record.port, role.endpoint_path())
            .await
        {
            // Alive but not answering: a wedged worker is worse than none.
            eprintln!(
                "peermgr: worker pid {} for '{owner_id}' is alive but unresponsive, replacing it",
                record.pid
            );
            if let Err(e) =
                sys::terminate_gracefully(record.pid, DEFAULT_KILL_SIGNAL, self.config.kill_timeout)
                    .await
            {
                eprintln!("peermgr: failed to stop unresponsive worker: {e}");
            }
            let mut reg = self.registry.write().await;
            reg.mark_stopped(owner_id, None).await?;
            return Ok(None);
        }

        // Healthy survivor: adopt it.
        {
            let mut ports = self.ports.write().await;
            if ports.port_for(owner_id) == Some(record.port) {
                ports.touch(owner_id).await?;
            } else {
                ports.reclaim_port(owner_id, record.port).await?;
            }
        }
        {
            let mut reg = self.registry.write().await;
            reg.update_status(owner_id, ProcessState::Running, None).await?;
        }
        self.active.write().await.insert(
            owner_id.to_string(),
            WorkerHandle::external(owner_id, record.pid, record.port),
        );
        self.start_monitor(owner_id, record.pid).await;
        self.emit_status(
            owner_id,
            StatusFill::Green,
            StatusShape::Dot,
            format!("Reconnected to port {}", record.port),
            Some(record.port),
        );

        Ok(Some(WorkerRef {
            owner_id: owner_id.to_string(),
            pid: record.pid,
            port: record.port,
            reused: true,
        }))
    }

    async fn spawn_new(
        &self,
        owner_id: &str,
        device_info: &DeviceInfo,
        role: Role,
    ) -> Result<WorkerRef, SupervisorError> {
        self.emit_status(
            owner_id,
            StatusFill::Yellow,
            StatusShape::Ring,
            "Starting worker".to_string(),
            None,
        );

        let port = {
            let mut ports = self.ports.write().await;
            ports.reserve_port(owner_id, device_info.unique_port).await?
        };

        let mut device = device_info.clone();
        device.unique_port = Some(port);
        device.ws_port = Some(port);

        // Snapshot the device blob next to the registries so operators can
        // inspect what the worker was launched with.
        let snapshot = serde_json::to_vec_pretty(&device).map_err(std::io::Error::other)?;
        tokio::fs::write(self.paths.device_file(owner_id), snapshot).await?;

        write_worker_env(
            &self.paths.worker_env_file(role, owner_id),
            owner_id,
            &device,
            role,
            port,
        )
        .await?;

        let spawned = spawn_worker(owner_id, role, port, &self.config, &self.paths).await;
        let (handle, child) = match spawned {
            Ok(pair) => pair,
            Err(e) => {
                let mut ports = self.ports.write().await;
                let _ = ports.release_port(owner_id).await;
                return Err(match e {
                    ProcessError::ExecutableNotFound(path) => SupervisorError::Configuration(
                        format!("worker executable not found at: {}", path.display()),
                    ),
                    other => SupervisorError::Spawn {
                        owner_id: owner_id.to_string(),
                        source: other,
                    },
                });
            }
        };
        let pid = handle.pid;

        self.active.write().await.insert(owner_id.to_string(), handle);
        {
            let mut reg = self.registry.write().await;
            reg.register_process(owner_id, pid, port, role, device).await?;
        }
        self.spawn_exit_watcher(owner_id, child);

        if !self.probe.test_connection(port, role.endpoint_path()).await {
            self.teardown_unready(owner_id, pid).await;
            self.emit_status(
                owner_id,
                StatusFill::Red,
                StatusShape::Ring,
                format!("Worker not ready on port {port}"),
                Some(port),
            );
            return Err(SupervisorError::NotReady {
                owner_id: owner_id.to_string(),
                port,
            });
        }

        self.start_monitor(owner_id, pid).await;
        self.emit_status(
            owner_id,
            StatusFill::Green,
            StatusShape::Dot,
            format!("Active on port {port}"),
            Some(port),
        );

        Ok(WorkerRef {
            owner_id: owner_id.to_string(),
            pid,
            port,
            reused: false,
        })
    }

    /// Roll back a spawn whose readiness probe failed: kill the process,
    /// drop the handle, mark the record stopped, free the port.
    async fn teardown_unready(&self, owner_id: &str, pid: u32) {
        if let Some(mut handle) = self.active.write().await.remove(owner_id)
            && let Err(e) = handle
                .terminate(DEFAULT_KILL_SIGNAL, self.config.kill_timeout)
                .await
        {
            eprintln!("peermgr: failed to terminate unready worker pid {pid}: {e}");
        }
        let mut reg = self.registry.write().await;
        if let Err(e) = reg
            .mark_stopped(
                owner_id,
                Some(ExitInfo {
                    code: None,
                    signal: Some("readiness-timeout".to_string()),
                }),
            )
            .await
        {
            eprintln!("peermgr: failed to record unready worker for '{owner_id}': {e}");
        }
        drop(reg);
        let mut ports = self.ports.write().await;
        if let Err(e) = ports.release_port(owner_id).await {
            eprintln!("peermgr: failed to release port for '{owner_id}': {e}");
        }
    }

    /// Best-effort scrub between retry attempts. Every error is logged and
    /// swallowed so the next attempt starts from as clean a slate as we
    /// can manage.
    async fn cleanup_failed_attempt(&self, owner_id: &str) {
        self.stop_monitor(owner_id).await;
        if let Some(mut handle) = self.active.write().await.remove(owner_id)
            && let Err(e) = handle
                .terminate(DEFAULT_KILL_SIGNAL, self.config.kill_timeout)
                .await
        {
            eprintln!("peermgr: cleanup failed to terminate worker for '{owner_id}': {e}");
        }
        {
            let mut reg = self.registry.write().await;
            if let Err(e) = reg.remove_process(owner_id).await {
                eprintln!("peermgr: cleanup failed to drop record for '{owner_id}': {e}");
            }
        }
        let mut ports = self.ports.write().await;
        if let Err(e) = ports.release_port(owner_id).await {
            eprintln!("peermgr: cleanup failed to release port for '{owner_id}': {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Stop / preserve / shutdown
    // -----------------------------------------------------------------------

    /// Stop the owner's worker and release its port. Safe to call when no
    /// worker is running.
    pub async fn stop_process(&self, owner_id: &str) -> Result<(), SupervisorError> {
        self.stop_monitor(owner_id).await;

        let handle = self.active.write().await.remove(owner_id);
        let mut terminated = false;
        let mut stopped_external = false;
        if let Some(mut handle) = handle {
            let kind = handle.kind;
            let was_alive = handle.is_alive();
            handle
                .terminate(DEFAULT_KILL_SIGNAL, self.config.kill_timeout)
                .await
                .map_err(|source| SupervisorError::Spawn {
                    owner_id: owner_id.to_string(),
                    source,
                })?;
            terminated = was_alive;
            stopped_external = was_alive && kind == WorkerKind::External;
        } else {
            // No live handle; the registry may still know a pid from a
            // previous host session.
            let record = {
                let reg = self.registry.read().await;
                reg.get_process(owner_id).cloned()
            };
            if let Some(record) = record
                && record.status == ProcessState::Running
                && sys::is_pid_alive(record.pid)
            {
                sys::terminate_gracefully(record.pid, DEFAULT_KILL_SIGNAL, self.config.kill_timeout)
                    .await
                    .map_err(|source| SupervisorError::Spawn {
                        owner_id: owner_id.to_string(),
                        source,
                    })?;
                terminated = true;
                stopped_external = true;
            }
        }

        {
            // Stamp the signal only when this call actually stopped a
            // process; a record that already carries real exit info keeps
            // it.
            let exit = terminated.then(|| ExitInfo {
                code: None,
                signal: Some(DEFAULT_KILL_SIGNAL.to_string()),
            });
            let mut reg = self.registry.write().await;
            reg.mark_stopped(owner_id, exit).await?;
        }
        {
            let mut ports = self.ports.write().await;
            ports.release_port(owner_id).await?;
        }

        // Owned workers get their exit event from the exit watcher; for an
        // external pid nobody else is watching.
        if stopped_external {
            let _ = self.exit_tx.send(ExitEvent {
                owner_id: owner_id.to_string(),
                exit_code: None,
                exit_signal: Some(DEFAULT_KILL_SIGNAL.to_string()),
                unexpected: false,
            });
        }

        self.emit_status(
            owner_id,
            StatusFill::Grey,
            StatusShape::Dot,
            "Stopped".to_string(),
            None,
        );
        Ok(())
    }

    /// Detach from the owner's worker without killing it. The registry
    /// record stays running so the next `ensure_process` can rediscover
    /// and adopt it. Used when the host redeploys flows but the worker
    /// should ride through.
    pub async fn preserve_process(&self, owner_id: &str) -> Result<(), SupervisorError> {
        self.stop_monitor(owner_id).await;
        // Dropping an Owned handle leaves the child running; its exit
        // watcher keeps the registry honest if it later dies.
        self.active.write().await.remove(owner_id);
        let mut reg = self.registry.write().await;
        reg.update_status(owner_id, ProcessState::Running, None).await?;
        self.emit_status(
            owner_id,
            StatusFill::Yellow,
            StatusShape::Ring,
            "Preserved across redeploy".to_string(),
            None,
        );
        Ok(())
    }

    /// Stop every active worker. Errors are collected per owner and logged;
    /// the loop never short-circuits.
    pub async fn shutdown_all(&self) {
        let owners: Vec<String> = self.active.read().await.keys().cloned().collect();
        for owner_id in owners {
            if let Err(e) = self.stop_process(&owner_id).await {
                eprintln!("peermgr: shutdown failed for '{owner_id}': {e}");
            }
        }
    }

    /// Last-resort sweep: kill every process launched from the worker
    /// executable regardless of what the registries claim, then reconcile
    /// registry records and port reservations against reality.
    pub async fn emergency_cleanup(&self) -> Result<(), SupervisorError> {
        if let Some(name) = self.config.executable_name() {
            sys::emergency_kill_by_name(name)
                .await
                .map_err(|source| SupervisorError::Spawn {
                    owner_id: "*".to_string(),
                    source,
                })?;
        }

        // Let the kernel finish tearing processes down before reconciling.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let known: Vec<(String, u32, ProcessState)> = {
            let reg = self.registry.read().await;
            [ProcessState::Running, ProcessState::Stopped]
                .into_iter()
                .flat_map(|s| reg.with_state(s))
                .map(|(owner, r)| (owner.to_string(), r.pid, r.status))
                .collect()
        };
        for (owner_id, pid, status) in known {
            if sys::is_pid_alive(pid) {
                continue;
            }
            self.stop_monitor(&owner_id).await;
            self.active.write().await.remove(&owner_id);
            if status == ProcessState::Running {
                let mut reg = self.registry.write().await;
                reg.mark_stopped(
                    &owner_id,
                    Some(ExitInfo {
                        code: None,
                        signal: Some("emergency-cleanup".to_string()),
                    }),
                )
                .await?;
            }
            let mut ports = self.ports.write().await;
            ports.release_port(&owner_id).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Monitors and exit watching
    // -----------------------------------------------------------------------

    async fn start_monitor(&self, owner_id: &str, pid: u32) {
        // Replace any previous monitor for this owner.
        self.stop_monitor(owner_id).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.monitors
            .write()
            .await
            .insert(owner_id.to_string(), shutdown_tx);
        spawn_health_monitor(
            owner_id.to_string(),
            pid,
            self.config.health_interval,
            Arc::clone(&self.registry),
            Arc::clone(&self.active),
            self.exit_tx.clone(),
            shutdown_rx,
        );
    }

    async fn stop_monitor(&self, owner_id: &str) {
        if let Some(tx) = self.monitors.write().await.remove(owner_id) {
            let _ = tx.send(true);
        }
    }

    /// Reap the owned child and record how it went. Runs for the life of
    /// the worker; on exit it updates the registry, drops the handle and
    /// monitor, and publishes the exit event.
    fn spawn_exit_watcher(&self, owner_id: &str, mut child: Child) {
        let owner_id = owner_id.to_string();
        let registry = Arc::clone(&self.registry);
        let active = Arc::clone(&self.active);
        let monitors = Arc::clone(&self.monitors);
        let exit_tx = self.exit_tx.clone();

        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => status,
                Err(e) => {
                    eprintln!("peermgr: failed to reap worker for '{owner_id}': {e}");
                    return;
                }
            };

            let exit_code = status.code();
            #[cfg(unix)]
            let exit_signal = {
                use std::os::unix::process::ExitStatusExt;
                status.signal().and_then(sys::signal_name)
            };
            #[cfg(not(unix))]
            let exit_signal: Option<String> = None;

            // A clean exit or a termination we sent is expected.
            let unexpected = exit_code != Some(0)
                && !matches!(exit_signal.as_deref(), Some("SIGTERM") | Some("SIGKILL"));
            if unexpected {
                eprintln!(
                    "peermgr: worker for '{owner_id}' exited unexpectedly (code {exit_code:?}, signal {exit_signal:?})"
                );
            }

            active.write().await.remove(&owner_id);
            if let Some(tx) = monitors.write().await.remove(&owner_id) {
                let _ = tx.send(true);
            }
            {
                let mut reg = registry.write().await;
                if let Err(e) = reg
                    .mark_stopped(
                        &owner_id,
                        Some(ExitInfo {
                            code: exit_code,
                            signal: exit_signal.clone(),
                        }),
                    )
                    .await
                {
                    eprintln!("peermgr: failed to record exit for '{owner_id}': {e}");
                }
            }

            let _ = exit_tx.send(ExitEvent {
                owner_id,
                exit_code,
                exit_signal,
                unexpected,
            });
        });
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub async fn port_for(&self, owner_id: &str) -> Option<u16> {
        self.ports.read().await.port_for(owner_id)
    }

    pub async fn process_record(&self, owner_id: &str) -> Option<crate::registry::ProcessRecord> {
        self.registry.read().await.get_process(owner_id).cloned()
    }

    pub async fn is_active(&self, owner_id: &str) -> bool {
        self.active.read().await.contains_key(owner_id)
    }

    pub async fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            ports: self.ports.read().await.stats(),
            registry: self.registry.read().await.stats(),
            active: self.active.read().await.len(),
        }
    }

    fn emit_status(
        &self,
        owner_id: &str,
        fill: StatusFill,
        shape: StatusShape,
        text: String,
        port: Option<u16>,
    ) {
        self.status.status(StatusUpdate {
            owner_id: owner_id.to_string(),
            fill,
            shape,
            text,
            port,
        });
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorStats {
    pub ports: PortStats,
    pub registry: RegistryStats,
    pub active: usize,
}
