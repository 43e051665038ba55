use crate::process::WorkerHandle;
use crate::registry::{ExitInfo, ProcessRegistry, ProcessState};
use crate::sys;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::task::JoinHandle;

/// Published whenever a supervised worker stops running, whether through
/// `stop_process`, an observed exit, or a failed liveness poll.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub owner_id: String,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
    /// True when the worker died without being asked to.
    pub unexpected: bool,
}

/// Periodic liveness poll for one worker. While the pid answers signal 0
/// the registry's `last_seen` is refreshed; the first failed poll marks
/// the record stopped, drops the active handle, publishes an `ExitEvent`,
/// and ends the task. Restarting is the subscriber's call, never ours.
pub fn spawn_health_monitor(
    owner_id: String,
    pid: u32,
    interval: Duration,
    registry: Arc<RwLock<ProcessRegistry>>,
    active: Arc<RwLock<HashMap<String, WorkerHandle>>>,
    exit_tx: broadcast::Sender<ExitEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; skip it so the poll cadence starts
        // one interval after spawn.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown_rx.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                    continue;
                }
            }

            if sys::is_pid_alive(pid) {
                let mut reg = registry.write().await;
                if let Err(e) = reg
                    .update_status(&owner_id, ProcessState::Running, None)
                    .await
                {
                    eprintln!("peermgr: health refresh failed for '{owner_id}': {e}");
                }
                continue;
            }

            // Dead. The exit watcher may have raced us here; updates below
            // are no-ops when it won.
            let still_active = {
                let mut map = active.write().await;
                map.remove(&owner_id).is_some()
            };
            {
                let mut reg = registry.write().await;
                let still_running = matches!(
                    reg.get_process(&owner_id),
                    Some(r) if r.status == ProcessState::Running
                );
                if still_running {
                    let exit = ExitInfo {
                        code: None,
                        signal: Some("health-check-failed".to_string()),
                    };
                    if let Err(e) = reg.mark_stopped(&owner_id, Some(exit)).await {
                        eprintln!(
                            "peermgr: failed to mark '{owner_id}' stopped after health check: {e}"
                        );
                    }
                }
            }
            if still_active {
                let _ = exit_tx.send(ExitEvent {
                    owner_id: owner_id.clone(),
                    exit_code: None,
                    exit_signal: Some("health-check-failed".to_string()),
                    unexpected: true,
                });
            }
            return;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceInfo, Role};

    fn device() -> DeviceInfo {
        DeviceInfo::new("0xabc", "0.0.1234", "key", "0.0.999")
    }

    async fn seeded_registry(dir: &std::path::Path, pid: u32) -> Arc<RwLock<ProcessRegistry>> {
        let mut reg = ProcessRegistry::load(dir.join("process-registry.json"));
        reg.register_process("node-1", pid, 6650, Role::Buyer, device())
            .await
            .unwrap();
        Arc::new(RwLock::new(reg))
    }

    #[tokio::test]
    async fn test_live_pid_refreshes_last_seen() {
        let dir = tempfile::tempdir().unwrap();
        let pid = std::process::id();
        let registry = seeded_registry(dir.path(), pid).await;
        let active = Arc::new(RwLock::new(HashMap::new()));
        active
            .write()
            .await
            .insert("node-1".to_string(), WorkerHandle::external("node-1", pid, 6650));
        let (exit_tx, _) = broadcast::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let before = registry.read().await.get_process("node-1").unwrap().last_seen;
        let handle = spawn_health_monitor(
            "node-1".to_string(),
            pid,
            Duration::from_millis(50),
            registry.clone(),
            active.clone(),
            exit_tx,
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let record = registry.read().await.get_process("node-1").cloned().unwrap();
        assert_eq!(record.status, ProcessState::Running);
        assert!(record.last_seen > before);
        assert!(active.read().await.contains_key("node-1"));
    }

    #[tokio::test]
    async fn test_dead_pid_marks_stopped_and_emits() {
        let dir = tempfile::tempdir().unwrap();
        // Spawn and fully reap a child so its pid is free and dead.
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        let registry = seeded_registry(dir.path(), pid).await;
        let active = Arc::new(RwLock::new(HashMap::new()));
        active
            .write()
            .await
            .insert("node-1".to_string(), WorkerHandle::external("node-1", pid, 6650));
        let (exit_tx, mut exit_rx) = broadcast::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = spawn_health_monitor(
            "node-1".to_string(),
            pid,
            Duration::from_millis(50),
            registry.clone(),
            active.clone(),
            exit_tx,
            shutdown_rx,
        );
        // Monitor exits on its own after the failed poll.
        handle.await.unwrap();

        let record = registry.read().await.get_process("node-1").cloned().unwrap();
        assert_eq!(record.status, ProcessState::Stopped);
        assert_eq!(record.exit_signal.as_deref(), Some("health-check-failed"));
        assert!(!active.read().await.contains_key("node-1"));

        let event = exit_rx.recv().await.unwrap();
        assert_eq!(event.owner_id, "node-1");
        assert!(event.unexpected);
    }

    #[tokio::test]
    async fn test_no_event_when_exit_watcher_won_race() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        let registry = seeded_registry(dir.path(), pid).await;
        // Handle already removed, record already stopped.
        registry
            .write()
            .await
            .mark_stopped("node-1", None)
            .await
            .unwrap();
        let active: Arc<RwLock<HashMap<String, WorkerHandle>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (exit_tx, mut exit_rx) = broadcast::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        spawn_health_monitor(
            "node-1".to_string(),
            pid,
            Duration::from_millis(50),
            registry.clone(),
            active,
            exit_tx,
            shutdown_rx,
        )
        .await
        .unwrap();

        assert!(exit_rx.try_recv().is_err());
        let record = registry.read().await.get_process("node-1").cloned().unwrap();
        assert!(record.exit_signal.is_none());
    }
}
