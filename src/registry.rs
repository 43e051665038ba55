use crate::config::{DeviceInfo, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to persist process registry: {0}")]
    Persist(#[from] std::io::Error),
}

/// Lifecycle state recorded per owner. There is no "starting" state on
/// disk; a record only appears once the spawn has produced a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Running,
    Stopped,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Running => f.write_str("running"),
            ProcessState::Stopped => f.write_str("stopped"),
        }
    }
}

/// How a worker exited, when known.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

/// One owner's worker as last observed. The device info rides along so a
/// rediscovered worker keeps its identity without re-asking the owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub port: u16,
    pub role: Role,
    pub start_time: DateTime<Utc>,
    pub status: ProcessState,
    pub last_seen: DateTime<Utc>,
    pub device_info: DeviceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<String>,
}

/// Persistent process records keyed by owner, mirroring what is actually
/// running so workers survive host restarts.
pub struct ProcessRegistry {
    path: PathBuf,
    records: HashMap<String, ProcessRecord>,
}

impl ProcessRegistry {
    /// Load records from disk. A missing file is an empty registry; records
    /// that fail to parse are dropped with a warning rather than failing
    /// the load.
    pub fn load(path: PathBuf) -> Self {
        let mut records = HashMap::new();

        if let Ok(contents) = std::fs::read_to_string(&path)
            && let Ok(serde_json::Value::Object(map)) = serde_json::from_str(&contents)
        {
            for (owner_id, value) in map {
                match serde_json::from_value::<ProcessRecord>(value) {
                    Ok(record) => {
                        records.insert(owner_id, record);
                    }
                    Err(e) => {
                        eprintln!(
                            "peermgr: dropping invalid process record for '{owner_id}': {e}"
                        );
                    }
                }
            }
        }

        Self { path, records }
    }

    /// Persist all records. Copies the current file to a `.backup` sibling
    /// first (best effort), then writes via temp file and rename.
    pub async fn save(&self) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            let backup = self.path.with_extension("json.backup");
            let _ = tokio::fs::copy(&self.path, &backup).await;
        }

        let map: serde_json::Map<String, serde_json::Value> = self
            .records
            .iter()
            .map(|(k, v)| Ok((k.clone(), serde_json::to_value(v)?)))
            .collect::<Result<_, serde_json::Error>>()
            .map_err(std::io::Error::other)?;
        let data = serde_json::to_vec_pretty(&serde_json::Value::Object(map))
            .map_err(std::io::Error::other)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Record a freshly spawned or rediscovered worker as running. Replaces
    /// any previous record for the owner.
    pub async fn register_process(
        &mut self,
        owner_id: &str,
        pid: u32,
        port: u16,
        role: Role,
        device_info: DeviceInfo,
    ) -> Result<(), RegistryError> {
        let now = Utc::now();
        self.records.insert(
            owner_id.to_string(),
            ProcessRecord {
                pid,
                port,
                role,
                start_time: now,
                status: ProcessState::Running,
                last_seen: now,
                device_info,
                exit_code: None,
                exit_signal: None,
            },
        );
        self.save().await
    }

    pub fn get_process(&self, owner_id: &str) -> Option<&ProcessRecord> {
        self.records.get(owner_id)
    }

    /// Update an owner's state, refreshing `last_seen`. Unknown owners are
    /// a no-op returning `false`.
    pub async fn update_status(
        &mut self,
        owner_id: &str,
        state: ProcessState,
        exit: Option<ExitInfo>,
    ) -> Result<bool, RegistryError> {
        let Some(record) = self.records.get_mut(owner_id) else {
            return Ok(false);
        };
        record.status = state;
        record.last_seen = Utc::now();
        if let Some(exit) = exit {
            record.exit_code = exit.code;
            record.exit_signal = exit.signal;
        }
        self.save().await?;
        Ok(true)
    }

    pub async fn mark_stopped(
        &mut self,
        owner_id: &str,
        exit: Option<ExitInfo>,
    ) -> Result<bool, RegistryError> {
        self.update_status(owner_id, ProcessState::Stopped, exit)
            .await
    }

    pub async fn remove_process(&mut self, owner_id: &str) -> Result<bool, RegistryError> {
        let removed = self.records.remove(owner_id).is_some();
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }

    /// Drop records not seen within `ttl_hours`, never touching records
    /// still marked running. Returns the number of dropped entries.
    pub async fn cleanup_stale_entries(&mut self, ttl_hours: i64) -> Result<usize, RegistryError> {
        let now = Utc::now();
        let before = self.records.len();
        self.records.retain(|_, r| {
            r.status == ProcessState::Running
                || now.signed_duration_since(r.last_seen).num_hours() < ttl_hours
        });
        let removed = before - self.records.len();
        if removed > 0 {
            self.save().await?;
        }
        Ok(removed)
    }

    /// Owners currently in the given state.
    pub fn with_state(&self, state: ProcessState) -> Vec<(&str, &ProcessRecord)> {
        self.records
            .iter()
            .filter(|(_, r)| r.status == state)
            .map(|(k, r)| (k.as_str(), r))
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let running = self
            .records
            .values()
            .filter(|r| r.status == ProcessState::Running)
            .count();
        RegistryStats {
            total: self.records.len(),
            running,
            stopped: self.records.len() - running,
        }
    }

    #[cfg(test)]
    fn backdate_last_seen(&mut self, owner_id: &str, age: chrono::TimeDelta) {
        if let Some(r) = self.records.get_mut(owner_id) {
            r.last_seen -= age;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceInfo {
        DeviceInfo::new("0xabc", "0.0.1234", "key", "0.0.999")
    }

    fn registry(dir: &std::path::Path) -> ProcessRegistry {
        ProcessRegistry::load(dir.join("process-registry.json"))
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(dir.path());

        reg.register_process("node-1", 4242, 6650, Role::Buyer, device())
            .await
            .unwrap();
        let record = reg.get_process("node-1").unwrap();
        assert_eq!(record.pid, 4242);
        assert_eq!(record.port, 6650);
        assert_eq!(record.status, ProcessState::Running);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut reg = registry(dir.path());
            reg.register_process("node-1", 4242, 6650, Role::Seller, device())
                .await
                .unwrap();
        }
        let reg = registry(dir.path());
        let record = reg.get_process("node-1").unwrap();
        assert_eq!(record.pid, 4242);
        assert_eq!(record.role, Role::Seller);
        assert!(!dir.path().join("process-registry.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_backup_written_on_second_save() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(dir.path());
        reg.register_process("node-1", 1, 6650, Role::Buyer, device())
            .await
            .unwrap();
        reg.register_process("node-2", 2, 6651, Role::Buyer, device())
            .await
            .unwrap();
        assert!(dir.path().join("process-registry.json.backup").exists());
    }

    #[tokio::test]
    async fn test_update_status_unknown_owner_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(dir.path());
        let updated = reg
            .update_status("ghost", ProcessState::Stopped, None)
            .await
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn test_mark_stopped_records_exit_info() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(dir.path());
        reg.register_process("node-1", 4242, 6650, Role::Buyer, device())
            .await
            .unwrap();

        reg.mark_stopped(
            "node-1",
            Some(ExitInfo {
                code: Some(1),
                signal: None,
            }),
        )
        .await
        .unwrap();

        let record = reg.get_process("node-1").unwrap();
        assert_eq!(record.status, ProcessState::Stopped);
        assert_eq!(record.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_load_drops_invalid_record_keeps_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("process-registry.json");
        let good = serde_json::json!({
            "pid": 10, "port": 6650, "role": "buyer",
            "start_time": "2026-01-01T00:00:00Z", "status": "running",
            "last_seen": "2026-01-01T00:00:00Z",
            "device_info": {
                "evmAddress": "0x1", "accountId": "0.0.2",
                "extractedPrivateKey": "k", "smartContract": "0.0.3"
            }
        });
        std::fs::write(
            &path,
            serde_json::to_string(&serde_json::json!({
                "good": good,
                "bad": {"pid": "not-a-number"}
            }))
            .unwrap(),
        )
        .unwrap();

        let reg = ProcessRegistry::load(path);
        assert!(reg.get_process("good").is_some());
        assert!(reg.get_process("bad").is_none());
    }

    #[tokio::test]
    async fn test_stale_sweep_spares_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(dir.path());
        reg.register_process("old-stopped", 1, 6650, Role::Buyer, device())
            .await
            .unwrap();
        reg.register_process("old-running", 2, 6651, Role::Buyer, device())
            .await
            .unwrap();
        reg.register_process("fresh-stopped", 3, 6652, Role::Buyer, device())
            .await
            .unwrap();

        reg.mark_stopped("old-stopped", None).await.unwrap();
        reg.mark_stopped("fresh-stopped", None).await.unwrap();
        reg.backdate_last_seen("old-stopped", chrono::TimeDelta::hours(25));
        reg.backdate_last_seen("old-running", chrono::TimeDelta::hours(25));

        let removed = reg.cleanup_stale_entries(24).await.unwrap();
        assert_eq!(removed, 1);
        assert!(reg.get_process("old-stopped").is_none());
        assert!(reg.get_process("old-running").is_some());
        assert!(reg.get_process("fresh-stopped").is_some());
    }

    #[tokio::test]
    async fn test_with_state_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(dir.path());
        reg.register_process("a", 1, 6650, Role::Buyer, device())
            .await
            .unwrap();
        reg.register_process("b", 2, 6651, Role::Seller, device())
            .await
            .unwrap();
        reg.mark_stopped("b", None).await.unwrap();

        let running = reg.with_state(ProcessState::Running);
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].0, "a");

        let stats = reg.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.stopped, 1);
    }
}
