use crate::config::{ConfigError, Role};
use std::path::{Path, PathBuf};

/// Data-directory layout. Everything the orchestrator persists lives under
/// one base directory: the two registry files, per-owner device snapshots,
/// and the env files the worker binary reads at startup.
#[derive(Clone)]
pub struct Paths {
    data_dir: PathBuf,
}

impl Paths {
    pub fn new() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("PEERMGR_DATA_DIR") {
            return Ok(Self {
                data_dir: PathBuf::from(path),
            });
        }
        let Some(base) = dirs::data_dir() else {
            return Err(ConfigError::NoDataDir);
        };
        Ok(Self {
            data_dir: base.join("peermgr"),
        })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { data_dir: base }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn port_reservations_file(&self) -> PathBuf {
        self.data_dir.join("port-reservations.json")
    }

    pub fn process_registry_file(&self) -> PathBuf {
        self.data_dir.join("process-registry.json")
    }

    pub fn devices_dir(&self) -> PathBuf {
        self.data_dir.join("devices")
    }

    pub fn device_file(&self, owner_id: &str) -> PathBuf {
        self.devices_dir().join(format!("{owner_id}.json"))
    }

    pub fn env_dir(&self) -> PathBuf {
        self.data_dir.join("env_files")
    }

    /// Hidden per-owner env file consumed by the worker binary, e.g.
    /// `.buyer-env-node-1`.
    pub fn worker_env_file(&self, role: Role, owner_id: &str) -> PathBuf {
        self.env_dir().join(format!(".{role}-env-{owner_id}"))
    }
}
