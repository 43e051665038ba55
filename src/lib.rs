//! Process orchestration for peer worker processes.
//!
//! `peermgr` is the supervision core of a flow-programming host plugin: it
//! reserves loopback ports, renders worker environment files, spawns and
//! monitors long-lived peer workers, verifies their WebSocket control
//! channels before reporting them ready, persists enough state for workers
//! to survive host restarts, and tears them down across platforms.
//!
//! The entry point is [`Supervisor`]; everything else supports it.

pub mod config;
pub mod env_file;
pub mod health;
pub mod log;
pub mod paths;
pub mod ports;
pub mod probe;
pub mod process;
pub mod registry;
pub mod status;
pub mod supervisor;
pub mod sys;

pub use config::{ConfigError, DeviceInfo, OrchestratorConfig, Role};
pub use health::ExitEvent;
pub use paths::Paths;
pub use ports::{PortError, PortRegistry};
pub use probe::{Probe, ProbeConfig};
pub use process::{ProcessError, WorkerHandle, WorkerKind};
pub use registry::{ProcessRecord, ProcessRegistry, ProcessState};
pub use status::{NullStatusSink, StatusFill, StatusShape, StatusSink, StatusUpdate};
pub use supervisor::{Supervisor, SupervisorError, SupervisorStats, WorkerRef};
