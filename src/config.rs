use crate::probe::ProbeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_PORT_RANGE_START: u16 = 6650;
pub const DEFAULT_PORT_RANGE_END: u16 = 6750;
pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_STALE_TTL_HOURS: i64 = 24;
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Environment variable naming the worker executable. Required.
pub const WORKER_PATH_ENV: &str = "PEER_WORKER_PATH";
/// Environment variable naming the worker log directory. Optional; when
/// absent, worker output goes to the console.
pub const WORKER_LOG_DIR_ENV: &str = "PEER_WORKER_LOG_DIR";

const DEFAULT_ETH_RPC_URL: &str = "https://testnet.hashio.io/api";
const DEFAULT_MIRROR_API_URL: &str = "https://testnet.mirrornode.hedera.com/api/v1";
const DEFAULT_LOCATION: &str = r#"{"lat":-2.1574851,"lon":101.7108034,"alt":0.000000}"#;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{WORKER_PATH_ENV} is not set; point it at the peer worker executable")]
    MissingWorkerPath,
    #[error("worker executable not found at: {0}")]
    WorkerNotFound(PathBuf),
    #[error("invalid port range {0}-{1}")]
    InvalidPortRange(u16, u16),
    #[error("could not determine data directory")]
    NoDataDir,
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// Which worker variant an owner runs. Selects the CLI flag, the env-file
/// name, the readiness endpoint, and which counterparty list goes into the
/// worker environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Buyer,
    Seller,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Buyer => "buyer",
            Role::Seller => "seller",
        }
    }

    /// WebSocket endpoint that must accept a connection for the worker to
    /// be considered ready.
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            Role::Buyer => "/buyer/p2p",
            Role::Seller => "/seller/p2p",
        }
    }

    /// A buyer is handed the seller list and vice versa.
    pub fn counterparty_source_flag(&self) -> &'static str {
        match self {
            Role::Buyer => "--list-of-sellers-source=env",
            Role::Seller => "--list-of-buyers-source=env",
        }
    }

    pub fn counterparty_list_key(&self) -> &'static str {
        match self {
            Role::Buyer => "list_of_sellers",
            Role::Seller => "list_of_buyers",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// DeviceInfo
// ---------------------------------------------------------------------------

/// Owner-supplied device metadata. Persisted verbatim in the process
/// registry so a rediscovered worker keeps its identity, and rendered into
/// the worker env file at spawn time. Field names match the on-disk JSON
/// produced by earlier deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub evm_address: String,
    pub account_id: String,
    pub extracted_private_key: String,
    pub smart_contract: String,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub seller_admin_keys: Vec<Option<String>>,
    #[serde(default)]
    pub buyer_admin_keys: Vec<Option<String>>,
    #[serde(default)]
    pub unique_port: Option<u16>,
    #[serde(default)]
    pub ws_port: Option<u16>,
    #[serde(default = "default_eth_rpc_url")]
    pub eth_rpc_url: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_mirror_api_url")]
    pub mirror_api_url: String,
}

fn default_eth_rpc_url() -> String {
    DEFAULT_ETH_RPC_URL.to_string()
}

fn default_location() -> String {
    DEFAULT_LOCATION.to_string()
}

fn default_mirror_api_url() -> String {
    DEFAULT_MIRROR_API_URL.to_string()
}

impl DeviceInfo {
    pub fn new(
        evm_address: impl Into<String>,
        account_id: impl Into<String>,
        extracted_private_key: impl Into<String>,
        smart_contract: impl Into<String>,
    ) -> Self {
        Self {
            evm_address: evm_address.into(),
            account_id: account_id.into(),
            extracted_private_key: extracted_private_key.into(),
            smart_contract: smart_contract.into(),
            public_key: None,
            seller_admin_keys: Vec::new(),
            buyer_admin_keys: Vec::new(),
            unique_port: None,
            ws_port: None,
            eth_rpc_url: default_eth_rpc_url(),
            location: default_location(),
            mirror_api_url: default_mirror_api_url(),
        }
    }

    /// Counterparty admin keys for the given role, with holes filtered out.
    pub fn counterparty_keys(&self, role: Role) -> Vec<&str> {
        let keys = match role {
            Role::Buyer => &self.seller_admin_keys,
            Role::Seller => &self.buyer_admin_keys,
        };
        keys.iter().flatten().map(String::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// OrchestratorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Path to the peer worker executable.
    pub worker_path: PathBuf,
    /// Directory for worker stdout/stderr logs. `None` routes worker output
    /// to the console instead.
    pub log_dir: Option<PathBuf>,
    /// Inclusive port range scanned for reservations.
    pub port_range: (u16, u16),
    pub reservation_ttl: Duration,
    pub stale_ttl_hours: i64,
    pub probe: ProbeConfig,
    pub health_interval: Duration,
    /// Grace period before a graceful termination escalates to a forced one.
    pub kill_timeout: Duration,
    pub use_local_address: bool,
}

impl OrchestratorConfig {
    pub fn new(worker_path: impl Into<PathBuf>) -> Self {
        Self {
            worker_path: worker_path.into(),
            log_dir: None,
            port_range: (DEFAULT_PORT_RANGE_START, DEFAULT_PORT_RANGE_END),
            reservation_ttl: DEFAULT_RESERVATION_TTL,
            stale_ttl_hours: DEFAULT_STALE_TTL_HOURS,
            probe: ProbeConfig::default(),
            health_interval: DEFAULT_HEALTH_INTERVAL,
            kill_timeout: Duration::from_millis(crate::process::DEFAULT_KILL_TIMEOUT_MS),
            use_local_address: true,
        }
    }

    /// Build a configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let worker_path = std::env::var(WORKER_PATH_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .ok_or(ConfigError::MissingWorkerPath)?;

        let mut config = Self::new(worker_path);
        config.log_dir = std::env::var(WORKER_LOG_DIR_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        Ok(config)
    }

    /// Checked once up front: a missing executable is a configuration error,
    /// fatal for the spawn attempt, never retried.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_range.0 > self.port_range.1 {
            return Err(ConfigError::InvalidPortRange(
                self.port_range.0,
                self.port_range.1,
            ));
        }
        if !Path::new(&self.worker_path).exists() {
            return Err(ConfigError::WorkerNotFound(self.worker_path.clone()));
        }
        Ok(())
    }

    /// Base name of the worker executable, used by the emergency sweep.
    pub fn executable_name(&self) -> Option<&str> {
        self.worker_path.file_name().and_then(|n| n.to_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_endpoint_paths() {
        assert_eq!(Role::Buyer.endpoint_path(), "/buyer/p2p");
        assert_eq!(Role::Seller.endpoint_path(), "/seller/p2p");
    }

    #[test]
    fn test_role_counterparty_flag() {
        assert_eq!(
            Role::Buyer.counterparty_source_flag(),
            "--list-of-sellers-source=env"
        );
        assert_eq!(
            Role::Seller.counterparty_source_flag(),
            "--list-of-buyers-source=env"
        );
    }

    #[test]
    fn test_role_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Buyer).unwrap(), "\"buyer\"");
        let role: Role = serde_json::from_str("\"seller\"").unwrap();
        assert_eq!(role, Role::Seller);
    }

    #[test]
    fn test_device_info_counterparty_keys_filters_holes() {
        let mut info = DeviceInfo::new("0xabc", "0.0.1234", "key", "0.0.999");
        info.seller_admin_keys = vec![Some("a".into()), None, Some("b".into())];
        assert_eq!(info.counterparty_keys(Role::Buyer), vec!["a", "b"]);
        assert!(info.counterparty_keys(Role::Seller).is_empty());
    }

    #[test]
    fn test_device_info_camel_case_round_trip() {
        let info = DeviceInfo::new("0xabc", "0.0.1234", "key", "0.0.999");
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"evmAddress\""));
        assert!(json.contains("\"extractedPrivateKey\""));
        let back: DeviceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_device_info_defaults_on_sparse_json() {
        let info: DeviceInfo = serde_json::from_str(
            r#"{"evmAddress":"0x1","accountId":"0.0.2","extractedPrivateKey":"k","smartContract":"0.0.3"}"#,
        )
        .unwrap();
        assert_eq!(info.eth_rpc_url, DEFAULT_ETH_RPC_URL);
        assert_eq!(info.mirror_api_url, DEFAULT_MIRROR_API_URL);
        assert!(info.unique_port.is_none());
    }

    #[test]
    fn test_validate_missing_executable() {
        let config = OrchestratorConfig::new("/nonexistent/peer-worker");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WorkerNotFound(_))
        ));
    }

    #[test]
    fn test_validate_inverted_port_range() {
        let mut config = OrchestratorConfig::new("/bin/sh");
        config.port_range = (7000, 6000);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPortRange(7000, 6000))
        ));
    }

    #[test]
    fn test_executable_name() {
        let config = OrchestratorConfig::new("/opt/peer/bin/peer-worker");
        assert_eq!(config.executable_name(), Some("peer-worker"));
    }
}
