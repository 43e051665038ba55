use crate::config::{DeviceInfo, Role};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum EnvFileError {
    #[error("failed to read env file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write env file '{path}': {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn strip_quotes(s: &str) -> String {
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
        {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

pub fn parse_env_contents(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();

    for line in contents.lines() {
        let trimmed = line.trim();

        // Skip blank lines and comments
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        // Split on first '='
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };

        let key = key.trim().to_string();
        if key.is_empty() {
            continue;
        }

        let value = strip_quotes(value.trim());
        map.insert(key, value);
    }

    map
}

pub async fn load_env_file(path: &Path) -> Result<HashMap<String, String>, EnvFileError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EnvFileError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
    Ok(parse_env_contents(&contents))
}

// ---------------------------------------------------------------------------
// Upsert
// ---------------------------------------------------------------------------

/// Replace the line whose key matches, else append. Blank lines are
/// stripped so repeated updates never grow the file.
pub fn upsert_line(contents: &str, key: &str, value: &str) -> String {
    let prefix = format!("{key}=");
    let mut lines: Vec<String> = contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(String::from)
        .collect();

    let mut replaced = false;
    for line in &mut lines {
        if line.starts_with(&prefix) {
            *line = format!("{key}={value}");
            replaced = true;
            break;
        }
    }
    if !replaced {
        lines.push(format!("{key}={value}"));
    }

    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Worker env rendering
// ---------------------------------------------------------------------------

/// The `key=value` pairs the worker binary expects, in stable order.
fn worker_env_pairs(
    owner_id: &str,
    device: &DeviceInfo,
    role: Role,
    port: u16,
) -> Vec<(String, String)> {
    vec![
        ("nodeid".into(), owner_id.to_string()),
        ("hedera_evm_id".into(), device.evm_address.clone()),
        ("hedera_id".into(), device.account_id.clone()),
        ("private_key".into(), device.extracted_private_key.clone()),
        (
            "smart_contract_address".into(),
            device.smart_contract.clone(),
        ),
        (
            role.counterparty_list_key().to_string(),
            device.counterparty_keys(role).join(","),
        ),
        ("unique_port".into(), port.to_string()),
        ("ws_port".into(), port.to_string()),
        ("eth_rpc_url".into(), device.eth_rpc_url.clone()),
        ("location".into(), device.location.clone()),
        ("mirror_api_url".into(), device.mirror_api_url.clone()),
    ]
}

pub fn render_worker_env(owner_id: &str, device: &DeviceInfo, role: Role, port: u16) -> String {
    worker_env_pairs(owner_id, device, role, port)
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Write (or update in place) the worker env file. An existing file keeps
/// any extra keys it carries; each managed key is upserted line by line.
pub async fn write_worker_env(
    path: &Path,
    owner_id: &str,
    device: &DeviceInfo,
    role: Role,
    port: u16,
) -> Result<(), EnvFileError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(existing) => {
            let mut updated = existing;
            for (key, value) in worker_env_pairs(owner_id, device, role, port) {
                updated = upsert_line(&updated, &key, &value);
            }
            updated
        }
        Err(_) => render_worker_env(owner_id, device, role, port),
    };

    tokio::fs::write(path, contents)
        .await
        .map_err(|e| EnvFileError::Write {
            path: path.display().to_string(),
            source: e,
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
