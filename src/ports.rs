use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("no port available in range {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },
    #[error("failed to persist port reservations: {0}")]
    Persist(#[from] std::io::Error),
}

/// One owner's claim on a loopback port. `reserved_at` ages the claim out;
/// `last_used` is refreshed every time the owner comes back for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortReservation {
    pub port: u16,
    pub owner_id: String,
    pub reserved_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Persistent port reservations keyed by owner. One owner holds at most one
/// port; a port is held by at most one owner. Reservations survive host
/// restarts via a JSON file written atomically.
pub struct PortRegistry {
    path: PathBuf,
    range: (u16, u16),
    ttl: Duration,
    reservations: HashMap<String, PortReservation>,
}

impl PortRegistry {
    /// Load reservations from disk. A missing file is an empty registry;
    /// entries that fail to parse or fall outside the configured range are
    /// dropped rather than failing the load.
    pub fn load(path: PathBuf, range: (u16, u16), ttl: Duration) -> Self {
        let mut reservations = HashMap::new();

        if let Ok(contents) = std::fs::read_to_string(&path)
            && let Ok(serde_json::Value::Object(map)) = serde_json::from_str(&contents)
        {
            for (owner_id, value) in map {
                match serde_json::from_value::<PortReservation>(value) {
                    Ok(res) if res.port >= range.0 && res.port <= range.1 => {
                        reservations.insert(owner_id, res);
                    }
                    Ok(res) => {
                        eprintln!(
                            "peermgr: dropping reservation for '{owner_id}': port {} outside range {}-{}",
                            res.port, range.0, range.1
                        );
                    }
                    Err(e) => {
                        eprintln!("peermgr: dropping invalid reservation for '{owner_id}': {e}");
                    }
                }
            }
        }

        Self {
            path,
            range,
            ttl,
            reservations,
        }
    }

    /// Write all reservations to disk. Writes to a sibling temp file first
    /// and renames it into place, so readers never observe a torn file.
    pub async fn save(&self) -> Result<(), PortError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let map: serde_json::Map<String, serde_json::Value> = self
            .reservations
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

    /// Reserve a port for `owner_id`. Resolution order: the owner's existing
    /// non-expired reservation (if still bindable), then `preferred` (if free
    /// and unreserved), then a linear scan of the range. Persists on success.
    pub async fn reserve_port(
        &mut self,
        owner_id: &str,
        preferred: Option<u16>,
    ) -> Result<u16, PortError> {
        let now = Utc::now();

        if let Some(existing) = self.reservations.get(owner_id) {
            let age = now.signed_duration_since(existing.reserved_at);
            let expired = age.num_seconds() >= self.ttl.as_secs() as i64;
            let port = existing.port;
            // Reuse only while fresh, in range, and still bindable.
            if !expired
                && port >= self.range.0
                && port <= self.range.1
                && is_port_available(port).await
            {
                if let Some(res) = self.reservations.get_mut(owner_id) {
                    res.last_used = now;
                }
                self.save().await?;
                return Ok(port);
            }
            // Stale, or squatted by someone else; drop it and pick again.
            self.reservations.remove(owner_id);
        }

        let reserved_ports: std::collections::HashSet<u16> =
            self.reservations.values().map(|r| r.port).collect();

        let mut candidate = None;
        if let Some(p) = preferred
            && p >= self.range.0
            && p <= self.range.1
            && !reserved_ports.contains(&p)
            && is_port_available(p).await
        {
            candidate = Some(p);
        }

        if candidate.is_none() {
            for port in self.range.0..=self.range.1 {
                if reserved_ports.contains(&port) {
                    continue;
                }
                if is_port_available(port).await {
                    candidate = Some(port);
                    break;
                }
            }
        }

        let Some(port) = candidate else {
            return Err(PortError::NoPortAvailable {
                start: self.range.0,
                end: self.range.1,
            });
        };

        self.reservations.insert(
            owner_id.to_string(),
            PortReservation {
                port,
                owner_id: owner_id.to_string(),
                reserved_at: now,
                last_used: now,
            },
        );
        self.save().await?;
        Ok(port)
    }

    /// Release the owner's reservation, returning the freed port if one
    /// was held.
    pub async fn release_port(&mut self, owner_id: &str) -> Result<Option<u16>, PortError> {
        let removed = self.reservations.remove(owner_id);
        if removed.is_some() {
            self.save().await?;
        }
        Ok(removed.map(|r| r.port))
    }

    pub fn port_for(&self, owner_id: &str) -> Option<u16> {
        self.reservations.get(owner_id).map(|r| r.port)
    }

    /// Record that `owner_id` holds `port` right now, bypassing the bind
    /// probe. Used when adopting a worker already listening on the port,
    /// where the probe would wrongly report it taken.
    pub async fn reclaim_port(&mut self, owner_id: &str, port: u16) -> Result<(), PortError> {
        let now = Utc::now();
        self.reservations.insert(
            owner_id.to_string(),
            PortReservation {
                port,
                owner_id: owner_id.to_string(),
                reserved_at: now,
                last_used: now,
            },
        );
        self.save().await
    }

    /// Refresh the owner's `last_used` stamp without changing the port.
    pub async fn touch(&mut self, owner_id: &str) -> Result<(), PortError> {
        if let Some(res) = self.reservations.get_mut(owner_id) {
            res.last_used = Utc::now();
            self.save().await?;
        }
        Ok(())
    }

    /// Drop reservations older than the TTL. Persists once if anything
    /// was removed; returns the number of dropped entries.
    pub async fn cleanup_expired_reservations(&mut self) -> Result<usize, PortError> {
        let now = Utc::now();
        let ttl_secs = self.ttl.as_secs() as i64;
        let before = self.reservations.len();
        self.reservations
            .retain(|_, r| now.signed_duration_since(r.reserved_at).num_seconds() < ttl_secs);
        let removed = before - self.reservations.len();
        if removed > 0 {
            self.save().await?;
        }
        Ok(removed)
    }

    pub fn stats(&self) -> PortStats {
        PortStats {
            reserved: self.reservations.len(),
            range: self.range,
        }
    }

    #[cfg(test)]
    fn backdate(&mut self, owner_id: &str, age: chrono::TimeDelta) {
        if let Some(res) = self.reservations.get_mut(owner_id) {
            res.reserved_at -= age;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PortStats {
    pub reserved: usize,
    pub range: (u16, u16),
}

/// Bind probe on the loopback interface. A successful bind is immediately
/// dropped; the port is only checked, never held.
pub async fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}
