use std::time::Duration;
use tokio_tungstenite::connect_async;

/// Retry schedule for the readiness handshake.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Maximum handshake attempts before giving up.
    pub max_retries: u32,
    /// Per-attempt budget covering connect plus upgrade.
    pub attempt_timeout: Duration,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_retries: 60,
            attempt_timeout: Duration::from_secs(2),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Readiness check for a worker's control channel. The real probe performs
/// WebSocket handshakes against the worker's endpoint; `Fixed` short-circuits
/// to a canned answer so callers can be tested without a live worker.
#[derive(Debug, Clone)]
pub enum Probe {
    WebSocket(ProbeConfig),
    Fixed(bool),
}

impl Probe {
    /// Attempt the handshake until it succeeds or the retry budget runs
    /// out. Each successful connection is closed immediately; the probe
    /// only verifies the endpoint accepts upgrades.
    pub async fn test_connection(&self, port: u16, endpoint: &str) -> bool {
        let config = match self {
            Probe::Fixed(answer) => return *answer,
            Probe::WebSocket(config) => config,
        };

        let url = format!("ws://localhost:{port}{endpoint}");
        for attempt in 1..=config.max_retries {
            match tokio::time::timeout(config.attempt_timeout, connect_async(url.as_str())).await {
                Ok(Ok((stream, _response))) => {
                    drop(stream);
                    return true;
                }
                Ok(Err(_)) | Err(_) => {}
            }
            if attempt < config.max_retries {
                tokio::time::sleep(config.retry_delay).await;
            }
        }
        false
    }
}
