//! Runtime configuration
//!
//! Settings are read from an optional TOML file; every field has a default.
//! The signaling URL and relay credentials are secrets and are usually
//! injected through the environment (`SIGNALING_URL`, `RELAY_USERNAME`,
//! `RELAY_PASSWORD`), which always wins over the file.

use std::path::Path;
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:3479";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSyncConfig {
    pub poll_interval_ms: u64,
    pub window_len: usize,
    /// Stop after this many polls. Unset means poll until cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_samples: Option<u32>,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            window_len: 9,
            max_samples: None,
        }
    }
}

impl ClockSyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Client side configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub signaling_url: String,
    pub request_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    pub ice_servers: Vec<IceServer>,
    pub reconnect: ReconnectConfig,
    pub clock: ClockSyncConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            request_timeout_ms: 10_000,
            connection_timeout_ms: 30_000,
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.relay.metered.ca:80".to_string()],
                username: None,
                credential: None,
            }],
            reconnect: ReconnectConfig::default(),
            clock: ClockSyncConfig::default(),
        }
    }
}

const RELAY_URLS: [&str; 4] = [
    "turn:a.relay.metered.ca:80",
    "turn:a.relay.metered.ca:80?transport=tcp",
    "turn:a.relay.metered.ca:443",
    "turn:a.relay.metered.ca:443?transport=tcp",
];

impl NetworkConfig {
    /// Load from `path` if it exists, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> io::Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                toml::from_str(&contents).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid config file {}: {}", path.display(), e),
                    )
                })?
            }
            Some(path) => {
                warn!("Config file {} not found, using defaults", path.display());
                NetworkConfig::default()
            }
            None => NetworkConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `SIGNALING_URL`, `RELAY_USERNAME` and `RELAY_PASSWORD`.
    /// Relay credentials add the TURN servers when both are present.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("SIGNALING_URL") {
            self.signaling_url = url;
        }

        if let (Some(username), Some(credential)) = (var("RELAY_USERNAME"), var("RELAY_PASSWORD")) {
            self.ice_servers.retain(|s| s.username.is_none());
            self.ice_servers.push(IceServer {
                urls: RELAY_URLS.iter().map(|u| u.to_string()).collect(),
                username: Some(username),
                credential: Some(credential),
            });
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// Reference hub configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Connection attempts older than this are dropped
    pub attempt_ttl_ms: u64,
    /// How long a member gets to publish an offer during `ConnectToRoomPlayers`
    pub invoke_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            attempt_ttl_ms: 60_000,
            invoke_timeout_ms: 5_000,
            sweep_interval_ms: 5_000,
        }
    }
}

impl HubConfig {
    pub fn attempt_ttl(&self) -> Duration {
        Duration::from_millis(self.attempt_ttl_ms)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
