//! Configuration system for Tether.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub identity: IdentityConfig,
    pub channel: ChannelConfig,
    pub rpc: RpcSettings,
    pub tunnel: TunnelSettings,
    pub peer: PeerConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name this peer uses as the event source and call target.
    pub name: String,
}

/// Ceilings of the two transport primitives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Max bytes in a single call payload.
    pub max_call_payload: usize,
    /// Max bytes in a single published event.
    pub max_event_payload: usize,
}

/// Chunked call-channel RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    /// Idle time after which a half-finished exchange is evicted, unless the
    /// caller asked for another one with `timeoutMs`.
    pub exchange_timeout_secs: u64,
    /// Upper bound on a caller-supplied `timeoutMs`.
    pub max_exchange_timeout_secs: u64,
    /// How often the eviction sweep runs.
    pub sweep_interval_secs: u64,
    /// Deadline for a whole chunked call made by this peer. It is also sent
    /// as `timeoutMs`, so the receiving peer keeps the exchange at least
    /// this long (up to its own `max_exchange_timeout_secs`).
    pub call_timeout_secs: u64,
    /// Largest compressed request a peer may declare in `totalLength`.
    pub max_body_length: usize,
}

/// Event-channel HTTP tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// How long a tunnelled request waits for its response.
    pub request_timeout_secs: u64,
    /// Idle time after which a partially received request is evicted.
    pub exchange_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Largest compressed request body a peer may declare in `bodyLength`.
    pub max_body_length: usize,
    /// Base URL tunnelled requests from `/proxy` are rewritten onto.
    /// The peer executes them against this address.
    pub forward_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Base URL of the peer daemon. Empty = no peer, tunnel client disabled.
    pub url: String,
    /// Peer identity, used as the call target.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: "tether".to_string(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_call_payload: 128 * 1024,
            max_event_payload: 256 * 1024,
        }
    }
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            exchange_timeout_secs: 20,
            max_exchange_timeout_secs: 120,
            sweep_interval_secs: 10,
            call_timeout_secs: 60,
            max_body_length: 64 * 1024 * 1024,
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 300,
            exchange_timeout_secs: 20,
            sweep_interval_secs: 10,
            max_body_length: 64 * 1024 * 1024,
            forward_base_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            name: "peer".to_string(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 9101 }
    }
}

impl RpcSettings {
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }

    pub fn max_exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.max_exchange_timeout_secs.max(self.exchange_timeout_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl TunnelSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("tether")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TetherConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TetherConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TETHER_* overrides read through `lookup`.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TETHER_IDENTITY__NAME") {
            self.identity.name = v;
        }
        if let Some(v) = lookup("TETHER_PEER__URL") {
            self.peer.url = v;
        }
        if let Some(v) = lookup("TETHER_PEER__NAME") {
            self.peer.name = v;
        }
        if let Some(p) = lookup("TETHER_API__PORT").and_then(|v| v.parse().ok()) {
            self.api.port = p;
        }
        if let Some(n) = lookup("TETHER_CHANNEL__MAX_CALL_PAYLOAD").and_then(|v| v.parse().ok()) {
            self.channel.max_call_payload = n;
        }
        if let Some(n) = lookup("TETHER_CHANNEL__MAX_EVENT_PAYLOAD").and_then(|v| v.parse().ok()) {
            self.channel.max_event_payload = n;
        }
        if let Some(v) = lookup("TETHER_TUNNEL__FORWARD_BASE_URL") {
            self.tunnel.forward_base_url = v;
        }
    }
}
