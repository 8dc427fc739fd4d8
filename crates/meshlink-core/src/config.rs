//! Configuration system for meshlink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESHLINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meshlink/config.toml
//!   3. ~/.config/meshlink/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::message::HostAddr;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshlinkConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub resources: ResourceConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable client identifier. Empty = derived from the signing key.
    pub client_id: String,
    /// Address the peer listener binds to.
    pub listen_address: String,
    /// TCP port for peer sessions.
    pub listen_port: u16,
    /// Address advertised to other nodes. Empty = not advertised.
    pub public_address: String,
    /// Supernodes become the rendezvous origin when a request carries none.
    pub super_node: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Seed node host. Empty = no automatic connect.
    pub seed_host: String,
    /// Seed node port. Kept wide so out-of-range values can be reported
    /// instead of failing the whole file.
    pub seed_port: i64,
    /// Target number of active peers.
    pub opt_num_peers: usize,
    /// Sessions silent for longer than this are disconnected.
    pub session_timeout_secs: u64,
    /// Interval between forced refresh disconnects.
    pub refresh_interval_secs: u64,
    /// Minimum gap between broadcast get-peers / get-tasks requests.
    pub request_interval_secs: u64,
    /// Discovery/churn tick.
    pub tick_interval_ms: u64,
    /// Liveness ping interval.
    pub ping_interval_secs: u64,
    /// Outbound attempts per pending candidate before it is dropped from the queue.
    pub max_connection_attempts: u32,
    /// Rendezvous records older than this are swept.
    pub rendezvous_ttl_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Port of the local resource server. 0 = not serving resources.
    pub resource_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Local status endpoint port.
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            listen_address: "0.0.0.0".to_string(),
            listen_port: 40102,
            public_address: String::new(),
            super_node: false,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            seed_host: String::new(),
            seed_port: 40102,
            opt_num_peers: 2,
            session_timeout_secs: 240,
            refresh_interval_secs: 900,
            request_interval_secs: 2,
            tick_interval_ms: 1000,
            ping_interval_secs: 20,
            max_connection_attempts: 3,
            rendezvous_ttl_secs: 600,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 9190 }
    }
}

impl NetworkConfig {
    /// Validated seed endpoint. Port must be in [1, 65535] and host non-empty.
    pub fn seed_endpoint(&self) -> Result<HostAddr, ConfigError> {
        let port = u16::try_from(self.seed_port)
            .ok()
            .filter(|p| *p >= 1)
            .ok_or(ConfigError::SeedPortOutOfRange(self.seed_port))?;
        if self.seed_host.trim().is_empty() {
            return Err(ConfigError::EmptySeedHost);
        }
        Ok(HostAddr::new(self.seed_host.clone(), port))
    }

    /// True when the seed settings cannot be used for an automatic connect.
    pub fn wrong_seed_data(&self) -> bool {
        match self.seed_endpoint() {
            Ok(_) => false,
            Err(ConfigError::EmptySeedHost) => true,
            Err(e) => {
                tracing::warn!(error = %e, "unusable seed configuration");
                true
            }
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_secs(self.request_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn rendezvous_ttl(&self) -> Duration {
        Duration::from_secs(self.rendezvous_ttl_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("meshlink")
}

fn dirs_or_home() -> PathBuf {
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
    #[error("seed port number out of range [1, 65535]: {0}")]
    SeedPortOutOfRange(i64),
    #[error("seed host is empty")]
    EmptySeedHost,
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshlinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeshlinkConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESHLINK_CONFIG")
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
            let text = toml::to_string_pretty(&MeshlinkConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MESHLINK_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MESHLINK_NODE__CLIENT_ID") {
            self.node.client_id = v;
        }
        if let Ok(v) = std::env::var("MESHLINK_NODE__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.node.listen_port = p;
            }
        }
        if let Ok(v) = std::env::var("MESHLINK_NODE__SUPER_NODE") {
            self.node.super_node = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MESHLINK_NETWORK__SEED_HOST") {
            self.network.seed_host = v;
        }
        if let Ok(v) = std::env::var("MESHLINK_NETWORK__SEED_PORT") {
            match v.parse() {
                Ok(p) => self.network.seed_port = p,
                Err(e) => tracing::error!(value = %v, error = %e, "wrong seed port number"),
            }
        }
        if let Ok(v) = std::env::var("MESHLINK_NETWORK__OPT_NUM_PEERS") {
            if let Ok(n) = v.parse() {
                self.network.opt_num_peers = n;
            }
        }
        if let Ok(v) = std::env::var("MESHLINK_API__PORT") {
            if let Ok(p) = v.parse() {
                self.api.port = p;
            }
        }
    }
}
