//! Configuration management for PeerLink
//!
//! This module handles application configuration including:
//! - Loading and saving the TOML configuration file
//! - Managing the configuration directory
//! - Applying environment variable overrides
//! - Configuration validation

use crate::error::{ConfigError, ConfigResult};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// Constants for configuration (avoiding magic numbers)
const CONFIG_FILE_NAME: &str = "config.toml";

const DEFAULT_LISTEN_PORT: u16 = 8000;
const DEFAULT_PORT_PROBE_ATTEMPTS: u16 = 10;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 2;
const DEFAULT_MAX_RECONNECT_DELAY_SECS: u64 = 30;
const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

const DEFAULT_RELAY_HOST: &str = "0.0.0.0";
const DEFAULT_RELAY_PORT: u16 = 8080;
const DEFAULT_RELAY_HEARTBEAT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RELAY_SWEEP_INTERVAL_SECS: u64 = 5;
const DEFAULT_RELAY_SEND_QUEUE_CAPACITY: usize = 256;

const DEFAULT_DISCOVERY_PORT: u16 = 8085;
const DEFAULT_NODE_PORT: u16 = 8084;
const DEFAULT_BROADCAST_ADDRESS: &str = "255.255.255.255";
const DEFAULT_BROADCAST_INTERVAL_SECS: u64 = 30;
const DEFAULT_MAX_NODE_AGE_SECS: u64 = 300;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local node identity
    pub node: NodeConfig,

    /// Peer networking configuration
    pub network: NetworkConfig,

    /// TURN relay credentials
    pub turn: TurnSettings,

    /// Relay server settings (client and server side)
    pub relay: RelaySettings,

    /// Local network discovery
    pub discovery: DiscoverySettings,
}

/// Local node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable peer identifier announced to other peers
    pub peer_id: String,

    /// Optional display name sent in auth frames
    pub username: Option<String>,
}

/// Reconnection delay growth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay before every attempt
    Fixed,
    /// Delay doubles each attempt, capped at `max_reconnect_delay_secs`
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(ConfigError::InvalidValue(format!(
                "Unknown backoff strategy: {}",
                other
            ))),
        }
    }
}

/// Peer networking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port to listen on (0 for an OS-assigned port)
    pub listen_port: u16,

    /// How many consecutive ports to try when the listen port is taken
    pub port_probe_attempts: u16,

    /// Direct TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Heartbeat interval in seconds (timeout is twice this)
    pub heartbeat_interval_secs: u64,

    /// Grace period for an inbound connection to authenticate
    pub auth_timeout_secs: u64,

    /// STUN servers queried at startup, as host:port
    pub stun_servers: Vec<String>,

    /// Reconnection attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Base delay between reconnection attempts in seconds
    pub reconnect_delay_secs: u64,

    /// Upper bound for exponential backoff in seconds
    pub max_reconnect_delay_secs: u64,

    /// Delay growth strategy
    pub backoff: BackoffKind,

    /// Largest frame accepted from a peer
    pub max_frame_size: usize,
}

/// TURN relay credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnSettings {
    /// TURN server as host:port; port 443 selects TCP
    pub server: Option<String>,

    /// Long-term credential username
    pub username: String,

    /// Long-term credential password
    pub password: String,
}

/// Relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Relay URL used by peers, e.g. ws://relay.example.org:8080
    pub url: Option<String>,

    /// Shared HMAC secret; empty disables token checks
    pub secret_key: String,

    /// Relay server bind host
    pub host: String,

    /// Relay server bind port
    pub port: u16,

    /// Sessions silent for longer than this are dropped
    pub heartbeat_timeout_secs: u64,

    /// Interval between heartbeat sweeps
    pub sweep_interval_secs: u64,

    /// Frames queued per client before the relay drops it
    pub send_queue_capacity: usize,
}

/// Local network discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Enable UDP broadcast discovery
    pub enabled: bool,

    /// UDP port for announcements
    pub discovery_port: u16,

    /// Port advertised to other nodes
    pub node_port: u16,

    /// Broadcast destination
    pub broadcast_address: String,

    /// Seconds between announcements
    pub broadcast_interval_secs: u64,

    /// Nodes not heard from for this long are ignored
    pub max_node_age_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            username: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            port_probe_attempts: DEFAULT_PORT_PROBE_ATTEMPTS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            auth_timeout_secs: DEFAULT_AUTH_TIMEOUT_SECS,
            stun_servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
                "stun.cloudflare.com:3478".to_string(),
            ],
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            max_reconnect_delay_secs: DEFAULT_MAX_RECONNECT_DELAY_SECS,
            backoff: BackoffKind::Fixed,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            url: None,
            secret_key: String::new(),
            host: DEFAULT_RELAY_HOST.to_string(),
            port: DEFAULT_RELAY_PORT,
            heartbeat_timeout_secs: DEFAULT_RELAY_HEARTBEAT_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_RELAY_SWEEP_INTERVAL_SECS,
            send_queue_capacity: DEFAULT_RELAY_SEND_QUEUE_CAPACITY,
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            node_port: DEFAULT_NODE_PORT,
            broadcast_address: DEFAULT_BROADCAST_ADDRESS.to_string(),
            broadcast_interval_secs: DEFAULT_BROADCAST_INTERVAL_SECS,
            max_node_age_secs: DEFAULT_MAX_NODE_AGE_SECS,
        }
    }
}

/// Generates a peer id from the host name and a random suffix
fn default_peer_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "peer".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

impl Config {
    /// Validates configuration values
    pub fn validate(&self) -> ConfigResult<()> {
        if self.node.peer_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "Peer ID must not be empty".to_string(),
            ));
        }

        if self.network.port_probe_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "Port probe attempts must be at least 1".to_string(),
            ));
        }

        if self.network.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "Heartbeat interval must be at least 1 second".to_string(),
            ));
        }

        if self.network.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "Connect timeout must be positive".to_string(),
            ));
        }

        if self.network.max_frame_size < 1024 {
            return Err(ConfigError::InvalidValue(
                "Maximum frame size must be at least 1024 bytes".to_string(),
            ));
        }

        if self.network.backoff == BackoffKind::Exponential
            && self.network.max_reconnect_delay_secs < self.network.reconnect_delay_secs
        {
            return Err(ConfigError::InvalidValue(
                "Maximum reconnect delay must not be below the base delay".to_string(),
            ));
        }

        if self.turn.server.is_some() && self.turn.username.is_empty() {
            return Err(ConfigError::InvalidValue(
                "TURN server configured without a username".to_string(),
            ));
        }

        if self.relay.sweep_interval_secs == 0 || self.relay.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "Relay sweep interval and heartbeat timeout must be positive".to_string(),
            ));
        }

        if !(30..=60).contains(&self.discovery.broadcast_interval_secs) {
            return Err(ConfigError::InvalidValue(
                "Discovery broadcast interval must be between 30 and 60 seconds".to_string(),
            ));
        }

        Ok(())
    }

    /// Applies overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides from an arbitrary variable lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PEER_ID") {
            self.node.peer_id = v;
        }
        if let Some(v) = lookup("USERNAME") {
            self.node.username = Some(v);
        }
        if let Some(v) = lookup("LISTEN_PORT") {
            self.network.listen_port = parse_var("LISTEN_PORT", &v)?;
        }
        if let Some(v) = lookup("STUN_SERVERS") {
            self.network.stun_servers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("MAX_RECONNECT_ATTEMPTS") {
            self.network.max_reconnect_attempts = parse_var("MAX_RECONNECT_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("RECONNECT_DELAY") {
            self.network.reconnect_delay_secs = parse_var("RECONNECT_DELAY", &v)?;
        }
        if let Some(v) = lookup("RECONNECT_BACKOFF") {
            self.network.backoff = v.parse()?;
        }
        if let Some(v) = lookup("TURN_SERVER") {
            self.turn.server = Some(v);
        }
        if let Some(v) = lookup("TURN_USERNAME") {
            self.turn.username = v;
        }
        if let Some(v) = lookup("TURN_PASSWORD") {
            self.turn.password = v;
        }
        if let Some(v) = lookup("RELAY_URL") {
            self.relay.url = Some(v);
        }
        if let Some(v) = lookup("SECRET_KEY") {
            self.relay.secret_key = v;
        }
        if let Some(v) = lookup("HOST") {
            self.relay.host = v;
        }
        if let Some(v) = lookup("PORT") {
            self.relay.port = parse_var("PORT", &v)?;
        }
        if let Some(v) = lookup("DISCOVERY_PORT") {
            self.discovery.discovery_port = parse_var("DISCOVERY_PORT", &v)?;
        }
        if let Some(v) = lookup("NODE_PORT") {
            self.discovery.node_port = parse_var("NODE_PORT", &v)?;
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnvVar {
        name: name.to_string(),
        value: value.to_string(),
    })
}

/// Configuration manager
pub struct ConfigManager {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Creates a ConfigManager for the platform configuration directory
    ///
    /// # Errors
    ///
    /// Returns error if project directory cannot be determined
    pub fn new() -> ConfigResult<Self> {
        let config_dir = Self::get_config_directory()?;
        Ok(Self::with_directory(config_dir))
    }

    /// Creates a ConfigManager rooted at an explicit directory
    pub fn with_directory(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        let config_file = config_dir.join(CONFIG_FILE_NAME);
        Self {
            config_dir,
            config_file,
        }
    }

    /// Gets the configuration directory path
    fn get_config_directory() -> ConfigResult<PathBuf> {
        ProjectDirs::from("com", "peerlink", "PeerLink")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or_else(|| {
                ConfigError::DirectoryNotFound(
                    "Could not determine configuration directory".to_string(),
                )
            })
    }

    /// Ensures the configuration directory exists
    fn ensure_config_directory(&self) -> ConfigResult<()> {
        if !self.config_dir.exists() {
            fs::create_dir_all(&self.config_dir).map_err(|e| {
                ConfigError::DirectoryCreationFailed(format!(
                    "Failed to create config directory at {:?}: {}",
                    self.config_dir, e
                ))
            })?;
        }
        Ok(())
    }

    /// Loads configuration from file, or creates default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns error if configuration cannot be loaded or created
    pub fn load_or_create_default(&self) -> ConfigResult<Config> {
        self.ensure_config_directory()?;

        if self.config_file.exists() {
            self.load()
        } else {
            let config = Config::default();
            self.save(&config)?;
            Ok(config)
        }
    }

    /// Loads configuration from file and applies environment overrides
    pub fn load_with_env(&self) -> ConfigResult<Config> {
        let mut config = self.load_or_create_default()?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from file
    pub fn load(&self) -> ConfigResult<Config> {
        let content = fs::read_to_string(&self.config_file).map_err(|e| {
            ConfigError::LoadFailed(format!("Failed to read config file: {}", e))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            ConfigError::LoadFailed(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file
    ///
    /// # Errors
    ///
    /// Returns error if configuration cannot be saved
    pub fn save(&self, config: &Config) -> ConfigResult<()> {
        self.ensure_config_directory()?;
        config.validate()?;

        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::SaveFailed(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(&self.config_file, content).map_err(|e| {
            ConfigError::SaveFailed(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Gets the configuration file path
    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Gets the configuration directory path
    pub fn config_directory(&self) -> &Path {
        &self.config_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.listen_port, 8000);
        assert_eq!(config.network.max_reconnect_attempts, 3);
        assert_eq!(config.relay.port, 8080);
        assert_eq!(config.discovery.discovery_port, 8085);
        assert_eq!(config.discovery.node_port, 8084);
        assert!(!config.node.peer_id.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.network.heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.discovery.broadcast_interval_secs = 5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.turn.server = Some("turn.example.org:3478".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.network.listen_port, deserialized.network.listen_port);
        assert_eq!(config.node.peer_id, deserialized.node.peer_id);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[network]\nlisten_port = 9100\n").unwrap();
        assert_eq!(config.network.listen_port, 9100);
        assert_eq!(config.network.reconnect_delay_secs, 2);
        assert_eq!(config.network.backoff, BackoffKind::Fixed);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LISTEN_PORT", "9001"),
            ("STUN_SERVERS", "a.example:3478, b.example:19302"),
            ("MAX_RECONNECT_ATTEMPTS", "5"),
            ("RECONNECT_BACKOFF", "exponential"),
            ("SECRET_KEY", "s3cret"),
            ("PORT", "9090"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.network.listen_port, 9001);
        assert_eq!(
            config.network.stun_servers,
            vec!["a.example:3478".to_string(), "b.example:19302".to_string()]
        );
        assert_eq!(config.network.max_reconnect_attempts, 5);
        assert_eq!(config.network.backoff, BackoffKind::Exponential);
        assert_eq!(config.relay.secret_key, "s3cret");
        assert_eq!(config.relay.port, 9090);
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = Config::default();
        let result = config.apply_overrides_from(|name| {
            (name == "LISTEN_PORT").then(|| "not-a-port".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidEnvVar { .. })));
    }

    #[test]
    fn test_load_or_create_default() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_directory(temp_dir.path().join("peerlink"));

        let created = manager.load_or_create_default().unwrap();
        assert!(manager.config_file().exists());

        let loaded = manager.load().unwrap();
        assert_eq!(created.node.peer_id, loaded.node.peer_id);
    }
}
