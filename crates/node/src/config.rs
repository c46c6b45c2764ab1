//! Configuration management for the bitchat node.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/bitchat/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bitchat_protocol::{KdfParams, PeerId};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("nickname must be 1 to 255 bytes, got {0} bytes")]
    InvalidNickname(usize),

    #[error("peer_id must be 32 hex characters, got {0:?}")]
    InvalidPeerId(String),

    #[error("default_ttl must be between 1 and 255, got {0}")]
    InvalidTtl(u8),

    #[error("dedup_capacity must be between 1 and 1000000, got {0}")]
    InvalidDedupCapacity(usize),

    #[error("network_key cannot be empty")]
    EmptyNetworkKey,

    #[error("kdf memory_kib must be at least 8 x parallelism, got {memory_kib} KiB for {parallelism} lanes")]
    InvalidKdfMemory { memory_kib: u32, parallelism: u32 },

    #[error("kdf iterations and parallelism must be positive")]
    InvalidKdfCost,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Shared key of the public mesh; every peer signs packets with it.
pub const DEFAULT_NETWORK_KEY: &str = "bitchat-public-mesh";

/// Main configuration structure for a bitchat node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Local identity, logging and storage.
    pub node: NodeConfig,

    /// Mesh behavior.
    pub mesh: MeshConfig,

    /// Channel key derivation cost.
    pub crypto: KdfParams,
}

/// Local identity, logging and storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Nickname shown to other peers.
    pub nickname: String,

    /// 16-byte peer id as hex. Generated when empty.
    pub peer_id: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily rolling log files, relative paths resolved
    /// against `data_dir`. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,

    /// Directory for node data; the base of relative paths.
    pub data_dir: PathBuf,
}

/// Mesh behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    /// Hop budget of locally originated packets.
    pub default_ttl: u8,

    /// Shared secret the packet signatures are keyed with.
    pub network_key: String,

    /// Pad chat payloads to standard block sizes.
    pub pad_messages: bool,

    /// Messages remembered per duplicate filter generation.
    pub dedup_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            nickname: "anon".to_string(),
            peer_id: String::new(),
            log_level: "info".to_string(),
            log_dir: None,
            data_dir: default_data_dir(),
        }
    }
}

impl NodeConfig {
    /// Where rolling log files are written, if anywhere.
    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_dir.as_ref().map(|dir| self.data_dir.join(dir))
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            default_ttl: bitchat_protocol::DEFAULT_TTL,
            network_key: DEFAULT_NETWORK_KEY.to_string(),
            pad_messages: true,
            dedup_capacity: 1000,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bitchat")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bitchat")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - BITCHAT_NICKNAME: Override nickname
    /// - BITCHAT_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(nickname) = std::env::var("BITCHAT_NICKNAME") {
            if !nickname.is_empty() {
                tracing::info!("Overriding nickname from environment: {}", nickname);
                self.node.nickname = nickname;
            }
        }

        if let Ok(level) = std::env::var("BITCHAT_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.node.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nickname_len = self.node.nickname.len();
        if nickname_len == 0 || nickname_len > 255 {
            return Err(ConfigError::InvalidNickname(nickname_len));
        }

        if !self.node.peer_id.is_empty() && PeerId::from_hex(&self.node.peer_id).is_none() {
            return Err(ConfigError::InvalidPeerId(self.node.peer_id.clone()));
        }

        if self.mesh.default_ttl == 0 {
            return Err(ConfigError::InvalidTtl(self.mesh.default_ttl));
        }

        if self.mesh.dedup_capacity == 0 || self.mesh.dedup_capacity > 1_000_000 {
            return Err(ConfigError::InvalidDedupCapacity(self.mesh.dedup_capacity));
        }

        if self.mesh.network_key.is_empty() {
            return Err(ConfigError::EmptyNetworkKey);
        }

        if self.crypto.iterations == 0 || self.crypto.parallelism == 0 {
            return Err(ConfigError::InvalidKdfCost);
        }
        if self.crypto.memory_kib < 8 * self.crypto.parallelism {
            return Err(ConfigError::InvalidKdfMemory {
                memory_kib: self.crypto.memory_kib,
                parallelism: self.crypto.parallelism,
            });
        }

        let level = self.node.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.node.log_level.clone()));
        }

        Ok(())
    }

    /// The configured peer id, or a random one when unset.
    ///
    /// Call [`Config::validate`] first; an invalid id is replaced too.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_hex(&self.node.peer_id).unwrap_or_else(generate_peer_id)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// A random peer id from the OS RNG.
pub fn generate_peer_id() -> PeerId {
    let mut bytes = [0u8; bitchat_protocol::PEER_ID_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    PeerId::from_bytes(bytes)
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.node.nickname, "anon");
        assert_eq!(config.node.log_level, "info");
        assert!(config.node.peer_id.is_empty());
        assert_eq!(config.node.log_dir, None);
        assert_eq!(config.mesh.default_ttl, 7);
        assert_eq!(config.mesh.network_key, DEFAULT_NETWORK_KEY);
        assert!(config.mesh.pad_messages);
        assert_eq!(config.mesh.dedup_capacity, 1000);
        assert_eq!(config.crypto, KdfParams::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_data_dir() {
        let config = NodeConfig::default();
        assert!(config.data_dir.to_string_lossy().contains("bitchat"));
    }

    #[test]
    fn test_log_path_resolves_against_data_dir() {
        let mut config = NodeConfig {
            data_dir: PathBuf::from("/srv/bitchat"),
            ..NodeConfig::default()
        };
        assert_eq!(config.log_path(), None);

        config.log_dir = Some(PathBuf::from("logs"));
        assert_eq!(config.log_path(), Some(PathBuf::from("/srv/bitchat/logs")));

        config.log_dir = Some(PathBuf::from("/var/log/bitchat"));
        assert_eq!(config.log_path(), Some(PathBuf::from("/var/log/bitchat")));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[node]
nickname = "alice"

[mesh]
default_ttl = 3
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.node.nickname, "alice");
        assert_eq!(config.mesh.default_ttl, 3);
        assert_eq!(config.node.log_level, "info");
        assert_eq!(config.mesh.network_key, DEFAULT_NETWORK_KEY);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[node]
nickname = "bob"
peer_id = "00112233445566778899aabbccddeeff"
log_level = "debug"
log_dir = "/var/log/bitchat"
data_dir = "/custom/data"

[mesh]
default_ttl = 5
network_key = "club"
pad_messages = false
dedup_capacity = 200

[crypto]
memory_kib = 1024
iterations = 3
parallelism = 2
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.node.nickname, "bob");
        assert_eq!(config.node.log_level, "debug");
        assert_eq!(config.node.log_dir, Some(PathBuf::from("/var/log/bitchat")));
        assert_eq!(config.node.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.mesh.default_ttl, 5);
        assert_eq!(config.mesh.network_key, "club");
        assert!(!config.mesh.pad_messages);
        assert_eq!(config.mesh.dedup_capacity, 200);
        assert_eq!(config.crypto.memory_kib, 1024);
        assert_eq!(config.crypto.iterations, 3);
        assert_eq!(config.crypto.parallelism, 2);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.peer_id().to_hex(),
            "00112233445566778899aabbccddeeff"
        );
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[node
nickname = "x"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[mesh]
default_ttl = "seven"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let mut original = Config::default();
        original.node.nickname = "carol".to_string();
        original.node.log_dir = Some(PathBuf::from("/tmp/logs"));
        original.mesh.pad_messages = false;

        let loaded = Config::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_to_toml_sections() {
        let toml = Config::default().to_toml().unwrap();
        assert!(toml.contains("[node]"));
        assert!(toml.contains("[mesh]"));
        assert!(toml.contains("[crypto]"));
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.node.nickname = "dave".to_string();
        config.save(&path).unwrap();

        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file_reports_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[node\n").unwrap();

        let err = format!("{:#}", Config::load(&path).unwrap_err());
        assert!(err.contains("Failed to parse config file"));
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.node.nickname = String::new();
        assert_eq!(config.validate(), Err(ConfigError::InvalidNickname(0)));

        let mut config = Config::default();
        config.node.peer_id = "xyz".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPeerId(_))
        ));

        let mut config = Config::default();
        config.mesh.default_ttl = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidTtl(0)));

        let mut config = Config::default();
        config.mesh.dedup_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidDedupCapacity(0)));

        let mut config = Config::default();
        config.mesh.network_key = String::new();
        assert_eq!(config.validate(), Err(ConfigError::EmptyNetworkKey));

        let mut config = Config::default();
        config.crypto.iterations = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidKdfCost));

        let mut config = Config::default();
        config.crypto.memory_kib = 4;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidKdfMemory { .. })
        ));

        let mut config = Config::default();
        config.node.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_log_level_is_case_insensitive() {
        let mut config = Config::default();
        config.node.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generated_peer_id_when_unset() {
        let config = Config::default();
        let first = config.peer_id();
        let second = config.peer_id();
        assert_ne!(first, second);
        assert!(!first.is_broadcast());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("BITCHAT_NICKNAME", "envnick");
        std::env::set_var("BITCHAT_LOG_LEVEL", "trace");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("BITCHAT_NICKNAME");
        std::env::remove_var("BITCHAT_LOG_LEVEL");

        assert_eq!(config.node.nickname, "envnick");
        assert_eq!(config.node.log_level, "trace");
    }

    #[test]
    #[serial]
    fn test_empty_env_values_are_ignored() {
        std::env::set_var("BITCHAT_NICKNAME", "");
        std::env::remove_var("BITCHAT_LOG_LEVEL");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("BITCHAT_NICKNAME");

        assert_eq!(config.node.nickname, "anon");
        assert_eq!(config.node.log_level, "info");
    }
}
