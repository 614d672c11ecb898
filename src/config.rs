//! Configuration management with validation and defaults
//!
//! One TOML document seeds the engine's settings block, the randomness
//! provider, storage and logging.

use crate::errors::{ConfigurationError, GuessRoundsError, GuessRoundsResult};
use crate::games::{Address, GameSettings, VrfParams, MAX_ROUND_DURATION};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete engine configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuessRoundsConfig {
    pub game: GameConfig,
    pub oracle: OracleConfig,
    pub storage: StorageConfig,
    pub monitoring: MonitoringConfig,
}

/// Initial values for the singleton settings block
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Owner address (0x-prefixed hex)
    pub owner: String,
    pub entry_fee_wei: u64,
    pub round_duration_seconds: u64,
    pub open_round_requests: bool,
    pub start_paused: bool,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            owner: Address::ZERO.to_string(),
            entry_fee_wei: 10_000_000_000_000, // 0.00001 ETH
            round_duration_seconds: 7200,
            open_round_requests: false,
            start_paused: false,
        }
    }
}

/// Which randomness provider the host wires in
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OracleProvider {
    /// In-process schnorrkel VRF, answers after `fulfillment_delay_ms`
    LocalVrf,
    /// Requests are recorded; seeds arrive through `fulfill`
    Deferred,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub provider: OracleProvider,
    pub coordinator: String,
    pub key_hash: String,
    pub subscription_id: u64,
    pub callback_gas_limit: u32,
    pub request_confirmations: u16,
    pub fulfillment_delay_ms: u64,
    /// 32-byte hex secret for the local VRF key; random when absent
    pub vrf_secret_hex: Option<String>,
    pub fulfillment_channel_capacity: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        let params = VrfParams::default();
        Self {
            provider: OracleProvider::Deferred,
            coordinator: params.coordinator,
            key_hash: params.key_hash,
            subscription_id: params.subscription_id,
            callback_gas_limit: params.callback_gas_limit,
            request_confirmations: params.request_confirmations,
            fulfillment_delay_ms: 500,
            vrf_secret_hex: None,
            fulfillment_channel_capacity: 64,
        }
    }
}

/// Storage configuration with RocksDB tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_directory: String,
    pub write_buffer_size_mb: usize,
    pub max_write_buffer_number: usize,
    pub target_file_size_mb: usize,
    pub compression_type: CompressionType,
    /// Whether to clear database on startup (testing only!)
    pub clear_on_start: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Rocksdb,
    Memory,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CompressionType {
    None,
    Snappy,
    Lz4,
    Zstd,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Rocksdb,
            data_directory: "./DB/guessrounds".to_string(),
            write_buffer_size_mb: 16,
            max_write_buffer_number: 2,
            target_file_size_mb: 64,
            compression_type: CompressionType::Lz4,
            clear_on_start: false, // Production default: preserve data
        }
    }
}

/// Logging and metrics configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enable_metrics: bool,
    pub enable_logging: bool,
    pub log_level: LogLevel,
    pub event_channel_capacity: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            enable_logging: true,
            log_level: LogLevel::Info,
            event_channel_capacity: 1024,
        }
    }
}

impl GuessRoundsConfig {
    /// Persistent RocksDB store, oracle answered by the local VRF key
    pub fn production() -> Self {
        Self {
            oracle: OracleConfig {
                provider: OracleProvider::LocalVrf,
                ..Default::default()
            },
            storage: StorageConfig {
                write_buffer_size_mb: 64,
                max_write_buffer_number: 4,
                clear_on_start: false, // Production: preserve round history
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// In-memory store and deferred oracle, for tests and dry runs
    pub fn testing() -> Self {
        Self {
            game: GameConfig {
                round_duration_seconds: 3600,
                ..Default::default()
            },
            oracle: OracleConfig {
                provider: OracleProvider::Deferred,
                fulfillment_delay_ms: 0,
                ..Default::default()
            },
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                clear_on_start: true,
                ..Default::default()
            },
            monitoring: MonitoringConfig {
                log_level: LogLevel::Debug,
                ..Default::default()
            },
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> GuessRoundsResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            GuessRoundsError::Configuration(ConfigurationError::LoadFailed(format!(
                "{}: {}",
                path.display(),
                e
            )))
        })?;
        let config: GuessRoundsConfig = toml::from_str(&text)?;
        config
            .validate()
            .map_err(|e| ConfigurationError::ValidationFailed(e.to_string()))?;
        Ok(config)
    }

    pub fn to_toml(&self) -> GuessRoundsResult<String> {
        toml::to_string_pretty(self).map_err(|e| {
            GuessRoundsError::Configuration(ConfigurationError::LoadFailed(e.to_string()))
        })
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.owner()?;

        if self.game.round_duration_seconds == 0 || self.game.round_duration_seconds > MAX_ROUND_DURATION {
            return Err(ConfigValidationError::InvalidValue(format!(
                "round_duration_seconds must be within 1..={}",
                MAX_ROUND_DURATION
            )));
        }

        if self.game.entry_fee_wei == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "entry_fee_wei must be > 0".to_string(),
            ));
        }

        if self.oracle.fulfillment_channel_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "fulfillment_channel_capacity must be > 0".to_string(),
            ));
        }

        if self.monitoring.event_channel_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "event_channel_capacity must be > 0".to_string(),
            ));
        }

        if let Some(secret) = &self.oracle.vrf_secret_hex {
            let ok = hex::decode(secret.trim_start_matches("0x"))
                .map(|b| b.len() == 32)
                .unwrap_or(false);
            if !ok {
                return Err(ConfigValidationError::InvalidValue(
                    "vrf_secret_hex must be 32 bytes of hex".to_string(),
                ));
            }
        }

        if self.storage.backend == StorageBackend::Rocksdb && self.storage.data_directory.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "storage.data_directory".to_string(),
            ));
        }

        Ok(())
    }

    pub fn owner(&self) -> Result<Address, ConfigValidationError> {
        self.game
            .owner
            .parse::<Address>()
            .map_err(|e| ConfigValidationError::InvalidValue(format!("game.owner: {}", e)))
    }

    pub fn vrf_params(&self) -> VrfParams {
        VrfParams {
            coordinator: self.oracle.coordinator.clone(),
            key_hash: self.oracle.key_hash.clone(),
            subscription_id: self.oracle.subscription_id,
            callback_gas_limit: self.oracle.callback_gas_limit,
            request_confirmations: self.oracle.request_confirmations,
        }
    }

    /// Settings block for a freshly initialised engine
    pub fn game_settings(&self) -> Result<GameSettings, ConfigValidationError> {
        Ok(GameSettings {
            owner: self.owner()?,
            entry_fee_wei: u128::from(self.game.entry_fee_wei),
            round_duration: self.game.round_duration_seconds,
            paused: self.game.start_paused,
            vrf: self.vrf_params(),
            open_round_requests: self.game.open_round_requests,
        })
    }

    pub fn fulfillment_delay(&self) -> Duration {
        Duration::from_millis(self.oracle.fulfillment_delay_ms)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ConfigValidationError {
    InvalidValue(String),
    MissingRequired(String),
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValidationError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
            ConfigValidationError::MissingRequired(msg) => write!(f, "Missing required configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(GuessRoundsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(GuessRoundsConfig::production().validate().is_ok());
        assert!(GuessRoundsConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_invalid_config_validation() {
        let mut config = GuessRoundsConfig::default();
        config.game.round_duration_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = GuessRoundsConfig::default();
        config.game.round_duration_seconds = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = GuessRoundsConfig::default();
        config.game.entry_fee_wei = 0;
        assert!(config.validate().is_err());

        let mut config = GuessRoundsConfig::default();
        config.game.owner = "not-an-address".to_string();
        assert!(config.validate().is_err());

        let mut config = GuessRoundsConfig::default();
        config.oracle.vrf_secret_hex = Some("abcd".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_game_settings_from_config() {
        let mut config = GuessRoundsConfig::default();
        config.game.owner = Address::repeat_byte(0xaa).to_string();
        config.game.entry_fee_wei = 123;

        let settings = config.game_settings().unwrap();
        assert_eq!(settings.owner, Address::repeat_byte(0xaa));
        assert_eq!(settings.entry_fee_wei, 123);
        assert_eq!(settings.round_duration, 7200);
        assert_eq!(settings.vrf.callback_gas_limit, 250_000);
        assert_eq!(settings.vrf.request_confirmations, 3);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            [game]
            owner = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            round_duration_seconds = 600

            [oracle]
            provider = "local_vrf"
        "#;
        let config: GuessRoundsConfig = toml::from_str(text).unwrap();
        assert_eq!(config.game.round_duration_seconds, 600);
        assert_eq!(config.game.entry_fee_wei, 10_000_000_000_000);
        assert_eq!(config.oracle.provider, OracleProvider::LocalVrf);
        assert_eq!(config.storage.data_directory, "./DB/guessrounds");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guessrounds.toml");
        let config = GuessRoundsConfig::production();
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = GuessRoundsConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.oracle.provider, OracleProvider::LocalVrf);
        assert_eq!(loaded.storage.write_buffer_size_mb, 64);
    }
}
