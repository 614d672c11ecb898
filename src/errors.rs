//! Error types for the GuessRounds engine and its host services
//!
//! Round-level rejections live in [`GameError`]; everything the host layer can
//! hit (config, storage, oracle delivery) is folded into [`GuessRoundsError`].

use crate::games::oracle::OracleError;
use crate::games::types::Address;
use std::fmt;

/// Root error type for all GuessRounds operations
#[derive(Debug)]
pub enum GuessRoundsError {
    /// Configuration related errors
    Configuration(ConfigurationError),

    /// Storage system errors
    Storage(StorageError),

    /// Randomness provider errors
    Oracle(OracleError),

    /// Rejected round operations
    Game(GameError),
}

/// Configuration and validation errors
#[derive(Debug)]
pub enum ConfigurationError {
    ValidationFailed(String),
    InvalidValue { field: String, value: String, reason: String },
    LoadFailed(String),
}

/// Storage system errors
#[derive(Debug)]
pub enum StorageError {
    DatabaseOpenFailed(String),
    ReadFailed(String),
    WriteFailed(String),
    CorruptedData(String),
    PermissionDenied(String),
}

/// Synchronous rejection of a single engine operation.
///
/// Returned after validation and before any recorded fact (guess, pot,
/// request, settlement, setting) changes. The only state a rejected call may
/// leave behind is the lazy close of an expired round, which is derived from
/// `end_time` and reads back the same either way.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("caller {caller} is not the owner")]
    Unauthorized { caller: Address },

    #[error("paused")]
    Paused,

    #[error("no active round")]
    RoundNotActive,

    #[error("round {round_id} expired at {end_time}")]
    RoundExpired { round_id: u64, end_time: u64 },

    #[error("guess {0} outside 1..=1000")]
    InvalidGuess(u32),

    #[error("randomness request {request_id} is still pending")]
    RandomnessAlreadyPending { request_id: u64 },

    #[error("round {round_id} ends at {end_time}")]
    NotYetEnded { round_id: u64, end_time: u64 },

    #[error("round {0} already settled")]
    AlreadySettled(u64),

    #[error("stake {provided} does not match entry fee {expected}")]
    InsufficientStake { expected: u128, provided: u128 },

    #[error("round {0} is closed for entries")]
    RoundClosed(u64),

    #[error("round {0} has not been settled yet")]
    RoundInProgress(u64),

    #[error("target {0} outside 1..=1000")]
    InvalidTarget(u32),

    #[error("unknown randomness request {0}")]
    UnknownRequest(u64),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl GameError {
    /// Stable short label, used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            GameError::Unauthorized { .. } => "unauthorized",
            GameError::Paused => "paused",
            GameError::RoundNotActive => "round_not_active",
            GameError::RoundExpired { .. } => "round_expired",
            GameError::InvalidGuess(_) => "invalid_guess",
            GameError::RandomnessAlreadyPending { .. } => "randomness_already_pending",
            GameError::NotYetEnded { .. } => "not_yet_ended",
            GameError::AlreadySettled(_) => "already_settled",
            GameError::InsufficientStake { .. } => "insufficient_stake",
            GameError::RoundClosed(_) => "round_closed",
            GameError::RoundInProgress(_) => "round_in_progress",
            GameError::InvalidTarget(_) => "invalid_target",
            GameError::UnknownRequest(_) => "unknown_request",
            GameError::InvalidConfiguration(_) => "invalid_configuration",
        }
    }
}

impl fmt::Display for GuessRoundsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuessRoundsError::Configuration(e) => write!(f, "Configuration error: {}", e),
            GuessRoundsError::Storage(e) => write!(f, "Storage error: {}", e),
            GuessRoundsError::Oracle(e) => write!(f, "Oracle error: {}", e),
            GuessRoundsError::Game(e) => write!(f, "Rejected: {}", e),
        }
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::ValidationFailed(msg) => write!(f, "Validation failed: {}", msg),
            ConfigurationError::InvalidValue { field, value, reason } => {
                write!(f, "Invalid value for {}: '{}' ({})", field, value, reason)
            }
            ConfigurationError::LoadFailed(msg) => write!(f, "Failed to load configuration: {}", msg),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::DatabaseOpenFailed(msg) => write!(f, "Database open failed: {}", msg),
            StorageError::ReadFailed(msg) => write!(f, "Read failed: {}", msg),
            StorageError::WriteFailed(msg) => write!(f, "Write failed: {}", msg),
            StorageError::CorruptedData(msg) => write!(f, "Corrupted data: {}", msg),
            StorageError::PermissionDenied(path) => write!(f, "Permission denied: {}", path),
        }
    }
}

impl std::error::Error for GuessRoundsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GuessRoundsError::Configuration(e) => Some(e),
            GuessRoundsError::Storage(e) => Some(e),
            GuessRoundsError::Oracle(e) => Some(e),
            GuessRoundsError::Game(e) => Some(e),
        }
    }
}

impl std::error::Error for ConfigurationError {}
impl std::error::Error for StorageError {}

impl From<ConfigurationError> for GuessRoundsError {
    fn from(e: ConfigurationError) -> Self {
        GuessRoundsError::Configuration(e)
    }
}

impl From<StorageError> for GuessRoundsError {
    fn from(e: StorageError) -> Self {
        GuessRoundsError::Storage(e)
    }
}

impl From<OracleError> for GuessRoundsError {
    fn from(e: OracleError) -> Self {
        GuessRoundsError::Oracle(e)
    }
}

impl From<GameError> for GuessRoundsError {
    fn from(e: GameError) -> Self {
        GuessRoundsError::Game(e)
    }
}

// External error conversions
impl From<rocksdb::Error> for GuessRoundsError {
    fn from(e: rocksdb::Error) -> Self {
        GuessRoundsError::Storage(StorageError::WriteFailed(e.to_string()))
    }
}

impl From<std::io::Error> for GuessRoundsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                GuessRoundsError::Storage(StorageError::PermissionDenied(e.to_string()))
            }
            _ => GuessRoundsError::Storage(StorageError::ReadFailed(e.to_string())),
        }
    }
}

impl From<serde_json::Error> for GuessRoundsError {
    fn from(e: serde_json::Error) -> Self {
        GuessRoundsError::Storage(StorageError::CorruptedData(e.to_string()))
    }
}

impl From<toml::de::Error> for GuessRoundsError {
    fn from(e: toml::de::Error) -> Self {
        GuessRoundsError::Configuration(ConfigurationError::LoadFailed(e.to_string()))
    }
}

// Convenience type alias for Results
pub type GuessRoundsResult<T> = Result<T, GuessRoundsError>;

impl GuessRoundsError {
    /// The round-level rejection behind this error, if that is what it is.
    pub fn as_game_error(&self) -> Option<&GameError> {
        match self {
            GuessRoundsError::Game(e) => Some(e),
            _ => None,
        }
    }
}
