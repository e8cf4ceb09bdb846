//! Error types for the encrypted store.

use std::time::Duration;

/// Top-level error type shared by the dispatcher, transports and engines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database is not initialized")]
    NotInitialized,

    #[error("Database is already initialized or initializing")]
    AlreadyInitialized,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Cannot erase database while it is open")]
    CannotEraseOpenDB,

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid arguments for {method}: {reason}")]
    InvalidArguments { method: String, reason: String },

    #[error("Migration to version {version} failed: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Backup failed: {0}")]
    BackupFailed(String),

    #[error("Insufficient disk space: need {required} bytes, only {available} available")]
    DiskSpaceInsufficient { required: u64, available: u64 },

    #[error("Database corruption suspected: {0}")]
    CorruptionSuspected(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Whether this error must be surfaced to the user as an unrecoverable
    /// database failure rather than handed back to a single caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MigrationFailed { .. } | Error::CorruptionSuspected(_)
        )
    }
}

/// Engine-level failures, carried as text with call-site context.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Failures of the host/worker message channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Worker {worker} failed to spawn: {reason}")]
    SpawnFailed { worker: String, reason: String },

    #[error("Worker {worker} did not start within {timeout:?}")]
    StartupTimeout { worker: String, timeout: Duration },

    #[error("Worker {worker} disconnected")]
    Disconnected { worker: String },

    #[error("Worker {worker} sent a response for unknown request {seq}")]
    UnexpectedResponse { worker: String, seq: u64 },

    #[error("Worker {worker} is closed")]
    Closed { worker: String },

    #[error("Worker {worker} was shut out after a protocol violation")]
    Poisoned { worker: String },
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Result type alias for the store.
pub type Result<T> = std::result::Result<T, Error>;
