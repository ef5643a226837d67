//! Error types for the Mercator semantic map engine.

use thiserror::Error;

/// The main error type for Mercator operations.
#[derive(Error, Debug)]
pub enum MercatorError {
    /// Invalid instance configuration, rejected before any grid storage is
    /// allocated. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A malformed or mismatched entity record. Reported per record; a
    /// batch load continues past it.
    #[error("Data error: {0}")]
    Data(String),

    /// Operation invalid for the instance's current lifecycle state.
    /// Recoverable by reordering operations.
    #[error("State error: {0}")]
    State(String),

    /// Numerical fault during training. Terminal for that run.
    #[error("Training error: {0}")]
    Training(String),

    /// Unknown instance id.
    #[error("Instance not found: vsom-{0}")]
    NotFound(u64),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for Mercator operations.
pub type Result<T> = std::result::Result<T, MercatorError>;

impl From<bincode::Error> for MercatorError {
    fn from(err: bincode::Error) -> Self {
        MercatorError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for MercatorError {
    fn from(err: serde_json::Error) -> Self {
        MercatorError::Serialization(err.to_string())
    }
}
