use thiserror::Error;

use crate::session::AuthError;

/// Top-level error type for docchat.
///
/// Subsystem crates define their own error types and implement
/// `From<SubsystemError> for DocchatError` so that `?` works across crate
/// boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DocchatError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for DocchatError {
    fn from(err: toml::de::Error) -> Self {
        DocchatError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for DocchatError {
    fn from(err: toml::ser::Error) -> Self {
        DocchatError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for DocchatError {
    fn from(err: serde_json::Error) -> Self {
        DocchatError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for docchat operations.
pub type Result<T> = std::result::Result<T, DocchatError>;
