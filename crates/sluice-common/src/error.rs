//! Error types shared across sluice crates

use thiserror::Error;

/// Result type alias for configuration and bootstrap operations
pub type Result<T> = std::result::Result<T, SluiceError>;

/// Errors raised while assembling configuration or bootstrapping a process
#[derive(Error, Debug)]
pub enum SluiceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl SluiceError {
    /// Shorthand for a configuration value that failed to parse
    pub fn invalid(key: impl Into<String>, value: impl Into<String>, reason: impl ToString) -> Self {
        SluiceError::InvalidValue {
            key: key.into(),
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}
