//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// `DATABASE_URL` is not set or empty
    #[error("DATABASE_URL is not set; a PostgreSQL connection string is required")]
    MissingDatabaseUrl,

    /// `DATABASE_URL` could not be parsed
    #[error("Invalid DATABASE_URL: {reason}")]
    InvalidDatabaseUrl { reason: String },

    /// Configuration file given explicitly but not present
    #[error("Configuration file not found: {path}")]
    ConfigFileNotFound { path: PathBuf },

    /// Sources could not be merged or deserialized
    #[error("Failed to load configuration: {0}")]
    Load(String),

    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },
}

impl ConfigurationError {
    /// Create an invalid value error
    pub fn invalid_value<F: Into<String>, V: ToString, C: Into<String>>(
        field: F,
        value: V,
        context: C,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            context: context.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        ConfigurationError::Load(err.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
