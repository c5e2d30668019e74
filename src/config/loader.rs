//! Configuration Loader
//!
//! Layers configuration sources with the `config` crate, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. TOML file: `$RESILIENT_DB_CONFIG`, or `config/resilient-db.toml` if present
//! 3. Environment: `RESILIENT_DB_<SECTION>__<FIELD>`, e.g. `RESILIENT_DB_POOL__MAX_CONNECTIONS=50`
//!
//! The connection string is kept out of the layered config and read from
//! `DATABASE_URL` so it never ends up in serialized configuration dumps.

use super::error::{ConfigResult, ConfigurationError};
use super::ResilientDbConfig;
use crate::database::connection::DATABASE_URL_ENV;
use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming an explicit configuration file
pub const CONFIG_FILE_ENV: &str = "RESILIENT_DB_CONFIG";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "RESILIENT_DB";

const DEFAULT_CONFIG_FILE: &str = "config/resilient-db.toml";

/// Loaded configuration plus where it came from
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: ResilientDbConfig,
    environment: String,
    config_file: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Self> {
        let explicit = env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
        Self::load_from(explicit.as_deref(), Environment::with_prefix(ENV_PREFIX))
    }

    /// Load configuration from an optional file and an explicit environment source.
    ///
    /// Tests pass an `Environment` with a fixed `source` map instead of
    /// touching process-wide variables.
    pub fn load_from(config_file: Option<&Path>, environment: Environment) -> ConfigResult<Self> {
        let defaults = Config::try_from(&ResilientDbConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);

        let config_file = match config_file {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigurationError::ConfigFileNotFound {
                        path: path.to_path_buf(),
                    });
                }
                builder = builder.add_source(File::from(path).format(FileFormat::Toml));
                Some(path.to_path_buf())
            }
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    builder = builder
                        .add_source(File::from(default_path.as_path()).format(FileFormat::Toml));
                    Some(default_path)
                } else {
                    None
                }
            }
        };

        builder = builder.add_source(
            environment
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: ResilientDbConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        let environment = detect_environment();
        debug!(
            "Configuration resolved: {}",
            serde_json::to_string(&config).unwrap_or_else(|_| "[serialization error]".to_string())
        );
        info!(
            environment = %environment,
            config_file = ?config_file,
            max_connections = config.pool.max_connections,
            retry_attempts = config.pool.retry_attempts,
            "⚙️ Configuration loaded"
        );

        Ok(Self {
            config,
            environment,
            config_file,
        })
    }

    /// Wrap an already-built configuration (validated).
    pub fn from_config(config: ResilientDbConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            environment: detect_environment(),
            config_file: None,
        })
    }

    pub fn config(&self) -> &ResilientDbConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    /// Read `DATABASE_URL`; absent or blank is an error.
    pub fn database_url(&self) -> ConfigResult<String> {
        match env::var(DATABASE_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => Ok(url),
            _ => Err(ConfigurationError::MissingDatabaseUrl),
        }
    }
}

/// Current deployment environment.
///
/// `development` and `test` enable verbose logging.
pub fn detect_environment() -> String {
    env::var("RESILIENT_DB_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .or_else(|_| env::var("NODE_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Replace the password component of a connection string for logging.
pub fn mask_database_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let Some(at) = rest.find('@') else {
        return url.to_string();
    };
    let credentials = &rest[..at];
    match credentials.find(':') {
        Some(colon) => format!(
            "{}{}:****{}",
            &url[..scheme_end + 3],
            &credentials[..colon],
            &rest[at..]
        ),
        None => url.to_string(),
    }
}
