//! Error types for cloudexec settings

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or writing settings
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Missing required setting '{0}', run 'cloudexec configure' or set it in the environment")]
    Missing(&'static str),

    #[error("Failed to resolve secret reference {reference}: {message}")]
    Secret { reference: String, message: String },

    #[error("Failed to write configuration file at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode configuration values: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("Could not determine the home directory")]
    NoHomeDir,
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, ConfigError>;

impl ConfigError {
    /// Create an I/O error bound to a path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.into(),
            source,
        }
    }
}
