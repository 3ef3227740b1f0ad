//! Settings Loader
//!
//! Settings come from three layers, later layers winning:
//!
//! 1. `~/.config/cloudexec/config.toml` (optional)
//! 2. Environment variables (`DIGITALOCEAN_*`, `CLOUDEXEC_USERNAME`), useful for CI
//! 3. `op://` secret references, resolved through the 1Password CLI
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cx_core::Settings;
//!
//! let settings = Settings::load(&Settings::default_path()?)?;
//! println!("bucket owner: {}", settings.username);
//! # Ok::<(), cx_core::ConfigError>(())
//! ```

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use config::{Config, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConfigError, Result};

/// Settings file location relative to the home directory
pub const CONFIG_RELATIVE_PATH: &str = ".config/cloudexec/config.toml";

/// Prefix marking a value as a 1Password secret reference
pub const SECRET_REFERENCE_PREFIX: &str = "op://";

/// Environment variables that override file settings, paired with their keys
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("CLOUDEXEC_USERNAME", "username"),
    ("DIGITALOCEAN_API_KEY", "digitalocean.api_key"),
    ("DIGITALOCEAN_SPACES_ACCESS_KEY", "digitalocean.spaces_access_key"),
    ("DIGITALOCEAN_SPACES_SECRET_ACCESS_KEY", "digitalocean.spaces_secret_key"),
    ("DIGITALOCEAN_SPACES_REGION", "digitalocean.spaces_region"),
];

/// How concurrent writers of the state document are reconciled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsistencyMode {
    /// Unconditional writes. A concurrent writer's update can be silently lost.
    #[default]
    LastWriterWins,
    /// Writes are conditional on the version that was read; conflicts are
    /// detected and the read-merge-write cycle is replayed.
    Optimistic,
}

impl fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyMode::LastWriterWins => write!(f, "last-writer-wins"),
            ConsistencyMode::Optimistic => write!(f, "optimistic"),
        }
    }
}

/// DigitalOcean API and Spaces credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitalOceanSettings {
    pub api_key: String,
    pub spaces_access_key: String,
    pub spaces_secret_key: String,
    pub spaces_region: String,
}

/// Tuning for the state document read/write cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    pub consistency: ConsistencyMode,
    /// Attempts per storage read or write
    pub retry_attempts: u32,
    /// Linear backoff step; attempt `n` waits `n * retry_step_ms`
    pub retry_step_ms: u64,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            consistency: ConsistencyMode::LastWriterWins,
            retry_attempts: 3,
            retry_step_ms: 1000,
        }
    }
}

/// Complete cloudexec settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub username: String,
    pub digitalocean: DigitalOceanSettings,
    pub state: StateSettings,
}

impl Settings {
    /// Default settings path: `~/.config/cloudexec/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(CONFIG_RELATIVE_PATH))
            .ok_or(ConfigError::NoHomeDir)
    }

    /// Load settings from `path` and the process environment.
    ///
    /// A missing file is not an error: environment variables alone are enough.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = Self::load_with(path, |key| std::env::var(key).ok())?;
        settings.resolve_secrets()?;
        Ok(settings)
    }

    /// Load settings using `lookup` in place of the process environment.
    ///
    /// Secret references are left unresolved.
    pub fn load_with<F>(path: &Path, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Config::builder().add_source(File::from(path).required(false));

        for (variable, key) in ENV_OVERRIDES {
            let value = lookup(variable).filter(|v| !v.is_empty());
            if value.is_some() {
                debug!("Overriding {} from {}", key, variable);
            }
            builder = builder.set_override_option(*key, value)?;
        }

        let mut settings: Settings = builder.build()?.try_deserialize()?;

        if settings.username.is_empty() {
            settings.username = lookup("USER")
                .or_else(|| lookup("USERNAME"))
                .unwrap_or_default();
        }

        Ok(settings)
    }

    /// Replace `op://` references with the secret they point to
    pub fn resolve_secrets(&mut self) -> Result<()> {
        let digitalocean = &mut self.digitalocean;
        for value in [
            &mut digitalocean.api_key,
            &mut digitalocean.spaces_access_key,
            &mut digitalocean.spaces_secret_key,
        ] {
            if value.starts_with(SECRET_REFERENCE_PREFIX) {
                *value = read_secret_reference(value)?;
            }
        }
        Ok(())
    }

    /// Fail with the first missing setting needed to reach DigitalOcean
    pub fn require_credentials(&self) -> Result<()> {
        let required = [
            ("username", &self.username),
            ("digitalocean.api_key", &self.digitalocean.api_key),
            ("digitalocean.spaces_access_key", &self.digitalocean.spaces_access_key),
            ("digitalocean.spaces_secret_key", &self.digitalocean.spaces_secret_key),
            ("digitalocean.spaces_region", &self.digitalocean.spaces_region),
        ];
        match required.iter().find(|(_, value)| value.is_empty()) {
            Some((name, _)) => Err(ConfigError::Missing(name)),
            None => Ok(()),
        }
    }

    /// Write settings to `path`, readable by the owner only
    pub fn save(&self, path: &Path) -> Result<()> {
        let encoded = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path).map_err(|e| ConfigError::io(path, e))?;
        file.write_all(encoded.as_bytes())
            .map_err(|e| ConfigError::io(path, e))?;

        info!("Configuration file written to {}", path.display());
        Ok(())
    }
}

/// Resolve a single `op://` reference with `op read --no-newline`
fn read_secret_reference(reference: &str) -> Result<String> {
    let output = Command::new("op")
        .args(["read", "--no-newline", reference])
        .output()
        .map_err(|e| ConfigError::Secret {
            reference: reference.to_string(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        // exit status alone says nothing, stderr carries the reason
        return Err(ConfigError::Secret {
            reference: reference.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
