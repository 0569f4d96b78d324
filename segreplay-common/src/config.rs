//! Configuration loading and data directory resolution
//!
//! # Settings Sources Priority
//!
//! 1. Command-line arguments
//! 2. Environment variables (`SEGREPLAY_DATA_DIR`)
//! 3. TOML configuration file
//! 4. Built-in defaults (code constants)
//!
//! A missing config file is not an error: a warning is logged and defaults
//! are used.

use crate::route::ReplayFlags;
use crate::settings::{Settings, DEFAULT_MAX_CACHED_MINUTES};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "SEGREPLAY_DATA_DIR";

/// Replay configuration loaded from TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Directory holding locally recorded routes (optional)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Segment cache size in minutes
    #[serde(default = "default_max_cached_minutes")]
    pub max_cached_minutes: u32,

    /// Camera stream replayed with the bus data
    #[serde(default)]
    pub camera: ReplayFlags,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_cached_minutes: default_max_cached_minutes(),
            camera: ReplayFlags::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_max_cached_minutes() -> u32 {
    DEFAULT_MAX_CACHED_MINUTES
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ReplayConfig {
    /// Parse a config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load config from `path`, or from the platform config file if `None`
    ///
    /// A file that does not exist yields defaults. A file that exists but does
    /// not parse is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) => p,
                None => {
                    warn!("Could not determine config directory, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Write config as TOML, via a temp file and rename
    pub fn write(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Push config values into process-wide settings
    pub fn apply_to(&self, settings: &Settings) -> Result<()> {
        settings
            .set_max_cached_minutes(self.max_cached_minutes)
            .map_err(|e| Error::Config(e.to_string()))
    }
}

/// `<config_dir>/segreplay/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("segreplay").join("config.toml"))
}

/// Data directory resolution following the settings source priority
pub fn resolve_data_dir(cli_arg: Option<&Path>, config: &ReplayConfig) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(DATA_DIR_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(path) = &config.data_dir {
        return path.clone();
    }

    // Priority 4: OS-dependent compiled default
    default_data_dir()
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("segreplay"))
        .unwrap_or_else(|| PathBuf::from("./segreplay_data"))
}
