//! Configuration file support for segmgrd
//!
//! Loads and validates segmgrd configuration from TOML files.
//! Default location: /etc/netsim/segmgrd.toml

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::provider::ProviderTimeouts;
use crate::tables::{
    DEFAULT_CONFIG_PATH, DEFAULT_IMAGE_CONTEXT, DEFAULT_PROTECTED_SEGMENTS, DEFAULT_STATE_PATH,
};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Container provider configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Docker CLI binary
    #[serde(default = "default_docker")]
    pub docker: String,

    /// Budget for listing and inspection, in seconds
    #[serde(default = "default_list_timeout")]
    pub list_timeout_secs: u64,

    /// Budget for segment and container mutations, in seconds
    #[serde(default = "default_mutate_timeout")]
    pub mutate_timeout_secs: u64,

    /// Budget for commands run inside node containers, in seconds
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,

    /// Budget for building a node image, in seconds
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Networks never garbage-collected
    #[serde(default = "default_protected_segments")]
    pub protected_segments: Vec<String>,
}

/// State persistence configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    /// Snapshot file
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter; RUST_LOG overrides it
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of text
    #[serde(default)]
    pub json: bool,
}

/// In-node diagnostics configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Echo requests sent per ping
    #[serde(default = "default_ping_count")]
    pub ping_count: u32,

    /// Budget for a ping run, in seconds
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
}

/// Node image configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagesConfig {
    /// Directory holding one build context per node kind (`<dir>/host`, `<dir>/router`)
    #[serde(default = "default_image_context")]
    pub context_dir: PathBuf,
}

/// Complete segmgrd configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegMgrConfig {
    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    #[serde(default)]
    pub images: ImagesConfig,
}

// Default functions
fn default_docker() -> String {
    netsim_common::shell::DOCKER_CMD.to_string()
}

fn default_list_timeout() -> u64 {
    10
}

fn default_mutate_timeout() -> u64 {
    20
}

fn default_exec_timeout() -> u64 {
    30
}

fn default_build_timeout() -> u64 {
    600
}

fn default_protected_segments() -> Vec<String> {
    DEFAULT_PROTECTED_SEGMENTS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_state_path() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_PATH)
}

fn default_image_context() -> PathBuf {
    PathBuf::from(DEFAULT_IMAGE_CONTEXT)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ping_count() -> u32 {
    4
}

fn default_ping_timeout() -> u64 {
    10
}

// Default implementations
impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            docker: default_docker(),
            list_timeout_secs: default_list_timeout(),
            mutate_timeout_secs: default_mutate_timeout(),
            exec_timeout_secs: default_exec_timeout(),
            build_timeout_secs: default_build_timeout(),
            protected_segments: default_protected_segments(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            context_dir: default_image_context(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            ping_count: default_ping_count(),
            ping_timeout_secs: default_ping_timeout(),
        }
    }
}

impl SegMgrConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let config: Self = match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Config file {} not found, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Provider call budgets
    pub fn provider_timeouts(&self) -> ProviderTimeouts {
        ProviderTimeouts {
            list: Duration::from_secs(self.provider.list_timeout_secs),
            mutate: Duration::from_secs(self.provider.mutate_timeout_secs),
            exec: Duration::from_secs(self.provider.exec_timeout_secs),
            build: Duration::from_secs(self.provider.build_timeout_secs),
        }
    }

    /// Get ping budget as Duration
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.diagnostics.ping_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.docker.trim().is_empty() {
            return Err(ConfigError::Invalid("provider.docker must not be empty".to_string()));
        }

        for (name, value) in [
            ("list_timeout_secs", self.provider.list_timeout_secs),
            ("mutate_timeout_secs", self.provider.mutate_timeout_secs),
            ("exec_timeout_secs", self.provider.exec_timeout_secs),
            ("build_timeout_secs", self.provider.build_timeout_secs),
            ("ping_timeout_secs", self.diagnostics.ping_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }

        if self.diagnostics.ping_count == 0 {
            return Err(ConfigError::Invalid("ping_count must be > 0".to_string()));
        }

        if self.state.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("state.path must not be empty".to_string()));
        }

        Ok(())
    }
}
