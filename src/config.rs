//! Configuration loading from a JSON config file.
//!
//! The config file is optional. When it does not exist the built-in defaults
//! are used; when it exists it must be valid JSON.
//!
//! ```json
//! {
//!   "logLevel": "info",
//!   "quiet": false,
//!   "connectionsFile": "/home/me/.config/malloy/connections.json",
//!   "compiler": { "command": "malloy-compile", "args": [] }
//! }
//! ```

use crate::error::{MalloyError, MalloyResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_ENV_VAR: &str = "MALLOY_CONFIG_FILE";

const CONFIG_DIR_NAME: &str = "malloy";
const CONFIG_FILE_NAME: &str = "config.json";
const CONNECTIONS_FILE_NAME: &str = "connections.json";
const DEFAULT_COMPILER_COMMAND: &str = "malloy-compile";

/// Ordered from least to most verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Warn
    }
}

/// External compiler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerSettings {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMPILER_COMMAND.to_string(),
            args: Vec::new(),
        }
    }
}

/// Effective configuration for one invocation. Immutable once loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Where the configuration was (or would have been) read from.
    #[serde(skip_deserializing)]
    pub config_file_path: Option<PathBuf>,

    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub quiet: bool,

    /// Overrides the default `connections.json` next to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections_file: Option<PathBuf>,

    #[serde(default)]
    pub compiler: CompilerSettings,
}

impl Configuration {
    /// Location of the connection store for this configuration.
    pub fn connections_path(&self) -> PathBuf {
        if let Some(path) = &self.connections_file {
            return path.clone();
        }
        match self.config_file_path.as_deref().and_then(Path::parent) {
            Some(dir) => dir.join(CONNECTIONS_FILE_NAME),
            None => PathBuf::from(CONNECTIONS_FILE_NAME),
        }
    }
}

/// Default config location, `<config dir>/malloy/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push(CONFIG_DIR_NAME);
        p.push(CONFIG_FILE_NAME);
        p
    })
}

/// Load the configuration from `path`, or from the default location.
///
/// The environment variable is resolved by the CLI layer before this is called.
pub fn load_config(path: Option<&Path>) -> MalloyResult<Configuration> {
    let resolved = path.map(Path::to_path_buf).or_else(default_config_path);

    let Some(resolved) = resolved else {
        debug!("No config directory available, using defaults");
        return Ok(Configuration::default());
    };

    if !resolved.exists() {
        debug!("Config file {} not found, using defaults", resolved.display());
        return Ok(Configuration {
            config_file_path: Some(resolved),
            ..Configuration::default()
        });
    }

    let text = std::fs::read_to_string(&resolved).map_err(|e| {
        MalloyError::Config(format!("cannot read {}: {}", resolved.display(), e))
    })?;
    let mut config: Configuration = serde_json::from_str(&text).map_err(|e| {
        MalloyError::Config(format!("invalid JSON in {}: {}", resolved.display(), e))
    })?;
    config.config_file_path = Some(resolved);

    debug!("Loaded configuration: {:?}", config);
    Ok(config)
}
