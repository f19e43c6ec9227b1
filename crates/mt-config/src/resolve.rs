//! Configuration resolution and path discovery.
//!
//! Resolution order: CLI arguments → environment variables → XDG paths → defaults.

use std::path::{Path, PathBuf};

use crate::settings::EngineConfig;
use crate::validate::{validate_engine_config, ValidationError, ValidationResult};

/// A fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The validated configuration.
    pub config: EngineConfig,

    /// Where the configuration came from (for diagnostics).
    pub source: ConfigSource,

    /// Path to the file it was loaded from, if any.
    pub path: Option<PathBuf>,
}

/// Where a configuration file was found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Explicitly provided via CLI argument.
    CliArgument,

    /// Set via environment variable.
    Environment,

    /// Found in XDG config directory.
    XdgConfig,

    /// Found in /etc/metric-triage/.
    SystemConfig,

    /// Using built-in defaults.
    #[default]
    BuiltinDefault,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::CliArgument => write!(f, "CLI argument"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::XdgConfig => write!(f, "XDG config"),
            ConfigSource::SystemConfig => write!(f, "system config"),
            ConfigSource::BuiltinDefault => write!(f, "builtin default"),
        }
    }
}

/// Environment variable names.
const ENV_CONFIG_PATH: &str = "METRIC_TRIAGE_CONFIG";
const ENV_CONFIG_DIR: &str = "METRIC_TRIAGE_CONFIG_DIR";

/// Standard config file name.
const CONFIG_FILENAME: &str = "config.json";

/// Application name for XDG directories.
const APP_NAME: &str = "metric-triage";

/// Resolve the engine configuration using the standard resolution order.
///
/// Resolution order:
/// 1. Explicit CLI path (if provided; a missing file is an error)
/// 2. METRIC_TRIAGE_CONFIG environment variable (direct path)
/// 3. METRIC_TRIAGE_CONFIG_DIR environment variable + config.json
/// 4. XDG config directory (~/.config/metric-triage/config.json)
/// 5. System config (/etc/metric-triage/config.json)
/// 6. Built-in defaults
pub fn resolve_config(cli_path: Option<&Path>) -> ValidationResult<ResolvedConfig> {
    // 1. CLI argument. An explicit path that does not exist is a hard
    // error rather than a silent fallthrough.
    if let Some(path) = cli_path {
        let config = load_config_file(path)?;
        return Ok(ResolvedConfig {
            config,
            source: ConfigSource::CliArgument,
            path: Some(path.to_path_buf()),
        });
    }

    // 2. Environment variable (direct path)
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            let config = load_config_file(&path)?;
            return Ok(ResolvedConfig {
                config,
                source: ConfigSource::Environment,
                path: Some(path),
            });
        }
    }

    // 3. Environment variable (config dir)
    if let Ok(config_dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = PathBuf::from(config_dir).join(CONFIG_FILENAME);
        if path.exists() {
            let config = load_config_file(&path)?;
            return Ok(ResolvedConfig {
                config,
                source: ConfigSource::Environment,
                path: Some(path),
            });
        }
    }

    // 4. XDG config directory
    if let Some(xdg_config) = dirs::config_dir() {
        let path = xdg_config.join(APP_NAME).join(CONFIG_FILENAME);
        if path.exists() {
            let config = load_config_file(&path)?;
            return Ok(ResolvedConfig {
                config,
                source: ConfigSource::XdgConfig,
                path: Some(path),
            });
        }
    }

    // 5. System config
    let system_path = PathBuf::from("/etc").join(APP_NAME).join(CONFIG_FILENAME);
    if system_path.exists() {
        let config = load_config_file(&system_path)?;
        return Ok(ResolvedConfig {
            config,
            source: ConfigSource::SystemConfig,
            path: Some(system_path),
        });
    }

    // 6. Built-in defaults
    Ok(ResolvedConfig {
        config: EngineConfig::default(),
        source: ConfigSource::BuiltinDefault,
        path: None,
    })
}

/// Load and validate a configuration file.
pub fn load_config_file(path: &Path) -> ValidationResult<EngineConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ValidationError::IoError(format!("{}: {}", path.display(), e)))?;

    let config: EngineConfig = serde_json::from_str(&text)
        .map_err(|e| ValidationError::ParseError(format!("{}: {}", path.display(), e)))?;

    validate_engine_config(&config)?;
    Ok(config)
}

/// Get the XDG config directory for metric-triage.
pub fn xdg_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// Get the system config directory.
pub fn system_config_dir() -> PathBuf {
    PathBuf::from("/etc").join(APP_NAME)
}

/// Check if a config directory exists and is readable.
pub fn config_dir_exists(path: &Path) -> bool {
    path.is_dir() && path.read_dir().is_ok()
}
