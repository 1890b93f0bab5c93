use crate::compiler::Compiler;
use crate::host::{HostConfig, ServerOptions};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from rescript-watch.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct PluginConfig {
    pub compiler: CompilerConfig,
    pub watch: WatchConfig,
    pub log: LogConfig,
    /// Host server options the plugin amends during `on_configure`.
    pub server: Option<ServerOptions>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct CompilerConfig {
    pub tool: Compiler,
    /// Binary to run instead of the tool's default name.
    pub command: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Glob the host's file watcher should ignore.
    pub ignore: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

// --- Default implementations ---

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            ignore: "**/*.res".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    InvalidPattern {
        pattern: String,
        source: glob::PatternError,
    },
    InvalidLevel {
        level: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
            ConfigError::InvalidPattern { pattern, source } => {
                write!(f, "invalid watch ignore pattern {:?}: {}", pattern, source)
            }
            ConfigError::InvalidLevel { level } => {
                write!(f, "invalid log level {:?}", level)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::InvalidPattern { source, .. } => Some(source),
            ConfigError::InvalidLevel { .. } => None,
        }
    }
}

impl PluginConfig {
    /// Load and validate config from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: PluginConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        glob::Pattern::new(&self.watch.ignore).map_err(|source| ConfigError::InvalidPattern {
            pattern: self.watch.ignore.clone(),
            source,
        })?;
        self.log
            .level
            .parse::<tracing::Level>()
            .map_err(|_| ConfigError::InvalidLevel {
                level: self.log.level.clone(),
            })?;
        Ok(())
    }

    /// The host configuration object handed to `on_configure`.
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            server: self.server.clone(),
        }
    }
}
