//! Configuration and logging setup shared by the Tessera binaries.
//!
//! Configuration is read from TOML, then adjusted by `TESSERA_*` environment overrides. Logging
//! goes through `tracing`; [`init_tracing`] installs the global subscriber once per process.

mod logging;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use logging::{init_tracing, LogBuffer};

/// Overrides the single-flight cache capacity.
pub const ENV_CACHE_CAPACITY: &str = "TESSERA_CACHE_CAPACITY";
/// Overrides the workspace symbol search worker count.
pub const ENV_SYMBOL_WORKERS: &str = "TESSERA_SYMBOL_WORKERS";
/// Overrides `logging.level`.
pub const ENV_LOG: &str = "TESSERA_LOG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TesseraConfig {
    pub logging: LoggingConfig,
    pub cache: CacheConfig,
    pub symbols: SymbolsConfig,
    pub server: ServerConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Toml(err.message().to_owned())
    }
}

impl TesseraConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `TESSERA_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply `TESSERA_*` overrides using `lookup` to read variables.
    ///
    /// Values that fail to parse are ignored with a warning and the configured value is kept.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(ENV_CACHE_CAPACITY) {
            match value.trim().parse::<usize>() {
                Ok(capacity) if capacity > 0 => self.cache.capacity = capacity,
                _ => tracing::warn!(
                    target: "tessera.config",
                    var = ENV_CACHE_CAPACITY,
                    value = %value,
                    "ignoring invalid cache capacity override"
                ),
            }
        }

        if let Some(value) = lookup(ENV_SYMBOL_WORKERS) {
            match value.trim().parse::<usize>() {
                Ok(workers) if workers > 0 => self.symbols.workers = Some(workers),
                _ => tracing::warn!(
                    target: "tessera.config",
                    var = ENV_SYMBOL_WORKERS,
                    value = %value,
                    "ignoring invalid symbol worker override"
                ),
            }
        }

        if let Some(value) = lookup(ENV_LOG) {
            if !value.trim().is_empty() {
                self.logging.level = value;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Either a simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Mirror logs to stderr (in addition to the in-memory buffer).
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file path.
    ///
    /// If the file cannot be opened, file logging is disabled while other sinks remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Number of log lines kept in memory.
    #[serde(default = "LoggingConfig::default_buffer_lines")]
    pub buffer_lines: usize,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn default_buffer_lines() -> usize {
        2_000
    }

    /// `level` as `EnvFilter` directives. Bare level names are case-insensitive and
    /// `warning` is accepted for `warn`.
    pub(crate) fn level_directives(&self) -> String {
        let level = self.level.trim();
        if level.is_empty() {
            return Self::default_level();
        }
        if level.eq_ignore_ascii_case("warning") {
            return "warn".to_owned();
        }
        match level.parse::<tracing::Level>() {
            Ok(parsed) => parsed.as_str().to_ascii_lowercase(),
            Err(_) => level.to_owned(),
        }
    }

    /// Create the effective `EnvFilter`.
    ///
    /// `RUST_LOG` directives are appended to the configured ones. Unparseable directives fall
    /// back to `info`.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let mut directives = self.level_directives();
        if let Ok(env) = std::env::var("RUST_LOG") {
            if !env.trim().is_empty() {
                directives = format!("{directives},{}", env.trim());
            }
        }
        tracing_subscriber::EnvFilter::try_new(directives)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
            buffer_lines: Self::default_buffer_lines(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum number of single-flight entries kept before least-recently-used eviction.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 1_024 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SymbolsConfig {
    /// Worker pool size for workspace symbol search. Defaults to half the available parallelism.
    pub workers: Option<usize>,
    /// Result limit used when a request does not ask for one.
    pub default_limit: usize,
}

impl SymbolsConfig {
    pub fn effective_workers(&self) -> usize {
        match self.workers {
            Some(workers) => workers.max(1),
            None => {
                let available = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                (available / 2).max(1)
            }
        }
    }
}

impl Default for SymbolsConfig {
    fn default() -> Self {
        Self {
            workers: None,
            default_limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Deadline for the background warm-up started by `initialize`.
    pub warmup_timeout_ms: u64,
}

impl ServerConfig {
    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.warmup_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            warmup_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Address the relay listens on, e.g. `127.0.0.1:4389`.
    pub listen: Option<String>,
    /// Address of the analysis backend the relay dials for every client.
    pub backend: Option<String>,
    /// Parent directory for per-session working copies. Defaults to the system temp dir.
    pub scratch_dir: Option<PathBuf>,
    /// Close a session after this long without traffic in either direction.
    pub idle_timeout_ms: Option<u64>,
    /// Reject text document modifications from clients.
    pub read_only: bool,
    /// Largest accepted frame body.
    pub max_frame_bytes: usize,
}

impl RelayConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: None,
            backend: None,
            scratch_dir: None,
            idle_timeout_ms: None,
            read_only: false,
            max_frame_bytes: 64 * 1024 * 1024,
        }
    }
}
