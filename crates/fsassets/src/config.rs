//! Service configuration: TOML files plus environment overrides.
//!
//! # Config File Locations
//!
//! Files are loaded in order, later files overriding earlier ones key by key:
//! 1. `/etc/fsassets/fsassets.toml` (system)
//! 2. `~/.config/fsassets/fsassets.toml` (user)
//! 3. `./fsassets.toml`, or the path given with `--config`
//! 4. Environment variables (`FSASSETS_*`)
//!
//! # Example Config
//!
//! ```toml
//! [service]
//! spool_dir = "/srv/assets/spool"
//! write_behind = true
//! writer_interval_ms = 1000
//! stats_interval_secs = 60
//!
//! [metadata]
//! path = "/srv/assets/metadata"
//!
//! [backend]
//! kind = "filesystem"
//! base_path = "/srv/assets/data"
//! layout = "standard"
//!
//! [migration_target]
//! kind = "object_storage"
//! bucket = "assets"
//!
//! [cache]
//! connection = "localhost:6379,password=secret"
//! ttl_minutes = 30
//!
//! [fallback]
//! endpoint = "http://grid.example.org:8003"
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cas::{BackendConfig, FileBackendConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("No storage backend configured: add a [backend] section or set FSASSETS_BASE_DIR")]
    MissingBackend,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// `[service]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    /// Where staged asset bytes wait for the writer.
    pub spool_dir: PathBuf,

    /// Secondary instances serve requests but run no background loops.
    pub secondary_instance: bool,

    /// Stage writes in the spool (`true`) or write to the backend inline.
    pub write_behind: bool,

    pub writer_interval_ms: u64,

    pub stats_interval_secs: u64,

    /// Run the periodic read stats report.
    pub show_stats: bool,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("./data/spool"),
            secondary_instance: false,
            write_behind: true,
            writer_interval_ms: 1000,
            stats_interval_secs: 60,
            show_stats: true,
        }
    }
}

/// Which metadata catalog to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKind {
    #[default]
    Json,
    Memory,
}

/// `[metadata]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub kind: MetadataKind,
    pub path: PathBuf,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            kind: MetadataKind::Json,
            path: PathBuf::from("./data/metadata"),
        }
    }
}

/// `[cache]` section. An empty connection disables the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis connection string, `"memory"`, or empty.
    pub connection: String,
    pub ttl_minutes: u64,
    /// Capacity of the in-process cache.
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            connection: String::new(),
            ttl_minutes: 30,
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes.max(1) * 60)
    }
}

/// `[fallback]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `[telemetry]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub service: ServiceSection,

    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Primary storage backend. Required.
    #[serde(default)]
    pub backend: Option<BackendConfig>,

    /// Destination for `migrate`; `--reverse` swaps it with `backend`.
    #[serde(default)]
    pub migration_target: Option<BackendConfig>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub files: Vec<PathBuf>,
    pub env_overrides: Vec<String>,
}

impl ServiceConfig {
    /// Load from the standard locations and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load, with `config_path` replacing `./fsassets.toml` when given.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in discover_config_files(config_path) {
            let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileRead {
                path: path.clone(),
                source: e,
            })?;
            merge_tables(&mut merged, parse_table(&contents, &path)?);
            sources.files.push(path);
        }

        let mut config = from_table(merged, Path::new("<merged>"))?;
        config.apply_env_overrides(&mut sources, |key| env::var(key).ok());
        config.expand_paths();
        Ok((config, sources))
    }

    /// Parse a single TOML document. No discovery, no environment.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let path = Path::new("<string>");
        from_table(parse_table(contents, path)?, path)
    }

    /// Apply `FSASSETS_*` overrides, reading variables through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, sources: &mut ConfigSources, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FSASSETS_SPOOL_DIR") {
            self.service.spool_dir = PathBuf::from(v);
            sources.env_overrides.push("FSASSETS_SPOOL_DIR".to_string());
        }
        if let Some(v) = lookup("FSASSETS_BASE_DIR") {
            match &mut self.backend {
                Some(BackendConfig::Filesystem(fs)) => fs.base_path = PathBuf::from(v),
                _ => {
                    self.backend = Some(BackendConfig::Filesystem(FileBackendConfig::with_base_path(v)))
                }
            }
            sources.env_overrides.push("FSASSETS_BASE_DIR".to_string());
        }
        if let Some(v) = lookup("FSASSETS_CACHE") {
            self.cache.connection = v;
            sources.env_overrides.push("FSASSETS_CACHE".to_string());
        }
        if let Some(v) = lookup("FSASSETS_FALLBACK") {
            self.fallback.endpoint = Some(v).filter(|v| !v.trim().is_empty());
            sources.env_overrides.push("FSASSETS_FALLBACK".to_string());
        }
        if let Some(v) = lookup("FSASSETS_SECONDARY") {
            self.service.secondary_instance =
                matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
            sources.env_overrides.push("FSASSETS_SECONDARY".to_string());
        }
        if let Some(v) = lookup("FSASSETS_LOG_LEVEL") {
            self.telemetry.log_level = v;
            sources.env_overrides.push("FSASSETS_LOG_LEVEL".to_string());
        }
    }

    fn expand_paths(&mut self) {
        self.service.spool_dir = expand_path(&self.service.spool_dir);
        self.metadata.path = expand_path(&self.metadata.path);
        for backend in [&mut self.backend, &mut self.migration_target]
            .into_iter()
            .flatten()
        {
            if let BackendConfig::Filesystem(fs) = backend {
                fs.base_path = expand_path(&fs.base_path);
            }
        }
    }

    /// Check required settings. Run before anything is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let backend = self.backend.as_ref().ok_or(ConfigError::MissingBackend)?;
        backend
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("[backend] {e}")))?;

        if let Some(target) = &self.migration_target {
            target
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("[migration_target] {e}")))?;
        }
        if self.service.spool_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("[service] spool_dir is empty".to_string()));
        }
        if self.service.writer_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "[service] writer_interval_ms must be positive".to_string(),
            ));
        }
        if self.service.stats_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "[service] stats_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Only the leader runs the writer and stats loops.
    pub fn is_leader(&self) -> bool {
        !self.service.secondary_instance
    }

    pub fn writer_interval(&self) -> Duration {
        Duration::from_millis(self.service.writer_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.service.stats_interval_secs)
    }
}

/// Config files that exist, in load order.
pub fn discover_config_files(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/fsassets/fsassets.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("fsassets/fsassets.toml");
        if user.exists() {
            files.push(user);
        }
    }

    // An explicit path always loads, so a typo surfaces as a read error.
    if let Some(path) = cli_path {
        files.push(path.to_path_buf());
        return files;
    }

    let local = PathBuf::from("fsassets.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents
        .parse::<toml::Table>()
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

fn from_table(table: toml::Table, path: &Path) -> Result<ServiceConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Recursively merge `overlay` into `base`; overlay values win.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_path(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match directories::BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(rest),
        None => path.to_path_buf(),
    }
}
