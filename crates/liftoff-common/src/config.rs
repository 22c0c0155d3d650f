//! Configuration structures and the process-wide configuration store.
//!
//! This module defines:
//! - [`Profile`]: The environment discriminator (`dev`, `prod`, `test`)
//! - [`Settings`]: The typed configuration tree
//! - [`ConfigLoader`]: Layered loading (defaults, profile, file, environment, overrides)
//! - [`ConfigStore`]: Immutable, loaded configuration with a flat key view

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Environment variable holding the profile discriminator.
pub const MODE_ENV: &str = "LIFTOFF_MODE";

/// Environment variable holding an optional configuration file path.
pub const CONFIG_FILE_ENV: &str = "LIFTOFF_CONFIG";

/// Prefix for per-key environment overrides (`LIFTOFF__DATABASE__URL`).
pub const ENV_PREFIX: &str = "LIFTOFF";

/// Configuration profile selected at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Local development.
    Dev,
    /// Production deployment.
    Prod,
    /// Automated tests.
    Test,
}

impl Profile {
    /// Resolve the profile from [`MODE_ENV`], defaulting to `dev`.
    pub fn from_env() -> Result<Self, ConfigError> {
        std::env::var(MODE_ENV)
            .unwrap_or_else(|_| "dev".to_string())
            .parse()
    }

    /// Name of the profile as used on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Dev => "dev",
            Profile::Prod => "prod",
            Profile::Test => "test",
        }
    }

    /// TOML overlay applied on top of the typed defaults for this profile.
    fn overlay(self) -> &'static str {
        match self {
            Profile::Dev => DEV_OVERLAY,
            Profile::Prod => PROD_OVERLAY,
            Profile::Test => TEST_OVERLAY,
        }
    }
}

impl FromStr for Profile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(Profile::Dev),
            "prod" => Ok(Profile::Prod),
            "test" => Ok(Profile::Test),
            _ => Err(ConfigError::UnknownProfile {
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DEV_OVERLAY: &str = r#"
[log]
level = "debug"
dir = "logs"

[database]
url = "sqlite://liftoff-dev.db"
"#;

const PROD_OVERLAY: &str = r#"
[log]
level = "info"
format = "json"
dir = "logs"

[database]
url = "sqlite://liftoff.db"
max_connections = 16

[rate_limit]
enabled = true

[tasks]
workers = 8
"#;

const TEST_OVERLAY: &str = r#"
[log]
level = "warn"

[database]
url = "sqlite::memory:"
max_connections = 1

[tasks]
workers = 2
"#;

/// Typed configuration tree.
///
/// Every section falls back to its defaults, so a configuration file only
/// needs to name the options it changes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Service name, attached to error reports.
    #[serde(default = "defaults::app_name")]
    pub app_name: String,

    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerSettings,

    /// Logger settings.
    #[serde(default)]
    pub log: LogSettings,

    /// Persistence settings.
    #[serde(default)]
    pub database: DatabaseSettings,

    /// Cache settings.
    #[serde(default)]
    pub cache: CacheSettings,

    /// Rate limiter settings.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Error reporting integration.
    #[serde(default)]
    pub reporting: ReportingSettings,

    /// Background task runner settings.
    #[serde(default)]
    pub tasks: TaskSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: defaults::app_name(),
            server: ServerSettings::default(),
            log: LogSettings::default(),
            database: DatabaseSettings::default(),
            cache: CacheSettings::default(),
            rate_limit: RateLimitSettings::default(),
            reporting: ReportingSettings::default(),
            tasks: TaskSettings::default(),
        }
    }
}

impl Settings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server
            .bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid(format!("server.bind_addr: {e}")))?;

        if self.database.url.trim().is_empty() {
            return Err(ConfigError::invalid("database.url must not be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::invalid(
                "database.max_connections must be at least 1",
            ));
        }
        if self.tasks.workers == 0 {
            return Err(ConfigError::invalid("tasks.workers must be at least 1"));
        }
        if self.rate_limit.enabled
            && (self.rate_limit.requests == 0 || self.rate_limit.window_secs == 0)
        {
            return Err(ConfigError::invalid(
                "rate_limit.requests and rate_limit.window_secs must be positive when enabled",
            ));
        }

        Ok(())
    }

    /// Render the effective settings as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::invalid(e.to_string()))
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,

    /// Request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Enable graceful shutdown.
    #[serde(default = "defaults::graceful_shutdown")]
    pub graceful_shutdown: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            request_timeout_secs: defaults::request_timeout_secs(),
            graceful_shutdown: defaults::graceful_shutdown(),
        }
    }
}

impl ServerSettings {
    /// Get the request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Output format of the console logger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Logger settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSettings {
    /// Minimum severity (`trace`, `debug`, `info`, `warn`, `error`).
    #[serde(default = "defaults::log_level")]
    pub level: String,

    /// Console output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Directory for the log file. No file is written when unset.
    #[serde(default)]
    pub dir: Option<String>,

    /// Log file name inside `dir`.
    #[serde(default = "defaults::log_file")]
    pub file: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
            format: LogFormat::default(),
            dir: None,
            file: defaults::log_file(),
        }
    }
}

impl LogSettings {
    /// Full path of the log file, if file logging is configured.
    pub fn file_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| Path::new(dir).join(&self.file))
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseSettings {
    /// Connection URL (`sqlite::memory:`, `sqlite://path/to.db`).
    #[serde(default = "defaults::database_url")]
    pub url: String,

    /// Maximum pooled connections.
    #[serde(default = "defaults::max_connections")]
    pub max_connections: u32,

    /// How long a checkout may wait for a free connection.
    #[serde(default = "defaults::acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: defaults::database_url(),
            max_connections: defaults::max_connections(),
            acquire_timeout_ms: defaults::acquire_timeout_ms(),
        }
    }
}

impl DatabaseSettings {
    /// Get the acquire timeout as a `Duration`.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Cache storage backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// In-process map with TTL.
    #[default]
    Memory,
    /// Stores nothing, every lookup misses.
    Null,
}

/// Cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSettings {
    /// Storage backend.
    #[serde(default)]
    pub backend: CacheBackend,

    /// TTL applied when a caller does not pass one.
    #[serde(default = "defaults::cache_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Upper bound on stored entries for the memory backend.
    #[serde(default = "defaults::cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            default_ttl_secs: defaults::cache_ttl_secs(),
            max_entries: defaults::cache_max_entries(),
        }
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitSettings {
    /// Enable per-client request limiting.
    #[serde(default)]
    pub enabled: bool,

    /// Requests allowed per window.
    #[serde(default = "defaults::rate_limit_requests")]
    pub requests: u32,

    /// Window length in seconds.
    #[serde(default = "defaults::rate_limit_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            requests: defaults::rate_limit_requests(),
            window_secs: defaults::rate_limit_window_secs(),
        }
    }
}

impl RateLimitSettings {
    /// Get the window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Error reporting integration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReportingSettings {
    /// Enable the integration. When disabled, no reporter is built.
    #[serde(default)]
    pub enabled: bool,

    /// Collector endpoint receiving JSON reports.
    #[serde(default)]
    pub dsn: Option<String>,

    /// Environment tag attached to reports. Defaults to the profile name.
    #[serde(default)]
    pub environment: Option<String>,
}

/// Background task runner settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskSettings {
    /// Number of worker tasks draining the queue.
    #[serde(default = "defaults::task_workers")]
    pub workers: usize,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            workers: defaults::task_workers(),
        }
    }
}

/// Layered configuration loader.
///
/// Sources are applied in order, later ones winning:
/// 1. Typed defaults
/// 2. The profile overlay
/// 3. An optional TOML/JSON/YAML file
/// 4. `LIFTOFF__SECTION__KEY` environment variables
/// 5. Programmatic overrides
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    profile: Profile,
    file: Option<PathBuf>,
    env_prefix: Option<String>,
    overrides: Vec<(String, String)>,
}

impl ConfigLoader {
    /// Create a loader for the given profile with environment overrides enabled.
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            file: None,
            env_prefix: Some(ENV_PREFIX.to_string()),
            overrides: Vec::new(),
        }
    }

    /// Add a configuration file. A missing file is an error.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Ignore `LIFTOFF__*` environment variables.
    pub fn without_env(mut self) -> Self {
        self.env_prefix = None;
        self
    }

    /// Force a dotted key to a value, after every other source.
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    /// Load, deserialize and validate the configuration.
    pub fn load(self) -> Result<ConfigStore, ConfigError> {
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            self.profile.overlay(),
            config::FileFormat::Toml,
        ));

        if let Some(path) = &self.file {
            debug!(path = %path.display(), "Adding configuration file");
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        if let Some(prefix) = &self.env_prefix {
            builder = builder.add_source(
                config::Environment::with_prefix(prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        for (key, value) in &self.overrides {
            builder = builder.set_override(key.as_str(), value.as_str())?;
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;

        ConfigStore::new(self.profile, settings)
    }
}

/// Immutable configuration selected at process start.
///
/// Besides the typed [`Settings`], the store exposes every leaf option under
/// its dotted name (`database.url`, `tasks.workers`) for generic lookups.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    profile: Profile,
    settings: Settings,
    values: BTreeMap<String, serde_json::Value>,
}

impl ConfigStore {
    /// Wrap already-validated settings.
    pub fn new(profile: Profile, settings: Settings) -> Result<Self, ConfigError> {
        let tree = serde_json::to_value(&settings)
            .map_err(|e| ConfigError::invalid(format!("settings are not serializable: {e}")))?;

        let mut values = BTreeMap::new();
        flatten("", &tree, &mut values);

        Ok(Self {
            profile,
            settings,
            values,
        })
    }

    /// Load the profile's defaults only, ignoring files and the environment.
    pub fn for_profile(profile: Profile) -> Result<Self, ConfigError> {
        ConfigLoader::new(profile).without_env().load()
    }

    /// The profile this store was loaded for.
    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// The typed settings tree.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Look up an option by dotted name and convert it to `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self
            .values
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey {
                key: key.to_string(),
            })?;

        serde_json::from_value(value.clone()).map_err(|e| ConfigError::Type {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Dotted names of every option in the store.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

fn flatten(
    prefix: &str,
    value: &serde_json::Value,
    out: &mut BTreeMap<String, serde_json::Value>,
) {
    match value {
        serde_json::Value::Object(map) => {
            for (name, child) in map {
                let key = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}.{name}")
                };
                flatten(&key, child, out);
            }
        }
        leaf => {
            out.insert(prefix.to_string(), leaf.clone());
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub fn app_name() -> String {
        "liftoff".to_string()
    }

    pub fn bind_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub const fn graceful_shutdown() -> bool {
        true
    }

    pub fn log_level() -> String {
        "info".to_string()
    }

    pub fn log_file() -> String {
        "liftoff.log".to_string()
    }

    pub fn database_url() -> String {
        "sqlite::memory:".to_string()
    }

    pub const fn max_connections() -> u32 {
        5
    }

    pub const fn acquire_timeout_ms() -> u64 {
        5_000
    }

    pub const fn cache_ttl_secs() -> u64 {
        300
    }

    pub const fn cache_max_entries() -> usize {
        10_000
    }

    pub const fn rate_limit_requests() -> u32 {
        100
    }

    pub const fn rate_limit_window_secs() -> u64 {
        60
    }

    pub const fn task_workers() -> usize {
        4
    }
}
