// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for katago-bridge.
//!
//! Values are resolved in order: built-in defaults, an optional JSON file,
//! then environment variables. The result is validated and clamped.
//!
//! The JSON file is looked up at, in order: the explicit path passed to
//! [`Config::load`], `$KATAGO_BRIDGE_CONFIG`, `./katago-bridge.json`, and
//! `$HOME/.katago-bridge/config.json`. A missing file is not an error unless
//! the path was given explicitly.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::cache::DEFAULT_FINGERPRINT_FIELDS;
use crate::retry::RetryConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Engine process settings.
    pub engine: EngineConfig,
    /// Result cache settings.
    pub cache: CacheConfig,
    /// Supervision policy.
    pub supervisor: SupervisorConfig,
}

/// How to launch and talk to the engine process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Engine executable.
    pub binary_path: PathBuf,
    /// Subcommand placed before all other arguments.
    pub subcommand: String,
    /// Neural net model, passed as `-model`.
    pub model_path: Option<PathBuf>,
    /// Engine config file, passed as `-config`.
    pub config_path: Option<PathBuf>,
    /// Extra arguments appended verbatim.
    pub extra_args: Vec<String>,
    /// Per-query search time budget in seconds.
    pub max_time: f64,
    /// Explicit query timeout in milliseconds. Defaults to twice `max_time`.
    pub query_timeout_ms: Option<u64>,
    /// How long to wait for exit after closing stdin.
    pub stop_grace_ms: u64,
    /// How long to wait for exit after SIGTERM before killing.
    pub term_grace_ms: u64,
    /// Interval of protocol-level health probes (0 = disabled).
    pub health_interval_ms: u64,
    /// How long a protocol health probe waits for its answer.
    pub health_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("katago"),
            subcommand: "analysis".to_string(),
            model_path: None,
            config_path: None,
            extra_args: Vec::new(),
            max_time: 10.0,
            query_timeout_ms: None,
            stop_grace_ms: 10_000,
            term_grace_ms: 5_000,
            health_interval_ms: 30_000,
            health_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Config for the given binary with default settings.
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            ..Default::default()
        }
    }

    /// Set the model path.
    pub fn with_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    /// Set the engine config file.
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Replace the subcommand. An empty string omits it.
    pub fn with_subcommand(mut self, subcommand: impl Into<String>) -> Self {
        self.subcommand = subcommand.into();
        self
    }

    /// Append extra arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an explicit query timeout.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set both shutdown grace periods.
    pub fn with_grace_periods(mut self, stop: Duration, term: Duration) -> Self {
        self.stop_grace_ms = stop.as_millis() as u64;
        self.term_grace_ms = term.as_millis() as u64;
        self
    }

    /// Set the protocol health probe interval (zero disables it).
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Full argument list passed to the binary.
    pub fn args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if !self.subcommand.is_empty() {
            args.push(OsString::from(&self.subcommand));
        }
        if let Some(config) = &self.config_path {
            args.push(OsString::from("-config"));
            args.push(config.as_os_str().to_owned());
        }
        if let Some(model) = &self.model_path {
            args.push(OsString::from("-model"));
            args.push(model.as_os_str().to_owned());
        }
        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }

    /// How long a query may wait for its response.
    pub fn query_timeout(&self) -> Duration {
        match self.query_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs_f64(self.max_time * 2.0),
        }
    }

    /// Wait after closing stdin.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Wait after SIGTERM.
    pub fn term_grace(&self) -> Duration {
        Duration::from_millis(self.term_grace_ms)
    }

    /// Protocol health probe interval, if enabled.
    pub fn health_interval(&self) -> Option<Duration> {
        (self.health_interval_ms > 0).then(|| Duration::from_millis(self.health_interval_ms))
    }

    /// Wait for a protocol health answer.
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

/// Result cache limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Whether results are cached at all.
    pub enabled: bool,
    /// Item ceiling (0 = unlimited).
    pub max_items: usize,
    /// Byte ceiling (0 = unlimited).
    pub max_size_bytes: usize,
    /// Entry lifetime in seconds (0 = no expiry).
    pub ttl_seconds: u64,
    /// Query fields hashed into the cache key.
    pub fingerprint_fields: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_items: 1000,
            max_size_bytes: 100 * 1024 * 1024, // 100MB
            ttl_seconds: 3600,
            fingerprint_fields: DEFAULT_FINGERPRINT_FIELDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl CacheConfig {
    /// A config with caching turned off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set both ceilings.
    pub fn with_limits(mut self, max_items: usize, max_size_bytes: usize) -> Self {
        self.max_items = max_items;
        self.max_size_bytes = max_size_bytes;
        self
    }

    /// Entry lifetime, if any.
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_seconds > 0).then(|| Duration::from_secs(self.ttl_seconds))
    }
}

/// Supervision timing and restart policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// How often liveness is checked.
    pub probe_interval_ms: u64,
    /// Timeout of the periodic ping.
    pub ping_timeout_ms: u64,
    /// Timeout of the ping that confirms a fresh start.
    pub start_ping_timeout_ms: u64,
    /// Backoff for start attempts.
    pub retry: RetryConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            ping_timeout_ms: 5_000,
            start_ping_timeout_ms: 10_000,
            retry: RetryConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Set the probe interval.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the periodic ping timeout.
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the start retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Probe interval.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Periodic ping timeout.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Post-start ping timeout.
    pub fn start_ping_timeout(&self) -> Duration {
        Duration::from_millis(self.start_ping_timeout_ms)
    }
}

impl Config {
    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file (if any) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) => {
                    debug!(path = %path.display(), "Using discovered config file");
                    Self::from_file(&path)?
                }
                None => Self::default(),
            },
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file. Missing sections take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from a variable lookup (the process environment in practice).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("KATAGO_BINARY_PATH") {
            self.engine.binary_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("KATAGO_MODEL_PATH") {
            self.engine.model_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("KATAGO_CONFIG_PATH") {
            self.engine.config_path = Some(PathBuf::from(v));
        }
        if let Some(v) = parse_var(&lookup, "KATAGO_MAX_TIME")? {
            self.engine.max_time = v;
        }
        if let Some(v) = lookup("KATAGO_BRIDGE_CACHE_ENABLED") {
            self.cache.enabled = parse_bool("KATAGO_BRIDGE_CACHE_ENABLED", &v)?;
        }
        if let Some(v) = parse_var(&lookup, "KATAGO_BRIDGE_CACHE_MAX_ITEMS")? {
            self.cache.max_items = v;
        }
        if let Some(v) = parse_var(&lookup, "KATAGO_BRIDGE_CACHE_MAX_BYTES")? {
            self.cache.max_size_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, "KATAGO_BRIDGE_CACHE_TTL_SECS")? {
            self.cache.ttl_seconds = v;
        }
        if let Some(v) = parse_var(&lookup, "KATAGO_BRIDGE_PROBE_INTERVAL_MS")? {
            self.supervisor.probe_interval_ms = v;
        }
        Ok(())
    }

    /// Check the binary and model files and clamp out-of-range values.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let binary = &self.engine.binary_path;
        if binary.is_absolute() && !binary.exists() {
            return Err(ConfigError::BinaryNotFound(binary.clone()));
        }
        if let Some(model) = &self.engine.model_path
            && model.is_absolute()
            && !model.exists()
        {
            return Err(ConfigError::ModelNotFound(model.clone()));
        }

        if !(self.engine.max_time >= 0.1) {
            warn!(max_time = self.engine.max_time, "max_time too small, clamping to 0.1s");
            self.engine.max_time = 0.1;
        }
        if self.supervisor.probe_interval_ms == 0 {
            warn!("probe_interval_ms of 0 is not allowed, using 1000");
            self.supervisor.probe_interval_ms = 1000;
        }

        let retry = &mut self.supervisor.retry;
        if !(retry.multiplier >= 1.0) {
            retry.multiplier = 1.0;
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            retry.jitter = retry.jitter.clamp(0.0, 1.0);
            if retry.jitter.is_nan() {
                retry.jitter = 0.0;
            }
        }
        if retry.max_delay_ms < retry.initial_delay_ms {
            retry.max_delay_ms = retry.initial_delay_ms;
        }
        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KATAGO_BRIDGE_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let local = PathBuf::from("katago-bridge.json");
    if local.is_file() {
        return Some(local);
    }
    let home = std::env::var_os("HOME").map(PathBuf::from)?;
    let user = home.join(".katago-bridge").join("config.json");
    user.is_file().then_some(user)
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var: name, value }),
        None => Ok(None),
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var: name,
            value: value.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The config file is not valid JSON for [`Config`].
    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// An environment variable holds an unparseable value.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
    /// The configured binary does not exist.
    #[error("Engine binary not found: {}", .0.display())]
    BinaryNotFound(PathBuf),
    /// The configured model file does not exist.
    #[error("Engine model not found: {}", .0.display())]
    ModelNotFound(PathBuf),
}
