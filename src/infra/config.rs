//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::{Accuracy, TrackingProfile};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_api_timeout_ms")]
    pub timeout_ms: u64,
    /// JWT access token sent as `Authorization: JWT <token>`
    #[serde(default)]
    pub access_token: Option<String>,
}

fn default_api_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON file backing the local state store
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

fn default_store_path() -> String {
    "state/safezone.json".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeofenceConfig {
    /// Window after a processed enter/exit during which further ones are dropped
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self { debounce_secs: default_debounce_secs() }
    }
}

fn default_debounce_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Time spent in high accuracy before falling back to balanced
    #[serde(default = "default_dwell_secs")]
    pub dwell_secs: u64,
    #[serde(default = "default_high_interval_ms")]
    pub high_interval_ms: u64,
    #[serde(default = "default_high_distance_m")]
    pub high_distance_m: f64,
    #[serde(default = "default_balanced_interval_ms")]
    pub balanced_interval_ms: u64,
    #[serde(default = "default_balanced_distance_m")]
    pub balanced_distance_m: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            dwell_secs: default_dwell_secs(),
            high_interval_ms: default_high_interval_ms(),
            high_distance_m: default_high_distance_m(),
            balanced_interval_ms: default_balanced_interval_ms(),
            balanced_distance_m: default_balanced_distance_m(),
        }
    }
}

fn default_dwell_secs() -> u64 {
    120
}

fn default_high_interval_ms() -> u64 {
    5000
}

fn default_high_distance_m() -> f64 {
    5.0
}

fn default_balanced_interval_ms() -> u64 {
    10_000
}

fn default_balanced_distance_m() -> f64 {
    10.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_min_distance_m")]
    pub min_distance_m: f64,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Speed at or below which the patient counts as not moving
    #[serde(default = "default_inactivity_speed_mps")]
    pub inactivity_speed_mps: f64,
    #[serde(default = "default_inactivity_secs")]
    pub inactivity_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_distance_m: default_min_distance_m(),
            max_age_secs: default_max_age_secs(),
            inactivity_speed_mps: default_inactivity_speed_mps(),
            inactivity_secs: default_inactivity_secs(),
        }
    }
}

fn default_min_distance_m() -> f64 {
    10.0
}

fn default_max_age_secs() -> u64 {
    60
}

fn default_inactivity_speed_mps() -> f64 {
    0.5
}

fn default_inactivity_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Independent drain timer (0 to disable; drains still follow direct sends)
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            drain_interval_secs: default_drain_interval_secs(),
        }
    }
}

fn default_queue_capacity() -> usize {
    50
}

fn default_max_retries() -> u32 {
    5
}

fn default_drain_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub geofence: GeofenceConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    api_base_url: String,
    api_timeout_ms: u64,
    api_access_token: Option<String>,
    store_path: String,
    debounce_secs: u64,
    dwell_secs: u64,
    high_interval_ms: u64,
    high_distance_m: f64,
    balanced_interval_ms: u64,
    balanced_distance_m: f64,
    cache_min_distance_m: f64,
    cache_max_age_secs: u64,
    inactivity_speed_mps: f64,
    inactivity_secs: u64,
    queue_capacity: usize,
    queue_max_retries: u32,
    drain_interval_secs: u64,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/".to_string(),
            api_timeout_ms: default_api_timeout_ms(),
            api_access_token: None,
            store_path: default_store_path(),
            debounce_secs: default_debounce_secs(),
            dwell_secs: default_dwell_secs(),
            high_interval_ms: default_high_interval_ms(),
            high_distance_m: default_high_distance_m(),
            balanced_interval_ms: default_balanced_interval_ms(),
            balanced_distance_m: default_balanced_distance_m(),
            cache_min_distance_m: default_min_distance_m(),
            cache_max_age_secs: default_max_age_secs(),
            inactivity_speed_mps: default_inactivity_speed_mps(),
            inactivity_secs: default_inactivity_secs(),
            queue_capacity: default_queue_capacity(),
            queue_max_retries: default_max_retries(),
            drain_interval_secs: default_drain_interval_secs(),
            metrics_interval_secs: default_metrics_interval_secs(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from an explicit argument or environment
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        if let Some(path) = cli_path {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if toml_config.queue.capacity == 0 {
            anyhow::bail!("queue.capacity must be at least 1 in {}", path.display());
        }
        if toml_config.metrics.interval_secs == 0 {
            anyhow::bail!("metrics.interval_secs must be at least 1 in {}", path.display());
        }

        Ok(Self {
            api_base_url: toml_config.api.base_url,
            api_timeout_ms: toml_config.api.timeout_ms,
            api_access_token: toml_config.api.access_token,
            store_path: toml_config.store.path,
            debounce_secs: toml_config.geofence.debounce_secs,
            dwell_secs: toml_config.tracking.dwell_secs,
            high_interval_ms: toml_config.tracking.high_interval_ms,
            high_distance_m: toml_config.tracking.high_distance_m,
            balanced_interval_ms: toml_config.tracking.balanced_interval_ms,
            balanced_distance_m: toml_config.tracking.balanced_distance_m,
            cache_min_distance_m: toml_config.cache.min_distance_m,
            cache_max_age_secs: toml_config.cache.max_age_secs,
            inactivity_speed_mps: toml_config.cache.inactivity_speed_mps,
            inactivity_secs: toml_config.cache.inactivity_secs,
            queue_capacity: toml_config.queue.capacity,
            queue_max_retries: toml_config.queue.max_retries,
            drain_interval_secs: toml_config.queue.drain_interval_secs,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    pub fn api_access_token(&self) -> Option<&str> {
        self.api_access_token.as_deref()
    }

    pub fn store_path(&self) -> &str {
        &self.store_path
    }

    pub fn debounce_ms(&self) -> u64 {
        self.debounce_secs * 1000
    }

    pub fn dwell_ms(&self) -> u64 {
        self.dwell_secs * 1000
    }

    pub fn high_accuracy_profile(&self) -> TrackingProfile {
        TrackingProfile {
            accuracy: Accuracy::High,
            min_interval_ms: self.high_interval_ms,
            min_distance_m: self.high_distance_m,
        }
    }

    pub fn balanced_accuracy_profile(&self) -> TrackingProfile {
        TrackingProfile {
            accuracy: Accuracy::Balanced,
            min_interval_ms: self.balanced_interval_ms,
            min_distance_m: self.balanced_distance_m,
        }
    }

    pub fn cache_min_distance_m(&self) -> f64 {
        self.cache_min_distance_m
    }

    pub fn cache_max_age_ms(&self) -> u64 {
        self.cache_max_age_secs * 1000
    }

    pub fn inactivity_speed_mps(&self) -> f64 {
        self.inactivity_speed_mps
    }

    pub fn inactivity_ms(&self) -> u64 {
        self.inactivity_secs * 1000
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn queue_max_retries(&self) -> u32 {
        self.queue_max_retries
    }

    /// `None` when the independent drain timer is disabled
    pub fn drain_interval(&self) -> Option<Duration> {
        (self.drain_interval_secs > 0).then(|| Duration::from_secs(self.drain_interval_secs))
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to shorten the debounce window
    #[cfg(test)]
    pub fn with_debounce_secs(mut self, secs: u64) -> Self {
        self.debounce_secs = secs;
        self
    }

    /// Builder method for tests to change the queue capacity
    #[cfg(test)]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}
