//! TOML Configuration File Support
//!
//! Centralized configuration loading for the dispatcher, from a TOML file at
//! `~/.config/switchboard/switchboard.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! The configuration file follows XDG Base Directory specification:
//! - `$XDG_CONFIG_HOME/switchboard/switchboard.toml` (typically `~/.config/switchboard/switchboard.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [selection]
//! strategy = "hybrid"
//!
//! [balancing]
//! strategy = "weighted"
//! health_check_interval_ms = 30000
//!
//! [balancing.weights]
//! gpt-4-east = 3
//! gpt-4-west = 1
//!
//! [alerts]
//! max_response_time_ms = 10000
//! max_error_rate = 0.1
//!
//! [dispatch]
//! default_timeout_ms = 30000
//! max_retries = 1
//!
//! [[providers]]
//! id = "openai"
//! type = "cloud"
//! requests_per_minute = 3500
//!
//! [[backends]]
//! id = "gpt-4"
//! provider = "openai"
//! capabilities = ["code_generation", "reasoning"]
//! context_window = 128000
//! cost_per_token = 0.00003
//! response_time_ms = 2000
//!
//! [[backends.instances]]
//! id = "gpt-4-east"
//!
//! [[backends.instances]]
//! id = "gpt-4-west"
//! ```

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::config::{
    AlertThresholds, BalancingConfig, BalancingStrategy, Capability, CachingConfig,
    CapabilitySet, DispatchSettings, SelectionStrategy,
};
use crate::routing::registry::{Backend, Instance, ModelType, Provider, ProviderType, RateLimits, Tier};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Selection section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionToml {
    /// `performance_first`, `cost_optimized`, `capability_matched` or `hybrid`
    pub strategy: Option<String>,
}

/// Balancing section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancingToml {
    /// `round_robin`, `weighted` or `performance_based`
    pub strategy: Option<String>,

    /// Background health probe period in milliseconds
    pub health_check_interval_ms: Option<u64>,

    /// Instance id to weight
    pub weights: HashMap<String, u32>,
}

/// Alert threshold section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsToml {
    pub max_response_time_ms: Option<f64>,
    pub max_error_rate: Option<f64>,
    pub min_health_score: Option<f64>,
    pub max_requests_per_minute: Option<u32>,
}

/// Dispatch section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchToml {
    /// Per-attempt timeout in milliseconds
    pub default_timeout_ms: Option<u64>,

    /// Bound on the whole fallback chain in milliseconds
    pub request_deadline_ms: Option<u64>,

    /// Same-backend retries before falling back
    pub max_retries: Option<u32>,

    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,

    /// Capacity of the event channel
    pub event_capacity: Option<usize>,
}

/// Caching section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CachingToml {
    pub enabled: Option<bool>,
    pub ttl_secs: Option<u64>,
    pub max_size: Option<usize>,
    pub compression_enabled: Option<bool>,
}

/// One `[[providers]]` entry
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderToml {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub provider_type: Option<ProviderType>,
    pub endpoint: Option<String>,
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: Option<u32>,
    pub requests_per_day: Option<u32>,
}

/// One `[[backends]]` entry
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    pub id: String,
    pub name: Option<String>,
    /// Id of a `[[providers]]` entry
    pub provider: Option<String>,
    pub model_type: Option<ModelType>,
    pub tier: Option<Tier>,
    pub capabilities: Vec<String>,
    pub context_window: Option<u32>,
    pub cost_per_token: Option<f64>,
    pub response_time_ms: Option<u64>,
    pub instances: Vec<Instance>,
}

/// Root TOML configuration structure
///
/// Every field is optional so partial files work.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardToml {
    pub selection: SelectionToml,
    pub balancing: BalancingToml,
    pub alerts: AlertsToml,
    pub dispatch: DispatchToml,
    pub caching: CachingToml,
    pub providers: Vec<ProviderToml>,
    pub backends: Vec<BackendToml>,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Resolved configuration with all sources merged
#[derive(Clone, Debug)]
pub struct SwitchboardConfig {
    /// Scoring strategy of the selector
    pub selection_strategy: SelectionStrategy,

    /// Instance balancing
    pub balancing: BalancingConfig,

    /// Performance alert thresholds
    pub alerts: AlertThresholds,

    /// Timeouts, retries and event channel sizing
    pub dispatch: DispatchSettings,

    /// Handed through to the caching layer
    pub caching: CachingConfig,

    /// Known providers
    pub providers: Vec<Provider>,

    /// Backend catalog, in declaration order
    pub catalog: Vec<Backend>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            selection_strategy: SelectionStrategy::default(),
            balancing: BalancingConfig::default(),
            alerts: AlertThresholds::default(),
            dispatch: DispatchSettings::default(),
            caching: CachingConfig::default(),
            providers: Vec::new(),
            catalog: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl SwitchboardConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document, without consulting the environment
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let toml_config: SwitchboardToml = toml::from_str(content)?;
        let mut config = Self::default();
        apply_toml_config(&mut config, &toml_config)?;
        config.source = ConfigSource::File;
        config.validate()?;
        Ok(config)
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check cross-field constraints
    ///
    /// An empty catalog is valid here; dispatching against it is not.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let alerts = &self.alerts;
        if !(alerts.max_response_time_ms.is_finite() && alerts.max_response_time_ms > 0.0) {
            return Err(invalid(format!(
                "alerts.max_response_time_ms must be positive, got {}",
                alerts.max_response_time_ms
            )));
        }
        for (name, value) in [
            ("alerts.max_error_rate", alerts.max_error_rate),
            ("alerts.min_health_score", alerts.min_health_score),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("{name} must be between 0 and 1, got {value}")));
            }
        }
        if alerts.max_requests_per_minute == 0 {
            return Err(invalid("alerts.max_requests_per_minute must be at least 1"));
        }

        if self.dispatch.default_timeout.is_zero() {
            return Err(invalid("dispatch.default_timeout_ms must be greater than zero"));
        }
        if self.dispatch.request_deadline.is_some_and(|d| d.is_zero()) {
            return Err(invalid("dispatch.request_deadline_ms must be greater than zero"));
        }
        if self.dispatch.event_capacity == 0 {
            return Err(invalid("dispatch.event_capacity must be at least 1"));
        }
        if self.caching.enabled && (self.caching.ttl.is_zero() || self.caching.max_size == 0) {
            return Err(invalid("caching.ttl_secs and caching.max_size must be positive when caching is enabled"));
        }

        let mut ids = HashSet::new();
        let mut instance_ids = HashSet::new();
        for backend in &self.catalog {
            if backend.id.trim().is_empty() {
                return Err(invalid("backend id must not be empty"));
            }
            if !ids.insert(backend.id.as_str()) {
                return Err(invalid(format!("duplicate backend id '{}'", backend.id)));
            }
            if !(backend.cost_per_token.is_finite() && backend.cost_per_token >= 0.0) {
                return Err(invalid(format!(
                    "backend '{}': cost_per_token must not be negative",
                    backend.id
                )));
            }
            if backend.context_window == 0 {
                return Err(invalid(format!(
                    "backend '{}': context_window must be greater than zero",
                    backend.id
                )));
            }
            instance_ids.extend(backend.endpoint_ids());
        }

        let mut weighted: Vec<&String> = self.balancing.weights.keys().collect();
        weighted.sort();
        if let Some(unknown) = weighted.into_iter().find(|id| !instance_ids.contains(*id)) {
            return Err(invalid(format!(
                "balancing weight refers to unknown instance '{unknown}'"
            )));
        }

        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/switchboard/switchboard.toml` or
/// `~/.config/switchboard/switchboard.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchboard").join("switchboard.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the merged configuration is invalid. A missing config file is not an
/// error (defaults are used).
pub fn load_config() -> Result<SwitchboardConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<SwitchboardConfig, ConfigError> {
    let mut config = SwitchboardConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: SwitchboardToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                backends = config.catalog.len(),
                providers = config.providers.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;

    Ok(config)
}

fn parse_strategy<T>(field: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| invalid(format!("{field}: {e}")))
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(
    config: &mut SwitchboardConfig,
    toml: &SwitchboardToml,
) -> Result<(), ConfigError> {
    // Selection
    if let Some(ref strategy) = toml.selection.strategy {
        config.selection_strategy = parse_strategy("selection.strategy", strategy)?;
    }

    // Balancing
    if let Some(ref strategy) = toml.balancing.strategy {
        config.balancing.strategy = parse_strategy("balancing.strategy", strategy)?;
    }
    if let Some(ms) = toml.balancing.health_check_interval_ms {
        config.balancing.health_check_interval = Duration::from_millis(ms);
    }
    config
        .balancing
        .weights
        .extend(toml.balancing.weights.iter().map(|(k, v)| (k.clone(), *v)));

    // Alerts
    if let Some(ms) = toml.alerts.max_response_time_ms {
        config.alerts.max_response_time_ms = ms;
    }
    if let Some(rate) = toml.alerts.max_error_rate {
        config.alerts.max_error_rate = rate;
    }
    if let Some(score) = toml.alerts.min_health_score {
        config.alerts.min_health_score = score;
    }
    if let Some(rpm) = toml.alerts.max_requests_per_minute {
        config.alerts.max_requests_per_minute = rpm;
    }

    // Dispatch
    if let Some(ms) = toml.dispatch.default_timeout_ms {
        config.dispatch.default_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.dispatch.request_deadline_ms {
        config.dispatch.request_deadline = Some(Duration::from_millis(ms));
    }
    if let Some(retries) = toml.dispatch.max_retries {
        config.dispatch.retry.max_retries = retries;
    }
    if let Some(ms) = toml.dispatch.initial_backoff_ms {
        config.dispatch.retry.initial_backoff_ms = ms;
    }
    if let Some(ms) = toml.dispatch.max_backoff_ms {
        config.dispatch.retry.max_backoff_ms = ms;
    }
    if let Some(capacity) = toml.dispatch.event_capacity {
        config.dispatch.event_capacity = capacity;
    }

    // Caching
    if let Some(enabled) = toml.caching.enabled {
        config.caching.enabled = enabled;
    }
    if let Some(secs) = toml.caching.ttl_secs {
        config.caching.ttl = Duration::from_secs(secs);
    }
    if let Some(size) = toml.caching.max_size {
        config.caching.max_size = size;
    }
    if let Some(enabled) = toml.caching.compression_enabled {
        config.caching.compression_enabled = enabled;
    }

    // Providers, then the backends that reference them
    for entry in &toml.providers {
        if entry.id.trim().is_empty() {
            return Err(invalid("provider id must not be empty"));
        }
        config.providers.push(Provider {
            id: entry.id.clone(),
            name: entry.name.clone().unwrap_or_else(|| entry.id.clone()),
            provider_type: entry.provider_type.unwrap_or_default(),
            endpoint: entry.endpoint.clone(),
            rate_limits: RateLimits {
                requests_per_minute: entry.requests_per_minute.unwrap_or_default(),
                tokens_per_minute: entry.tokens_per_minute.unwrap_or_default(),
                requests_per_day: entry.requests_per_day.unwrap_or_default(),
            },
        });
    }

    for entry in &toml.backends {
        let backend = build_backend(entry, &config.providers)?;
        config.catalog.push(backend);
    }
    // Primaries before fallbacks; stable, so declaration order holds per tier
    config.catalog.sort_by_key(|b| b.tier);

    Ok(())
}

fn build_backend(entry: &BackendToml, providers: &[Provider]) -> Result<Backend, ConfigError> {
    let provider = match entry.provider {
        Some(ref id) => providers
            .iter()
            .find(|p| &p.id == id)
            .cloned()
            .ok_or_else(|| {
                invalid(format!(
                    "backend '{}' references unknown provider '{id}'",
                    entry.id
                ))
            })?,
        None => Provider::default(),
    };

    let mut capabilities = CapabilitySet::empty();
    for name in &entry.capabilities {
        let capability: Capability =
            parse_strategy(&format!("backend '{}' capabilities", entry.id), name)?;
        capabilities.insert(capability);
    }

    let mut backend = Backend::new(
        entry.id.clone(),
        entry.name.clone().unwrap_or_else(|| entry.id.clone()),
    )
    .with_provider(provider)
    .with_capabilities(capabilities);

    if let Some(model_type) = entry.model_type {
        backend = backend.with_model_type(model_type);
    }
    if let Some(tier) = entry.tier {
        backend = backend.with_tier(tier);
    }
    if let Some(tokens) = entry.context_window {
        backend = backend.with_context_window(tokens);
    }
    if let Some(cost) = entry.cost_per_token {
        backend = backend.with_cost_per_token(cost);
    }
    if let Some(ms) = entry.response_time_ms {
        backend = backend.with_response_time_ms(ms);
    }
    for instance in &entry.instances {
        backend = backend.with_instance(instance.clone());
    }
    Ok(backend)
}

fn parse_env_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| invalid(format!("{key}: '{value}' is not a valid number")))
}

/// Apply environment variable overrides to the config
///
/// `lookup` resolves a variable name; production passes `std::env::var`.
fn apply_env_config<F>(config: &mut SwitchboardConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup("SWITCHBOARD_SELECTION_STRATEGY") {
        config.selection_strategy = parse_strategy("SWITCHBOARD_SELECTION_STRATEGY", &value)?;
        config.source = ConfigSource::Env;
    }
    if let Some(value) = lookup("SWITCHBOARD_BALANCING_STRATEGY") {
        config.balancing.strategy =
            parse_strategy::<BalancingStrategy>("SWITCHBOARD_BALANCING_STRATEGY", &value)?;
        config.source = ConfigSource::Env;
    }
    if let Some(value) = lookup("SWITCHBOARD_DEFAULT_TIMEOUT_MS") {
        let ms = parse_env_number::<u64>("SWITCHBOARD_DEFAULT_TIMEOUT_MS", &value)?;
        config.dispatch.default_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(value) = lookup("SWITCHBOARD_REQUEST_DEADLINE_MS") {
        let ms = parse_env_number::<u64>("SWITCHBOARD_REQUEST_DEADLINE_MS", &value)?;
        config.dispatch.request_deadline = Some(Duration::from_millis(ms));
        config.source = ConfigSource::Env;
    }
    if let Some(value) = lookup("SWITCHBOARD_MAX_RETRIES") {
        config.dispatch.retry.max_retries = parse_env_number("SWITCHBOARD_MAX_RETRIES", &value)?;
        config.source = ConfigSource::Env;
    }
    if let Some(value) = lookup("SWITCHBOARD_MAX_RESPONSE_TIME_MS") {
        config.alerts.max_response_time_ms =
            parse_env_number("SWITCHBOARD_MAX_RESPONSE_TIME_MS", &value)?;
        config.source = ConfigSource::Env;
    }
    if let Some(value) = lookup("SWITCHBOARD_MAX_ERROR_RATE") {
        config.alerts.max_error_rate = parse_env_number("SWITCHBOARD_MAX_ERROR_RATE", &value)?;
        config.source = ConfigSource::Env;
    }
    if let Some(value) = lookup("SWITCHBOARD_MIN_HEALTH_SCORE") {
        config.alerts.min_health_score = parse_env_number("SWITCHBOARD_MIN_HEALTH_SCORE", &value)?;
        config.source = ConfigSource::Env;
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides,
/// then call [`SwitchboardConfig::validate`] again.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub selection_strategy: Option<SelectionStrategy>,
    pub balancing_strategy: Option<BalancingStrategy>,
    pub default_timeout_ms: Option<u64>,
    pub request_deadline_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_selection_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.selection_strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_balancing_strategy(mut self, strategy: BalancingStrategy) -> Self {
        self.balancing_strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_default_timeout_ms(mut self, ms: u64) -> Self {
        self.default_timeout_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_request_deadline_ms(mut self, ms: u64) -> Self {
        self.request_deadline_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    fn is_empty(&self) -> bool {
        self.selection_strategy.is_none()
            && self.balancing_strategy.is_none()
            && self.default_timeout_ms.is_none()
            && self.request_deadline_ms.is_none()
            && self.max_retries.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut SwitchboardConfig) {
        if self.is_empty() {
            return;
        }
        config.source = ConfigSource::Cli;

        if let Some(strategy) = self.selection_strategy {
            config.selection_strategy = strategy;
        }
        if let Some(strategy) = self.balancing_strategy {
            config.balancing.strategy = strategy;
        }
        if let Some(ms) = self.default_timeout_ms {
            config.dispatch.default_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.request_deadline_ms {
            config.dispatch.request_deadline = Some(Duration::from_millis(ms));
        }
        if let Some(retries) = self.max_retries {
            config.dispatch.retry.max_retries = retries;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
