//! Configuration for the orchestration layer.
//!
//! Values are resolved from, lowest to highest precedence:
//!
//! 1. Built-in defaults
//! 2. Environment-specific overrides (development, staging, production)
//! 3. An optional TOML file (`BOXOFFICE_CONFIG`)
//! 4. Individual environment variables (`BOXOFFICE_LOG_LEVEL`,
//!    `BOXOFFICE_MAX_CONCURRENT`)
//!
//! Durations are written in milliseconds in the file format.
//!
//! # Example
//!
//! ```
//! use boxoffice_core::config::{Environment, OrchestrationConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OrchestrationConfig::from_toml_str(
//!     r#"
//!     environment = "staging"
//!
//!     [circuit_breaker]
//!     failure_threshold = 3
//!     "#,
//! )?;
//!
//! assert_eq!(config.environment, Environment::Staging);
//! assert_eq!(config.circuit_breaker.failure_threshold, 3);
//! assert_eq!(config.circuit_breaker.success_threshold, 2);
//! # Ok(())
//! # }
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable selecting the deployment environment.
pub const ENV_VAR: &str = "BOXOFFICE_ENV";
/// Environment variable pointing at a TOML configuration file.
pub const CONFIG_FILE_VAR: &str = "BOXOFFICE_CONFIG";
/// Environment variable overriding the log level.
pub const LOG_LEVEL_VAR: &str = "BOXOFFICE_LOG_LEVEL";
/// Environment variable overriding limiter and request-queue concurrency.
pub const MAX_CONCURRENT_VAR: &str = "BOXOFFICE_MAX_CONCURRENT";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Development environment (local)
    #[default]
    Development,
    /// Staging environment (pre-production)
    Staging,
    /// Production environment
    Production,
}

impl Environment {
    /// Check if this is production environment
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Check if this is development environment
    #[must_use]
    pub const fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Development),
            "staging" | "stage" => Ok(Self::Staging),
            "prod" | "production" => Ok(Self::Production),
            _ => Err(ConfigError::InvalidEnvironment(s.to_string())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

/// Cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Default time-to-live for entries, in milliseconds
    pub default_ttl_ms: u64,
}

impl CacheSettings {
    /// Validate cache settings
    ///
    /// # Errors
    ///
    /// Returns error if the TTL is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_ttl_ms == 0 {
            return Err(invalid("cache.default_ttl_ms must be > 0"));
        }
        Ok(())
    }

    /// Default TTL as Duration
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_ms: 5 * 60 * 1000,
        }
    }
}

/// Retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the initial attempt
    pub max_retries: usize,
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Factor applied to the delay after each retry
    pub backoff_multiplier: f64,
}

impl RetrySettings {
    /// Validate retry settings
    ///
    /// # Errors
    ///
    /// Returns error if the multiplier is below 1.0 or the initial delay
    /// exceeds the maximum delay
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            return Err(invalid("retry.backoff_multiplier must be a finite value >= 1.0"));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(invalid("retry.initial_delay_ms must be <= retry.max_delay_ms"));
        }
        Ok(())
    }

    /// Initial delay as Duration
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Maximum delay as Duration
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit
    pub failure_threshold: usize,
    /// Consecutive half-open successes that close it again
    pub success_threshold: usize,
    /// Time spent open before a probe is allowed, in milliseconds
    pub reset_timeout_ms: u64,
    /// Hard deadline for each guarded call, in milliseconds
    pub call_timeout_ms: u64,
}

impl CircuitBreakerSettings {
    /// Validate circuit breaker settings
    ///
    /// # Errors
    ///
    /// Returns error if any threshold or timeout is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold must be > 0"));
        }
        if self.success_threshold == 0 {
            return Err(invalid("circuit_breaker.success_threshold must be > 0"));
        }
        if self.reset_timeout_ms == 0 {
            return Err(invalid("circuit_breaker.reset_timeout_ms must be > 0"));
        }
        if self.call_timeout_ms == 0 {
            return Err(invalid("circuit_breaker.call_timeout_ms must be > 0"));
        }
        Ok(())
    }

    /// Reset timeout as Duration
    #[must_use]
    pub const fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Call timeout as Duration
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 60_000,
            call_timeout_ms: 10_000,
        }
    }
}

/// Concurrency limiter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterSettings {
    /// Maximum operations running at once
    pub max_concurrent: usize,
}

impl LimiterSettings {
    /// Validate limiter settings
    ///
    /// # Errors
    ///
    /// Returns error if `max_concurrent` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(invalid("limiter.max_concurrent must be > 0"));
        }
        Ok(())
    }
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self { max_concurrent: 6 }
    }
}

/// Request queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestQueueSettings {
    /// Maximum requests in flight
    pub max_concurrent: usize,
    /// Minimum spacing between dispatch starts, in milliseconds
    pub min_delay_ms: u64,
}

impl RequestQueueSettings {
    /// Validate request queue settings
    ///
    /// # Errors
    ///
    /// Returns error if `max_concurrent` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(invalid("request_queue.max_concurrent must be > 0"));
        }
        Ok(())
    }

    /// Minimum dispatch spacing as Duration
    #[must_use]
    pub const fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }
}

impl Default for RequestQueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            min_delay_ms: 100,
        }
    }
}

/// Batch processor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Items that trigger an immediate flush
    pub max_batch_size: usize,
    /// Longest an item waits for its batch, in milliseconds
    pub max_wait_ms: u64,
}

impl BatchSettings {
    /// Validate batch settings
    ///
    /// # Errors
    ///
    /// Returns error if `max_batch_size` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(invalid("batch.max_batch_size must be > 0"));
        }
        Ok(())
    }

    /// Maximum wait as Duration
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_wait_ms: 10,
        }
    }
}

/// Keyed loader settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    /// Batch window, in milliseconds
    pub window_ms: u64,
    /// Distinct keys per fetch
    pub max_batch_size: usize,
    /// Lifetime of loaded values, in milliseconds
    pub cache_ttl_ms: u64,
}

impl LoaderSettings {
    /// Validate loader settings
    ///
    /// # Errors
    ///
    /// Returns error if the batch size or cache TTL is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(invalid("loader.max_batch_size must be > 0"));
        }
        if self.cache_ttl_ms == 0 {
            return Err(invalid("loader.cache_ttl_ms must be > 0"));
        }
        Ok(())
    }

    /// Batch window as Duration
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Cache TTL as Duration
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            window_ms: 10,
            max_batch_size: 100,
            cache_ttl_ms: 5 * 60 * 1000,
        }
    }
}

/// Inventory reservation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationSettings {
    /// How long a hold lasts before it must be refreshed, in milliseconds
    pub lock_duration_ms: u64,
    /// Interval between background sweeps, in milliseconds
    pub sweep_interval_ms: u64,
}

impl ReservationSettings {
    /// Validate reservation settings
    ///
    /// # Errors
    ///
    /// Returns error if either duration is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_duration_ms == 0 {
            return Err(invalid("reservation.lock_duration_ms must be > 0"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(invalid("reservation.sweep_interval_ms must be > 0"));
        }
        Ok(())
    }

    /// Lock duration as Duration
    #[must_use]
    pub const fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    /// Sweep interval as Duration
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for ReservationSettings {
    fn default() -> Self {
        Self {
            lock_duration_ms: 5 * 60 * 1000,
            sweep_interval_ms: 60_000,
        }
    }
}

/// Observability settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Whether to install the Prometheus recorder
    pub metrics_enabled: bool,
}

impl ObservabilitySettings {
    /// Validate observability settings
    ///
    /// # Errors
    ///
    /// Returns error if the log level is unknown
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "invalid log_level: {}. Must be one of: {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
        }
    }
}

/// Complete configuration for the orchestration layer
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Deployment environment
    pub environment: Environment,
    /// Cache configuration
    pub cache: CacheSettings,
    /// Retry configuration
    pub retry: RetrySettings,
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerSettings,
    /// Concurrency limiter configuration
    pub limiter: LimiterSettings,
    /// Request queue configuration
    pub request_queue: RequestQueueSettings,
    /// Batch processor configuration
    pub batch: BatchSettings,
    /// Keyed loader configuration
    pub loader: LoaderSettings,
    /// Reservation configuration
    pub reservation: ReservationSettings,
    /// Observability configuration
    pub observability: ObservabilitySettings,
}

impl OrchestrationConfig {
    /// Load configuration from the process environment.
    ///
    /// Reads `BOXOFFICE_ENV` (defaults to development). If
    /// `BOXOFFICE_CONFIG` names a file, it is loaded on top of the
    /// environment defaults. Individual variable overrides are applied last.
    ///
    /// # Errors
    ///
    /// Returns error if any source cannot be read or parsed, or the result
    /// is invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if any source cannot be read or parsed, or the result
    /// is invalid
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = match lookup(ENV_VAR) {
            Some(value) => value.parse()?,
            None => Environment::Development,
        };

        let mut config = Self::defaults_for(environment);
        if let Some(path) = lookup(CONFIG_FILE_VAR) {
            let contents = std::fs::read_to_string(path)?;
            config = config.merge_toml(&contents)?;
        }

        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration for a specific environment from defaults only.
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn load(environment: Environment) -> Result<Self, ConfigError> {
        let config = Self::defaults_for(environment);
        config.validate()?;
        Ok(config)
    }

    /// Parse a complete TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the document does not parse or is invalid
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, does not parse, or is invalid
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    fn defaults_for(environment: Environment) -> Self {
        let mut config = Self {
            environment,
            ..Self::default()
        };

        match environment {
            Environment::Development => {
                config.observability.log_level = "debug".to_string();
            }
            Environment::Staging => {
                config.observability.log_level = "info".to_string();
            }
            Environment::Production => {
                config.observability.log_level = "warn".to_string();
                config.circuit_breaker.failure_threshold = 3; // Stricter in prod
            }
        }

        config
    }

    /// Overlay a TOML document on the current values. Keys absent from the
    /// document keep their current value.
    fn merge_toml(self, contents: &str) -> Result<Self, ConfigError> {
        let overlay: toml::Table = toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let toml::Value::Table(mut base) =
            toml::Value::try_from(&self).map_err(|e| ConfigError::Parse(e.to_string()))?
        else {
            return Err(ConfigError::Parse("configuration did not serialize to a table".to_string()));
        };

        for (section, value) in overlay {
            match (base.get_mut(&section), value) {
                (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                    existing.extend(incoming);
                }
                (_, value) => {
                    base.insert(section, value);
                }
            }
        }

        toml::Value::Table(base)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup(LOG_LEVEL_VAR) {
            self.observability.log_level = level;
        }

        if let Some(raw) = lookup(MAX_CONCURRENT_VAR) {
            let max_concurrent: usize = raw
                .parse()
                .map_err(|_| ConfigError::Parse(format!("{MAX_CONCURRENT_VAR}={raw} is not a number")))?;
            self.limiter.max_concurrent = max_concurrent;
            self.request_queue.max_concurrent = max_concurrent;
        }

        Ok(())
    }

    /// Validate entire configuration
    ///
    /// # Errors
    ///
    /// Returns error if any configuration section is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.limiter.validate()?;
        self.request_queue.validate()?;
        self.batch.validate()?;
        self.loader.validate()?;
        self.reservation.validate()?;
        self.observability.validate()?;
        Ok(())
    }

    /// Check if running in production
    #[must_use]
    pub const fn is_production(&self) -> bool {
        self.environment.is_production()
    }
}
