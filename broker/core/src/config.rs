//! Broker Configuration
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then environment variables. Everything has a sane default except the API
//! credential, whose absence is surfaced by the broker facade as a
//! configuration error before any request is enqueued.
//!
//! # Environment Variables
//!
//! - `GEMINI_API_KEY`: the provider credential
//! - `BROKER_BASE_URL`: provider endpoint override
//! - `BROKER_TIMEOUT_SECS`: per-attempt network timeout
//! - `BROKER_WINDOW_SECS` / `BROKER_MAX_PER_WINDOW` / `BROKER_MIN_SPACING_SECS`
//! - `BROKER_MAX_ATTEMPTS` / `BROKER_BUDGET_CAP`
//! - `BROKER_MAX_TOKENS` / `BROKER_TEMPERATURE`
//! - `BROKER_CONFIG`: path to the TOML file (otherwise the XDG location)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::backend::DEFAULT_BASE_URL;
use crate::ratelimit::RateLimitConfig;
use crate::retry::RetryPolicy;

/// Errors from configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
    /// The file could not be parsed as TOML
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed
        path: PathBuf,
        /// Underlying TOML error
        source: toml::de::Error,
    },
}

/// Full broker configuration
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Provider credential; `None` fails fast at the facade
    pub api_key: Option<String>,
    /// Provider endpoint
    pub base_url: String,
    /// Per-attempt network timeout
    pub request_timeout: Duration,
    /// Provider pacing
    pub rate_limit: RateLimitConfig,
    /// Classification and escalation tunables
    pub retry: RetryPolicy,
    /// Default total attempt cap per request
    pub max_attempts: u32,
    /// Default output-token budget at submission time
    pub default_max_tokens: u32,
    /// Default sampling temperature
    pub default_temperature: f32,
    /// Backlog capacity of the request queue
    pub queue_capacity: usize,
    /// Ordered model preference list, most capable first
    pub preferred_models: Vec<String>,
    /// Identifier used when model discovery fails
    pub fallback_model: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            max_attempts: 3,
            default_max_tokens: 1024,
            default_temperature: 0.7,
            queue_capacity: 64,
            preferred_models: vec![
                "gemini-2.5-flash".to_string(),
                "gemini-2.0-flash".to_string(),
                "gemini-1.5-flash".to_string(),
                "gemini-1.5-pro".to_string(),
            ],
            fallback_model: "gemini-2.0-flash".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Defaults overlaid with environment variables only
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay environment variables onto this configuration
    fn apply_env(&mut self) {
        if let Some(key) = env_string("GEMINI_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(url) = env_string("BROKER_BASE_URL") {
            self.base_url = url;
        }
        if let Some(secs) = env_parse::<u64>("BROKER_TIMEOUT_SECS") {
            self.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("BROKER_WINDOW_SECS") {
            self.rate_limit.window = Duration::from_secs(secs);
        }
        if let Some(max) = env_parse::<u32>("BROKER_MAX_PER_WINDOW") {
            self.rate_limit.max_per_window = max;
        }
        if let Some(secs) = env_parse::<u64>("BROKER_MIN_SPACING_SECS") {
            self.rate_limit.min_spacing = Duration::from_secs(secs);
        }
        if let Some(attempts) = env_parse::<u32>("BROKER_MAX_ATTEMPTS") {
            self.max_attempts = attempts;
        }
        if let Some(cap) = env_parse::<u32>("BROKER_BUDGET_CAP") {
            self.retry.budget_cap = cap;
        }
        if let Some(tokens) = env_parse::<u32>("BROKER_MAX_TOKENS") {
            self.default_max_tokens = tokens;
        }
        if let Some(temperature) = env_parse::<f32>("BROKER_TEMPERATURE") {
            self.default_temperature = temperature;
        }
    }

    /// Overlay a parsed TOML file onto this configuration
    fn apply_file(&mut self, file: BrokerToml) {
        if let Some(provider) = file.provider {
            if let Some(key) = provider.api_key {
                self.api_key = Some(key);
            }
            if let Some(url) = provider.base_url {
                self.base_url = url;
            }
            if let Some(secs) = provider.timeout_secs {
                self.request_timeout = Duration::from_secs(secs);
            }
        }
        if let Some(pacing) = file.pacing {
            if let Some(secs) = pacing.window_secs {
                self.rate_limit.window = Duration::from_secs(secs);
            }
            if let Some(max) = pacing.max_per_window {
                self.rate_limit.max_per_window = max;
            }
            if let Some(secs) = pacing.min_spacing_secs {
                self.rate_limit.min_spacing = Duration::from_secs(secs);
            }
        }
        if let Some(retry) = file.retry {
            if let Some(attempts) = retry.max_attempts {
                self.max_attempts = attempts;
            }
            if let Some(secs) = retry.backoff_floor_secs {
                self.retry.backoff_floor = Duration::from_secs(secs);
            }
            if let Some(secs) = retry.default_backoff_secs {
                self.retry.default_backoff = Duration::from_secs(secs);
            }
            if let Some(headroom) = retry.escalation_headroom {
                self.retry.escalation_headroom = headroom;
            }
            if let Some(cap) = retry.budget_cap {
                self.retry.budget_cap = cap;
            }
        }
        if let Some(generation) = file.generation {
            if let Some(tokens) = generation.max_tokens {
                self.default_max_tokens = tokens;
            }
            if let Some(temperature) = generation.temperature {
                self.default_temperature = temperature;
            }
        }
        if let Some(models) = file.models {
            if let Some(preferred) = models.preferred {
                self.preferred_models = preferred;
            }
            if let Some(fallback) = models.fallback {
                self.fallback_model = fallback;
            }
        }
    }
}

/// Default config file location: `$XDG_CONFIG_HOME/genbroker/config.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("genbroker").join("config.toml"))
}

/// Load configuration: defaults, then the default-location TOML file if it
/// exists (or the file named by `BROKER_CONFIG`), then environment variables
pub fn load_config() -> Result<BrokerConfig, ConfigError> {
    let path = env_string("BROKER_CONFIG")
        .map(PathBuf::from)
        .or_else(default_config_path);

    let mut config = match path {
        Some(ref path) if path.exists() => load_config_from_path(path)?,
        _ => BrokerConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

/// Load configuration from an explicit TOML file (no environment overlay)
pub fn load_config_from_path(path: &Path) -> Result<BrokerConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: BrokerToml = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut config = BrokerConfig::default();
    config.apply_file(file);
    Ok(config)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.parse().ok())
}

// TOML file shape. Every field optional; absent fields keep their defaults.

#[derive(Debug, Default, Deserialize)]
struct BrokerToml {
    provider: Option<ProviderToml>,
    pacing: Option<PacingToml>,
    retry: Option<RetryToml>,
    generation: Option<GenerationToml>,
    models: Option<ModelsToml>,
}

#[derive(Debug, Deserialize)]
struct ProviderToml {
    api_key: Option<String>,
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PacingToml {
    window_secs: Option<u64>,
    max_per_window: Option<u32>,
    min_spacing_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RetryToml {
    max_attempts: Option<u32>,
    backoff_floor_secs: Option<u64>,
    default_backoff_secs: Option<u64>,
    escalation_headroom: Option<u32>,
    budget_cap: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerationToml {
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ModelsToml {
    preferred: Option<Vec<String>>,
    fallback: Option<String>,
}
