//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use course_engine_core::cache::{DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL};
use course_engine_core::EngineConfig;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub log_level: Level,
    /// `None` runs the service on in-memory stores without a durable queue.
    pub database_url: Option<String>,
    pub openai_api_key: String,
    pub openai_base_url: Option<String>,
    pub generation_model: String,
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub durable_queue_enabled: bool,
    pub queue_poll_interval: Duration,
    pub queue_max_attempts: u32,
}

/// Reads `name`, falling back to `default` when unset.
fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        // --- Load Server and Database Settings ---
        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let database_url = optional_var("DATABASE_URL");

        // --- Load Generator Settings ---
        let openai_api_key = optional_var("OPENAI_API_KEY")
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;
        let openai_base_url = optional_var("OPENAI_BASE_URL");
        let generation_model =
            std::env::var("GENERATION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        // --- Load Cache and Queue Settings ---
        let cache_ttl = Duration::from_secs(parse_var("PREGEN_CACHE_TTL_SECS", DEFAULT_TTL.as_secs())?);
        let sweep_interval = Duration::from_secs(parse_var(
            "PREGEN_SWEEP_INTERVAL_SECS",
            DEFAULT_SWEEP_INTERVAL.as_secs(),
        )?);
        if sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "PREGEN_SWEEP_INTERVAL_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let durable_queue_enabled =
            parse_var("DURABLE_QUEUE_ENABLED", database_url.is_some())? && database_url.is_some();
        let queue_poll_interval =
            Duration::from_millis(parse_var("QUEUE_POLL_INTERVAL_MS", 1_000u64)?);
        let queue_max_attempts = parse_var("QUEUE_MAX_ATTEMPTS", 3u32)?.max(1);

        Ok(Self {
            bind_address,
            log_level,
            database_url,
            openai_api_key,
            openai_base_url,
            generation_model,
            cache_ttl,
            sweep_interval,
            durable_queue_enabled,
            queue_poll_interval,
            queue_max_attempts,
        })
    }

    /// Engine tunables, defaults apart from what the environment overrides.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cache_ttl: self.cache_ttl,
            ..EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_falls_back_and_rejects_garbage() {
        assert_eq!(parse_var("COURSE_ENGINE_TEST_UNSET_VAR", 7u32).unwrap(), 7);

        std::env::set_var("COURSE_ENGINE_TEST_BAD_VAR", "seven");
        let err = parse_var("COURSE_ENGINE_TEST_BAD_VAR", 7u32).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(name, _) if name == "COURSE_ENGINE_TEST_BAD_VAR"));

        std::env::set_var("COURSE_ENGINE_TEST_GOOD_VAR", " 42 ");
        assert_eq!(parse_var("COURSE_ENGINE_TEST_GOOD_VAR", 7u32).unwrap(), 42);
    }

    #[test]
    fn engine_config_carries_cache_ttl() {
        let config = Config {
            bind_address: "127.0.0.1:3000".parse().unwrap(),
            log_level: Level::INFO,
            database_url: None,
            openai_api_key: "key".into(),
            openai_base_url: None,
            generation_model: "gpt-4o-mini".into(),
            cache_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            durable_queue_enabled: false,
            queue_poll_interval: Duration::from_millis(100),
            queue_max_attempts: 3,
        };
        assert_eq!(config.engine_config().cache_ttl, Duration::from_secs(60));
        assert_eq!(config.engine_config().pregeneration_depth, 3);
    }
}
