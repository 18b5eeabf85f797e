//! Engine configuration, read from the environment
//!
//! Mirrors the lineage's `everruns-worker` entrypoint pattern: one required
//! variable (`DATABASE_URL`), everything else defaulted to the values named
//! in the specification.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Engine-wide tunables. Constructed via [`EngineConfig::from_env`] in
/// binaries; library code always takes an `EngineConfig` by value/reference,
/// never reads the environment itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,

    /// Default lock duration (spec.md §4.3).
    pub lock_duration: Duration,

    /// Database retry decorator parameters (spec.md §4.2).
    pub db_retry_max_attempts: u32,
    pub db_retry_initial: Duration,
    pub db_retry_max: Duration,

    /// Sleep steps at or under this threshold run in-process instead of
    /// suspending durably (spec.md §4.4).
    pub sleep_inline_threshold: Duration,

    /// `forEach`/trigger default and hard-cap iteration counts (spec.md §4.4/§4.7).
    pub foreach_default_max_iterations: u32,
    pub foreach_hard_cap: u32,

    /// Drop scheduler messages older than this (spec.md §4.8).
    pub message_age_cap: Duration,

    /// Webhook HMAC signing keys: current, and next (for rotation).
    pub webhook_signing_key: Option<String>,
    pub webhook_next_signing_key: Option<String>,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingVar("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            lock_duration: Duration::from_secs(env_u64("LOCK_DURATION_SECS", 300)?),
            db_retry_max_attempts: env_u32("DB_RETRY_MAX_ATTEMPTS", 5)?,
            db_retry_initial: Duration::from_millis(env_u64("DB_RETRY_INITIAL_MS", 1_000)?),
            db_retry_max: Duration::from_millis(env_u64("DB_RETRY_MAX_MS", 60_000)?),
            sleep_inline_threshold: Duration::from_secs(env_u64(
                "SLEEP_INLINE_THRESHOLD_SECS",
                5,
            )?),
            foreach_default_max_iterations: env_u32("FOREACH_DEFAULT_MAX_ITERATIONS", 100)?,
            foreach_hard_cap: env_u32("FOREACH_HARD_CAP", 100)?,
            message_age_cap: Duration::from_secs(env_u64("MESSAGE_AGE_CAP_SECS", 86_400)?),
            webhook_signing_key: std::env::var("WEBHOOK_SIGNING_KEY").ok(),
            webhook_next_signing_key: std::env::var("WEBHOOK_NEXT_SIGNING_KEY").ok(),
        })
    }
}

fn env_u64(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

fn env_u32(var: &'static str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_database_url_is_an_error() {
        std::env::remove_var("DATABASE_URL");
        assert!(matches!(
            EngineConfig::from_env(),
            Err(ConfigError::MissingVar("DATABASE_URL"))
        ));
    }

    #[test]
    fn defaults_match_spec() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/test");
        std::env::remove_var("LOCK_DURATION_SECS");
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.lock_duration, Duration::from_secs(300));
        assert_eq!(config.db_retry_max_attempts, 5);
        assert_eq!(config.foreach_hard_cap, 100);
        std::env::remove_var("DATABASE_URL");
    }
}
