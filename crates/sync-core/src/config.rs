//! Runtime configuration (spec.md §6 "Environment variables / configuration
//! knobs"). A value, not a global: callers construct one and pass it
//! around, the way the teacher threads cadence constants through
//! `device_sync_scheduler.rs` rather than reading statics at call sites.

use std::time::Duration;

/// `SYNC_ENVIRONMENT` (spec.md §6). Controls the default base URL and lets
/// the lifecycle debounce shorten for local iteration, replacing the
/// source's `cfg!(debug_assertions)` branch with a value so it's testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Debug,
}

impl Environment {
    fn from_env_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "debug" => Environment::Debug,
            _ => Environment::Production,
        }
    }
}

const DEFAULT_IMMEDIATE_DEBOUNCE_SECS: u64 = 1;
const DEFAULT_LIFECYCLE_DEBOUNCE_SECS_PRODUCTION: u64 = 600;
const DEFAULT_LIFECYCLE_DEBOUNCE_SECS_DEBUG: u64 = 60;

/// Everything the sync engine needs to know about its environment
/// (spec.md §6).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub environment: Environment,
    pub immediate_debounce: Duration,
    pub lifecycle_debounce: Duration,
}

impl SyncConfig {
    pub fn new(base_url: impl Into<String>, environment: Environment) -> Self {
        let lifecycle_debounce = match environment {
            Environment::Production => DEFAULT_LIFECYCLE_DEBOUNCE_SECS_PRODUCTION,
            Environment::Debug => DEFAULT_LIFECYCLE_DEBOUNCE_SECS_DEBUG,
        };
        SyncConfig {
            base_url: base_url.into(),
            environment,
            immediate_debounce: Duration::from_secs(DEFAULT_IMMEDIATE_DEBOUNCE_SECS),
            lifecycle_debounce: Duration::from_secs(lifecycle_debounce),
        }
    }

    /// Build from `SYNC_BASE_URL` (required), `SYNC_ENVIRONMENT`,
    /// `SYNC_IMMEDIATE_DEBOUNCE_SEC`, `SYNC_LIFECYCLE_DEBOUNCE_SEC`
    /// (spec.md §6), falling back to the documented defaults.
    pub fn from_env() -> Result<Self, std::env::VarError> {
        let base_url = std::env::var("SYNC_BASE_URL")?;
        let environment = std::env::var("SYNC_ENVIRONMENT")
            .map(|v| Environment::from_env_str(&v))
            .unwrap_or(Environment::Production);

        let mut config = SyncConfig::new(base_url, environment);

        if let Ok(value) = std::env::var("SYNC_IMMEDIATE_DEBOUNCE_SEC") {
            if let Ok(secs) = value.parse::<u64>() {
                config.immediate_debounce = Duration::from_secs(secs);
            }
        }
        if let Ok(value) = std::env::var("SYNC_LIFECYCLE_DEBOUNCE_SEC") {
            if let Ok(secs) = value.parse::<u64>() {
                config.lifecycle_debounce = Duration::from_secs(secs);
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_environment_shortens_lifecycle_debounce() {
        let prod = SyncConfig::new("https://s.example", Environment::Production);
        let debug = SyncConfig::new("https://s.example", Environment::Debug);
        assert_eq!(prod.lifecycle_debounce, Duration::from_secs(600));
        assert_eq!(debug.lifecycle_debounce, Duration::from_secs(60));
    }

    #[test]
    fn immediate_debounce_defaults_to_one_second() {
        let config = SyncConfig::new("https://s.example", Environment::Production);
        assert_eq!(config.immediate_debounce, Duration::from_secs(1));
    }
}
