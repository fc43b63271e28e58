use std::time::Duration;

use crate::record::RetryPolicy;

/// Runtime configuration for the governance services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernanceConfig {
    /// Retries on a stale version token before the conflict is surfaced.
    pub max_conflict_retries: u32,

    /// Pause between conflict retries.
    pub conflict_retry_backoff: Duration,

    /// Upper bound for a single notification dispatch.
    pub notification_timeout: Duration,

    /// Number of open values revalidated when a property definition changes
    /// type, requiredness or validation rule. Zero means all of them.
    pub type_change_sample_limit: usize,

    /// Hard cap on the number of rules evaluated in one cycle.
    pub max_cycle_rules: usize,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            conflict_retry_backoff: Duration::from_millis(10),
            notification_timeout: Duration::from_millis(2000),
            type_change_sample_limit: 0,
            max_cycle_rules: 1000,
        }
    }
}

impl GovernanceConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    ///
    /// This allows tests to supply variables without mutating process-global
    /// environment state.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let defaults = Self::default();

        let max_conflict_retries = read_parsed(
            &reader,
            "ACCORD_MAX_CONFLICT_RETRIES",
            defaults.max_conflict_retries,
        )?;

        let conflict_retry_backoff = Duration::from_millis(read_parsed(
            &reader,
            "ACCORD_CONFLICT_RETRY_BACKOFF_MS",
            10u64,
        )?);

        let notification_timeout_ms: u64 =
            read_parsed(&reader, "ACCORD_NOTIFICATION_TIMEOUT_MS", 2000u64)?;
        if notification_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "ACCORD_NOTIFICATION_TIMEOUT_MS".into(),
                "must be greater than zero".into(),
            ));
        }

        let type_change_sample_limit = read_parsed(
            &reader,
            "ACCORD_TYPE_CHANGE_SAMPLE_LIMIT",
            defaults.type_change_sample_limit,
        )?;

        let max_cycle_rules =
            read_parsed(&reader, "ACCORD_MAX_CYCLE_RULES", defaults.max_cycle_rules)?;
        if max_cycle_rules == 0 {
            return Err(ConfigError::InvalidValue(
                "ACCORD_MAX_CYCLE_RULES".into(),
                "must be greater than zero".into(),
            ));
        }

        Ok(Self {
            max_conflict_retries,
            conflict_retry_backoff,
            notification_timeout: Duration::from_millis(notification_timeout_ms),
            type_change_sample_limit,
            max_cycle_rules,
        })
    }

    /// Retry policy for optimistic-concurrency conflicts.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_conflict_retries,
            backoff: self.conflict_retry_backoff,
        }
    }
}

fn read_parsed<F, T>(reader: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match reader(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.into(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}
