//! Worker configuration.
//!
//! Every knob has a default; the environment overrides it.

use std::str::FromStr;
use std::time::Duration;

use projector_core::{DomainError, MAX_ERROR_LEN, RetryPolicy};

use crate::queue::DispatchMode;

pub const ENV_POLL_INTERVAL_MS: &str = "PROJECTION_POLL_INTERVAL_MS";
pub const ENV_BATCH_SIZE: &str = "PROJECTION_BATCH_SIZE";
pub const ENV_MAX_RETRY: &str = "PROJECTION_MAX_RETRY";
pub const ENV_BACKOFF_BASE_MS: &str = "PROJECTION_BACKOFF_BASE_MS";
pub const ENV_BACKOFF_CAP_MS: &str = "PROJECTION_BACKOFF_CAP_MS";
pub const ENV_ERROR_MAX_LEN: &str = "PROJECTION_ERROR_MAX_LEN";
pub const ENV_DISPATCH_LANES: &str = "PROJECTION_DISPATCH_LANES";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Settings of one projection worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Delay between the end of one tick and the start of the next
    pub poll_interval: Duration,
    /// Maximum tasks claimed per tick
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Failure messages are cut to this many characters before persisting
    pub max_error_len: usize,
    pub dispatch: DispatchMode,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            batch_size: 100,
            retry: RetryPolicy::default(),
            max_error_len: MAX_ERROR_LEN,
            dispatch: DispatchMode::Sequential,
        }
    }
}

impl WorkerConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_error_len(mut self, max_error_len: usize) -> Self {
        self.max_error_len = max_error_len;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key/value source. Missing keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64, _>(&lookup, ENV_POLL_INTERVAL_MS)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(size) = parse(&lookup, ENV_BATCH_SIZE)? {
            config.batch_size = size;
        }
        if let Some(max_retry) = parse(&lookup, ENV_MAX_RETRY)? {
            config.retry.max_retry = max_retry;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, ENV_BACKOFF_BASE_MS)? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, ENV_BACKOFF_CAP_MS)? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(len) = parse(&lookup, ENV_ERROR_MAX_LEN)? {
            config.max_error_len = len;
        }
        config.dispatch = match parse::<usize, _>(&lookup, ENV_DISPATCH_LANES)? {
            None | Some(0) => DispatchMode::Sequential,
            Some(lanes) => DispatchMode::TargetLanes(lanes),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(DomainError::validation("poll interval must be positive").into());
        }
        if self.batch_size == 0 {
            return Err(DomainError::validation("batch size must be at least 1").into());
        }
        if self.max_error_len == 0 {
            return Err(DomainError::validation("error length limit must be at least 1").into());
        }
        if self.dispatch == DispatchMode::TargetLanes(0) {
            return Err(DomainError::validation("dispatch lanes must be at least 1").into());
        }
        self.retry.validate()?;
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.retry.max_retry, 8);
        assert_eq!(config.max_error_len, 2000);
        assert_eq!(config.dispatch, DispatchMode::Sequential);
    }

    #[test]
    fn overrides_are_applied() {
        let config = WorkerConfig::from_lookup(lookup(&[
            (ENV_POLL_INTERVAL_MS, "500"),
            (ENV_BATCH_SIZE, " 25 "),
            (ENV_MAX_RETRY, "3"),
            (ENV_BACKOFF_BASE_MS, "200"),
            (ENV_BACKOFF_CAP_MS, "1000"),
            (ENV_ERROR_MAX_LEN, "64"),
            (ENV_DISPATCH_LANES, "4"),
        ]))
        .unwrap();

        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.retry.max_retry, 3);
        assert_eq!(config.retry.backoff(4), Duration::from_millis(1000));
        assert_eq!(config.max_error_len, 64);
        assert_eq!(config.dispatch, DispatchMode::TargetLanes(4));
    }

    #[test]
    fn malformed_value_names_the_key() {
        let err = WorkerConfig::from_lookup(lookup(&[(ENV_BATCH_SIZE, "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: ENV_BATCH_SIZE,
                value: "lots".to_string()
            }
        );
    }

    #[test]
    fn zero_lanes_means_sequential() {
        let config = WorkerConfig::from_lookup(lookup(&[(ENV_DISPATCH_LANES, "0")])).unwrap();
        assert_eq!(config.dispatch, DispatchMode::Sequential);
    }

    #[test]
    fn invalid_combinations_are_rejected() {
        assert!(WorkerConfig::from_lookup(lookup(&[(ENV_BATCH_SIZE, "0")])).is_err());
        assert!(WorkerConfig::from_lookup(lookup(&[(ENV_MAX_RETRY, "0")])).is_err());
        assert!(
            WorkerConfig::from_lookup(lookup(&[
                (ENV_BACKOFF_BASE_MS, "5000"),
                (ENV_BACKOFF_CAP_MS, "1000"),
            ]))
            .is_err()
        );
    }
}
