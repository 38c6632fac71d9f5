//! Projection engine configuration.
//!
//! Every projection runs with a [`ProjectionConfig`]. Deployments set the
//! defaults once and override single options per projection name through
//! [`ProjectionsConfig::customizations`].

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::workers::RestartPolicy;

/// Environment variable prefix read by [`ProjectionsConfig::from_env`].
pub const ENV_PREFIX: &str = "FORGEIAM_PROJECTIONS_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Durations are (de)serialized as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}

/// Options of one projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Scheduler tick.
    #[serde(with = "duration_ms")]
    pub requeue_every: Duration,
    /// Backoff between retries of a partially failed batch.
    #[serde(with = "duration_ms")]
    pub retry_failed_after: Duration,
    /// Retries per `process` call after the first attempt.
    pub max_retries: u32,
    /// Failures after which an event is skipped for good.
    pub max_failure_count: u32,
    /// Instances per scheduler batch (one lock per batch).
    pub concurrent_instances: usize,
    /// Scheduler batches processed at the same time.
    pub batch_concurrency: usize,
    /// Events fetched per trigger round.
    pub bulk_limit: u64,
    /// Lookback for active instances; twice `requeue_every` when unset.
    #[serde(with = "duration_ms::option")]
    pub active_instance_window: Option<Duration>,
    /// Enable real-time intake from the event bus.
    pub subscribe: bool,
    /// Lease duration for scheduler locks; `requeue_every` when unset.
    #[serde(with = "duration_ms::option")]
    pub lock_duration: Option<Duration>,
    /// Restart policy of the subscription task.
    pub restart: RestartPolicy,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            requeue_every: Duration::from_secs(60),
            retry_failed_after: Duration::from_secs(1),
            max_retries: 5,
            max_failure_count: 5,
            concurrent_instances: 1,
            batch_concurrency: 4,
            bulk_limit: 200,
            active_instance_window: None,
            subscribe: true,
            lock_duration: None,
            restart: RestartPolicy::default(),
        }
    }
}

impl ProjectionConfig {
    pub fn active_instance_window(&self) -> Duration {
        self.active_instance_window
            .unwrap_or(self.requeue_every * 2)
    }

    pub fn lock_duration(&self) -> Duration {
        self.lock_duration.unwrap_or(self.requeue_every)
    }

    pub fn with_requeue_every(mut self, every: Duration) -> Self {
        self.requeue_every = every;
        self
    }

    pub fn with_retry_failed_after(mut self, after: Duration) -> Self {
        self.retry_failed_after = after;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_max_failure_count(mut self, max: u32) -> Self {
        self.max_failure_count = max;
        self
    }

    pub fn with_concurrent_instances(mut self, n: usize) -> Self {
        self.concurrent_instances = n;
        self
    }

    pub fn with_bulk_limit(mut self, limit: u64) -> Self {
        self.bulk_limit = limit;
        self
    }

    pub fn with_subscribe(mut self, subscribe: bool) -> Self {
        self.subscribe = subscribe;
        self
    }

    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = Some(duration);
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Reject values the handler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, value: String, reason: &str| ConfigError::Invalid {
            key: key.to_string(),
            value,
            reason: reason.to_string(),
        };
        if self.bulk_limit == 0 {
            return Err(invalid("bulk_limit", "0".into(), "must be positive"));
        }
        if self.concurrent_instances == 0 {
            return Err(invalid("concurrent_instances", "0".into(), "must be positive"));
        }
        if self.batch_concurrency == 0 {
            return Err(invalid("batch_concurrency", "0".into(), "must be positive"));
        }
        if self.requeue_every.is_zero() {
            return Err(invalid("requeue_every", "0".into(), "must be positive"));
        }
        Ok(())
    }
}

/// Per-projection overrides. Unset options fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionOverride {
    #[serde(with = "duration_ms::option")]
    pub requeue_every: Option<Duration>,
    #[serde(with = "duration_ms::option")]
    pub retry_failed_after: Option<Duration>,
    pub max_retries: Option<u32>,
    pub max_failure_count: Option<u32>,
    pub concurrent_instances: Option<usize>,
    pub batch_concurrency: Option<usize>,
    pub bulk_limit: Option<u64>,
    #[serde(with = "duration_ms::option")]
    pub active_instance_window: Option<Duration>,
    pub subscribe: Option<bool>,
    #[serde(with = "duration_ms::option")]
    pub lock_duration: Option<Duration>,
}

/// Defaults plus per-projection overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionsConfig {
    pub defaults: ProjectionConfig,
    pub customizations: HashMap<String, ProjectionOverride>,
}

impl ProjectionsConfig {
    pub fn for_projection(&self, name: &str) -> ProjectionConfig {
        let mut config = self.defaults.clone();
        let Some(custom) = self.customizations.get(name) else {
            return config;
        };
        if let Some(v) = custom.requeue_every {
            config.requeue_every = v;
        }
        if let Some(v) = custom.retry_failed_after {
            config.retry_failed_after = v;
        }
        if let Some(v) = custom.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = custom.max_failure_count {
            config.max_failure_count = v;
        }
        if let Some(v) = custom.concurrent_instances {
            config.concurrent_instances = v;
        }
        if let Some(v) = custom.batch_concurrency {
            config.batch_concurrency = v;
        }
        if let Some(v) = custom.bulk_limit {
            config.bulk_limit = v;
        }
        if custom.active_instance_window.is_some() {
            config.active_instance_window = custom.active_instance_window;
        }
        if let Some(v) = custom.subscribe {
            config.subscribe = v;
        }
        if custom.lock_duration.is_some() {
            config.lock_duration = custom.lock_duration;
        }
        config
    }

    /// Read `FORGEIAM_PROJECTIONS_*` from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values are logged and ignored.
    ///
    /// Recognized keys (prefix omitted): `REQUEUE_EVERY_MS`,
    /// `RETRY_FAILED_AFTER_MS`, `MAX_RETRIES`, `MAX_FAILURE_COUNT`,
    /// `CONCURRENT_INSTANCES`, `BATCH_CONCURRENCY`, `BULK_LIMIT`,
    /// `ACTIVE_INSTANCE_WINDOW_MS`, `SUBSCRIBE`, `LOCK_DURATION_MS`,
    /// `CUSTOMIZATIONS` (JSON object of overrides keyed by projection name).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let d = &mut config.defaults;

        if let Some(ms) = read::<u64>(&lookup, "REQUEUE_EVERY_MS") {
            d.requeue_every = Duration::from_millis(ms);
        }
        if let Some(ms) = read::<u64>(&lookup, "RETRY_FAILED_AFTER_MS") {
            d.retry_failed_after = Duration::from_millis(ms);
        }
        if let Some(v) = read(&lookup, "MAX_RETRIES") {
            d.max_retries = v;
        }
        if let Some(v) = read(&lookup, "MAX_FAILURE_COUNT") {
            d.max_failure_count = v;
        }
        if let Some(v) = read(&lookup, "CONCURRENT_INSTANCES") {
            d.concurrent_instances = v;
        }
        if let Some(v) = read(&lookup, "BATCH_CONCURRENCY") {
            d.batch_concurrency = v;
        }
        if let Some(v) = read(&lookup, "BULK_LIMIT") {
            d.bulk_limit = v;
        }
        if let Some(ms) = read::<u64>(&lookup, "ACTIVE_INSTANCE_WINDOW_MS") {
            d.active_instance_window = Some(Duration::from_millis(ms));
        }
        if let Some(v) = read(&lookup, "SUBSCRIBE") {
            d.subscribe = v;
        }
        if let Some(ms) = read::<u64>(&lookup, "LOCK_DURATION_MS") {
            d.lock_duration = Some(Duration::from_millis(ms));
        }

        let key = format!("{ENV_PREFIX}CUSTOMIZATIONS");
        if let Some(raw) = lookup(&key) {
            match serde_json::from_str(&raw) {
                Ok(customizations) => config.customizations = customizations,
                Err(err) => warn!(key = %key, error = %err, "ignoring invalid projection customizations"),
            }
        }

        config
    }
}

fn read<T>(lookup: &impl Fn(&str) -> Option<String>, suffix: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{ENV_PREFIX}{suffix}");
    let raw = lookup(&key)?;
    match parse(&key, &raw) {
        Ok(v) => Some(v),
        Err(err) => {
            warn!(error = %err, "ignoring invalid configuration value, using default");
            None
        }
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn derived_durations_follow_requeue_interval() {
        let config = ProjectionConfig::default().with_requeue_every(Duration::from_secs(10));
        assert_eq!(config.active_instance_window(), Duration::from_secs(20));
        assert_eq!(config.lock_duration(), Duration::from_secs(10));
    }

    #[test]
    fn reads_defaults_from_environment() {
        let config = ProjectionsConfig::from_lookup(env(&[
            ("REQUEUE_EVERY_MS", "1500"),
            ("BULK_LIMIT", "50"),
            ("SUBSCRIBE", "false"),
        ]));
        assert_eq!(config.defaults.requeue_every, Duration::from_millis(1500));
        assert_eq!(config.defaults.bulk_limit, 50);
        assert!(!config.defaults.subscribe);
        assert_eq!(config.defaults.max_retries, ProjectionConfig::default().max_retries);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = ProjectionsConfig::from_lookup(env(&[("MAX_RETRIES", "many")]));
        assert_eq!(config.defaults.max_retries, 5);
    }

    #[test]
    fn customizations_override_single_options() {
        let config = ProjectionsConfig::from_lookup(env(&[
            ("BULK_LIMIT", "50"),
            (
                "CUSTOMIZATIONS",
                r#"{"projections.users": {"bulk_limit": 10, "requeue_every": 2000}}"#,
            ),
        ]));

        let users = config.for_projection("projections.users");
        assert_eq!(users.bulk_limit, 10);
        assert_eq!(users.requeue_every, Duration::from_secs(2));
        assert_eq!(users.active_instance_window(), Duration::from_secs(4));

        let orgs = config.for_projection("projections.orgs");
        assert_eq!(orgs.bulk_limit, 50);
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert!(ProjectionConfig::default().validate().is_ok());
        assert!(ProjectionConfig::default().with_bulk_limit(0).validate().is_err());
        assert!(
            ProjectionConfig::default()
                .with_concurrent_instances(0)
                .validate()
                .is_err()
        );
    }
}
