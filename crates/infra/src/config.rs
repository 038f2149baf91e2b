//! Runtime configuration from environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use marketflow_events::{BackoffStrategy, RetryPolicy};

use crate::sweeper::SweeperConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid value for {key}: `{value}` ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub bind_addr: String,
    pub use_persistent_stores: bool,
    /// Present whenever `use_persistent_stores` is set.
    pub database_url: Option<String>,
    pub retry: RetryPolicy,
    pub handler_timeout: Duration,
    pub sweeper: SweeperConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            use_persistent_stores: false,
            database_url: None,
            retry: RetryPolicy::default(),
            handler_timeout: Duration::from_millis(10_000),
            sweeper: SweeperConfig::default(),
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset and blank keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let use_persistent_stores = match get("USE_PERSISTENT_STORES") {
            Some(raw) => parse_bool("USE_PERSISTENT_STORES", &raw)?,
            None => false,
        };
        let database_url = get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let max_retries: u32 = parse_or(&get, "BUS_MAX_RETRIES", 5)?;
        if max_retries == 0 {
            return Err(ConfigError::Invalid {
                key: "BUS_MAX_RETRIES",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let strategy = match get("BUS_RETRY_STRATEGY") {
            Some(raw) => raw
                .parse::<BackoffStrategy>()
                .map_err(|reason| ConfigError::Invalid {
                    key: "BUS_RETRY_STRATEGY",
                    value: raw.clone(),
                    reason,
                })?,
            None => BackoffStrategy::Fixed,
        };

        let retry = RetryPolicy {
            default_max_retries: max_retries,
            base_delay: Duration::from_secs(parse_or(&get, "BUS_RETRY_BASE_SECS", 300)?),
            max_delay: Duration::from_secs(parse_or(&get, "BUS_RETRY_MAX_SECS", 3600)?),
            strategy,
        };

        let sweeper = SweeperConfig {
            poll_interval: Duration::from_secs(
                parse_or::<u64, _>(&get, "BUS_SWEEP_INTERVAL_SECS", 30)?.max(1),
            ),
            batch_size: parse_or(&get, "BUS_SWEEP_BATCH", 100)?,
            max_concurrent: parse_or::<usize, _>(&get, "BUS_SWEEP_CONCURRENCY", 4)?.max(1),
            orphan_grace: Duration::from_secs(parse_or(&get, "BUS_ORPHAN_GRACE_SECS", 120)?),
            processing_lease: Duration::from_secs(parse_or(
                &get,
                "BUS_PROCESSING_LEASE_SECS",
                600,
            )?),
            ..defaults.sweeper
        };

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            use_persistent_stores,
            database_url,
            retry,
            handler_timeout: Duration::from_millis(parse_or(
                &get,
                "BUS_HANDLER_TIMEOUT_MS",
                10_000,
            )?),
            sweeper,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<BusConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BusConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = config(&[]).unwrap();

        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert!(!cfg.use_persistent_stores);
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert_eq!(cfg.handler_timeout, Duration::from_secs(10));
        assert_eq!(cfg.sweeper.poll_interval, Duration::from_secs(30));
        assert_eq!(cfg.sweeper.orphan_grace, Duration::from_secs(120));
        assert_eq!(cfg.sweeper.processing_lease, Duration::from_secs(600));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config(&[
            ("BUS_MAX_RETRIES", "2"),
            ("BUS_RETRY_STRATEGY", "exponential"),
            ("BUS_RETRY_BASE_SECS", "10"),
            ("BUS_SWEEP_CONCURRENCY", "0"),
            ("BUS_PROCESSING_LEASE_SECS", "900"),
        ])
        .unwrap();

        assert_eq!(cfg.sweeper.processing_lease, Duration::from_secs(15 * 60));
        assert_eq!(cfg.retry.default_max_retries, 2);
        assert_eq!(cfg.retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(cfg.retry.base_delay, Duration::from_secs(10));
        assert_eq!(cfg.sweeper.max_concurrent, 1);
    }

    #[test]
    fn persistent_mode_needs_a_database_url() {
        assert_eq!(
            config(&[("USE_PERSISTENT_STORES", "true")]).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );

        let cfg = config(&[
            ("USE_PERSISTENT_STORES", "1"),
            ("DATABASE_URL", "postgres://localhost/marketflow"),
        ])
        .unwrap();
        assert!(cfg.use_persistent_stores);
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(matches!(
            config(&[("BUS_MAX_RETRIES", "five")]),
            Err(ConfigError::Invalid { key: "BUS_MAX_RETRIES", .. })
        ));
        assert!(matches!(
            config(&[("BUS_RETRY_STRATEGY", "random")]),
            Err(ConfigError::Invalid { key: "BUS_RETRY_STRATEGY", .. })
        ));
        assert!(matches!(
            config(&[("BUS_MAX_RETRIES", "0")]),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
