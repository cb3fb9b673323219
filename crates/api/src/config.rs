//! Process configuration, read from environment variables.
//!
//! | variable                      | default        |
//! |-------------------------------|----------------|
//! | `EVENTIDE_BIND_ADDR`          | `0.0.0.0:8080` |
//! | `DATABASE_URL`                | unset: in-memory store |
//! | `EVENTIDE_LOG_FORMAT`         | `json`         |
//! | `EVENTIDE_HEARTBEAT_SECS`     | `15`           |
//! | `EVENTIDE_SUBSCRIBER_BUFFER`  | `256`          |
//! | `EVENTIDE_REPLAY_BATCH`       | `500`          |
//! | `EVENTIDE_COMMAND_TIMEOUT_MS` | `5000`         |
//! | `EVENTIDE_SNAPSHOT_EVERY`     | `100` (0 disables) |
//! | `EVENTIDE_RETRY_MAX_ATTEMPTS` | `5`            |
//! | `EVENTIDE_CACHE_TTL_SECS`     | `60`           |
//! | `EVENTIDE_CACHE_TTI_SECS`     | `30`           |
//! | `EVENTIDE_RELAY_POLL_MS`      | `1000`         |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use eventide_observability::LogFormat;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub log_format: LogFormat,
    pub heartbeat_interval: Duration,
    pub subscriber_buffer: usize,
    pub replay_batch_size: usize,
    pub command_timeout: Duration,
    pub snapshot_every: u64,
    pub retry_max_attempts: u32,
    pub cache_ttl: Duration,
    pub cache_tti: Duration,
    pub relay_poll_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            log_format: LogFormat::Json,
            heartbeat_interval: Duration::from_secs(15),
            subscriber_buffer: 256,
            replay_batch_size: 500,
            command_timeout: Duration::from_millis(5000),
            snapshot_every: 100,
            retry_max_attempts: 5,
            cache_ttl: Duration::from_secs(60),
            cache_tti: Duration::from_secs(30),
            relay_poll_interval: Duration::from_millis(1000),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset or blank variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let get = |var: &str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let var = |name: &'static str| (name, get(name));

        Ok(Self {
            bind_addr: parsed(var("EVENTIDE_BIND_ADDR"))?.unwrap_or(d.bind_addr),
            database_url: get("DATABASE_URL"),
            log_format: parsed(var("EVENTIDE_LOG_FORMAT"))?.unwrap_or(d.log_format),
            heartbeat_interval: positive(var("EVENTIDE_HEARTBEAT_SECS"))?
                .map(Duration::from_secs)
                .unwrap_or(d.heartbeat_interval),
            subscriber_buffer: positive(var("EVENTIDE_SUBSCRIBER_BUFFER"))?
                .map(|n| n as usize)
                .unwrap_or(d.subscriber_buffer),
            replay_batch_size: positive(var("EVENTIDE_REPLAY_BATCH"))?
                .map(|n| n as usize)
                .unwrap_or(d.replay_batch_size),
            command_timeout: positive(var("EVENTIDE_COMMAND_TIMEOUT_MS"))?
                .map(Duration::from_millis)
                .unwrap_or(d.command_timeout),
            snapshot_every: parsed(var("EVENTIDE_SNAPSHOT_EVERY"))?.unwrap_or(d.snapshot_every),
            retry_max_attempts: parsed(var("EVENTIDE_RETRY_MAX_ATTEMPTS"))?
                .filter(|n: &u32| *n > 0)
                .unwrap_or(d.retry_max_attempts),
            cache_ttl: positive(var("EVENTIDE_CACHE_TTL_SECS"))?
                .map(Duration::from_secs)
                .unwrap_or(d.cache_ttl),
            cache_tti: positive(var("EVENTIDE_CACHE_TTI_SECS"))?
                .map(Duration::from_secs)
                .unwrap_or(d.cache_tti),
            relay_poll_interval: positive(var("EVENTIDE_RELAY_POLL_MS"))?
                .map(Duration::from_millis)
                .unwrap_or(d.relay_poll_interval),
        })
    }
}

fn parsed<T>((var, value): (&'static str, Option<String>)) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.parse::<T>().map_err(|e| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value: v,
            })
        })
        .transpose()
}

fn positive(var: (&'static str, Option<String>)) -> Result<Option<u64>, ConfigError> {
    let name = var.0;
    match parsed::<u64>(var)? {
        Some(0) => Err(ConfigError::Invalid {
            var: name,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn unset_variables_keep_defaults() {
        assert_eq!(config(&[]).unwrap(), AppConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let cfg = config(&[
            ("EVENTIDE_BIND_ADDR", "127.0.0.1:9000"),
            ("DATABASE_URL", "postgres://localhost/eventide"),
            ("EVENTIDE_LOG_FORMAT", "pretty"),
            ("EVENTIDE_HEARTBEAT_SECS", "5"),
            ("EVENTIDE_SUBSCRIBER_BUFFER", "64"),
            ("EVENTIDE_REPLAY_BATCH", "50"),
            ("EVENTIDE_COMMAND_TIMEOUT_MS", "250"),
            ("EVENTIDE_SNAPSHOT_EVERY", "0"),
            ("EVENTIDE_RETRY_MAX_ATTEMPTS", "3"),
            ("EVENTIDE_CACHE_TTL_SECS", "10"),
            ("EVENTIDE_CACHE_TTI_SECS", "2"),
            ("EVENTIDE_RELAY_POLL_MS", "100"),
        ])
        .unwrap();

        assert_eq!(cfg.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/eventide"));
        assert_eq!(cfg.log_format, LogFormat::Pretty);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.subscriber_buffer, 64);
        assert_eq!(cfg.replay_batch_size, 50);
        assert_eq!(cfg.command_timeout, Duration::from_millis(250));
        assert_eq!(cfg.snapshot_every, 0);
        assert_eq!(cfg.retry_max_attempts, 3);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(10));
        assert_eq!(cfg.cache_tti, Duration::from_secs(2));
        assert_eq!(cfg.relay_poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(matches!(
            config(&[("EVENTIDE_HEARTBEAT_SECS", "soon")]),
            Err(ConfigError::Invalid { var: "EVENTIDE_HEARTBEAT_SECS", .. })
        ));
        assert!(matches!(
            config(&[("EVENTIDE_REPLAY_BATCH", "0")]),
            Err(ConfigError::Invalid { var: "EVENTIDE_REPLAY_BATCH", .. })
        ));
        assert!(matches!(
            config(&[("EVENTIDE_LOG_FORMAT", "xml")]),
            Err(ConfigError::Invalid { var: "EVENTIDE_LOG_FORMAT", .. })
        ));
    }
}
