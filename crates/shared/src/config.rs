//! Process configuration
//!
//! All settings come from the environment (optionally seeded from a `.env`
//! file by the binary before `Config::from_env` is called).

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_RECHARGE_API_URL: &str = "https://api.rechargeapps.com";

/// Remote ledger calls are abandoned after this long by default.
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Settings for the remote subscription-billing service
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub base_url: String,
    pub access_token: String,
    pub timeout: Duration,
    /// Offset (in whole hours) in which the ledger's naive timestamps are expressed
    pub utc_offset_hours: i8,
}

/// Settings for the sync worker pool and the notification dispatcher
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub notification_max_attempts: u32,
    pub notification_webhook_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub ledger: LedgerConfig,
    pub worker: WorkerConfig,
    /// Alternate product used when a switch request names no target
    pub alt_products: HashMap<i64, i64>,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("DATABASE_URL")?;
        let access_token = required("RECHARGE_ACCESS_TOKEN")?;
        let base_url = std::env::var("RECHARGE_API_URL")
            .unwrap_or_else(|_| DEFAULT_RECHARGE_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let ledger = LedgerConfig {
            base_url,
            access_token,
            timeout: Duration::from_secs(parsed(
                "REMOTE_TIMEOUT_SECS",
                DEFAULT_REMOTE_TIMEOUT_SECS,
            )?),
            utc_offset_hours: parsed("LEDGER_UTC_OFFSET_HOURS", 0i8)?,
        };

        let pool_size: usize = parsed("WORKER_POOL_SIZE", 4)?;
        if pool_size == 0 {
            return Err(ConfigError::Invalid {
                name: "WORKER_POOL_SIZE",
                value: "0".to_string(),
            });
        }

        let worker = WorkerConfig {
            pool_size,
            poll_interval: Duration::from_millis(parsed("QUEUE_POLL_INTERVAL_MS", 1000)?),
            lease: Duration::from_secs(parsed("QUEUE_LEASE_SECS", 300)?),
            notification_max_attempts: parsed("NOTIFICATION_MAX_ATTEMPTS", 5)?,
            notification_webhook_url: std::env::var("NOTIFICATION_WEBHOOK_URL")
                .ok()
                .filter(|url| !url.is_empty()),
        };

        let alt_products = match std::env::var("ALT_PRODUCTS") {
            Ok(raw) => parse_alt_products(&raw)?,
            Err(_) => HashMap::new(),
        };

        let log_format = match std::env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            database_url,
            ledger,
            worker,
            alt_products,
            log_format,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Parse `from:to,from:to` pairs
pub fn parse_alt_products(raw: &str) -> Result<HashMap<i64, i64>, ConfigError> {
    let mut map = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let invalid = || ConfigError::Invalid {
            name: "ALT_PRODUCTS",
            value: pair.to_string(),
        };
        let (from, to) = pair.split_once(':').ok_or_else(invalid)?;
        let from: i64 = from.trim().parse().map_err(|_| invalid())?;
        let to: i64 = to.trim().parse().map_err(|_| invalid())?;
        map.insert(from, to);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "RECHARGE_ACCESS_TOKEN",
        "RECHARGE_API_URL",
        "REMOTE_TIMEOUT_SECS",
        "WORKER_POOL_SIZE",
        "ALT_PRODUCTS",
        "LOG_FORMAT",
        "NOTIFICATION_WEBHOOK_URL",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_applied() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/subsync");
        std::env::set_var("RECHARGE_ACCESS_TOKEN", "token");

        let config = Config::from_env().unwrap();
        assert_eq!(config.ledger.base_url, DEFAULT_RECHARGE_API_URL);
        assert_eq!(config.ledger.timeout, Duration::from_secs(80));
        assert_eq!(config.worker.pool_size, 4);
        assert!(config.worker.notification_webhook_url.is_none());
        assert!(config.alt_products.is_empty());
        assert_eq!(config.log_format, LogFormat::Pretty);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_token_rejected() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/subsync");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err, ConfigError::Missing("RECHARGE_ACCESS_TOKEN"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_zero_pool_size_rejected() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/subsync");
        std::env::set_var("RECHARGE_ACCESS_TOKEN", "token");
        std::env::set_var("WORKER_POOL_SIZE", "0");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "WORKER_POOL_SIZE",
                ..
            })
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_overrides_and_trailing_slash() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/subsync");
        std::env::set_var("RECHARGE_ACCESS_TOKEN", "token");
        std::env::set_var("RECHARGE_API_URL", "http://127.0.0.1:9000/");
        std::env::set_var("REMOTE_TIMEOUT_SECS", "5");
        std::env::set_var("ALT_PRODUCTS", "10:20, 11:21");
        std::env::set_var("LOG_FORMAT", "json");

        let config = Config::from_env().unwrap();
        assert_eq!(config.ledger.base_url, "http://127.0.0.1:9000");
        assert_eq!(config.ledger.timeout, Duration::from_secs(5));
        assert_eq!(config.alt_products.get(&10), Some(&20));
        assert_eq!(config.alt_products.get(&11), Some(&21));
        assert_eq!(config.log_format, LogFormat::Json);
        clear_env();
    }

    #[test]
    fn test_parse_alt_products_rejects_garbage() {
        assert!(parse_alt_products("10-20").is_err());
        assert!(parse_alt_products("a:1").is_err());
        assert!(parse_alt_products("").unwrap().is_empty());
    }
}
