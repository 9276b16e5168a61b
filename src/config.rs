// src/config.rs
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";
pub const DEFAULT_FEED_ADDR: &str = "127.0.0.1:3500";
const DEFAULT_API_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

pub const ENV_API_BASE_URL: &str = "GYM_API_BASE_URL";
pub const ENV_API_TIMEOUT: &str = "GYM_API_TIMEOUT_SECS";
pub const ENV_READER_URL: &str = "CARD_READER_WS_URL";
pub const ENV_READER_CONNECT_TIMEOUT: &str = "CARD_READER_CONNECT_TIMEOUT_SECS";
pub const ENV_FEED_ADDR: &str = "CARD_FEED_ADDR";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub url: String,
    pub connect_timeout: Duration,
}

impl ReaderConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    reader: Option<ReaderConfig>,
    pub feed_addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup(ENV_API_BASE_URL)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

        let api_timeout = parse_secs(&lookup, ENV_API_TIMEOUT, DEFAULT_API_TIMEOUT_SECS)?;
        let connect_timeout = parse_secs(
            &lookup,
            ENV_READER_CONNECT_TIMEOUT,
            DEFAULT_CONNECT_TIMEOUT_SECS,
        )?;

        // The reader URL has no fallback; it is only checked when a session asks for it
        let reader = lookup(ENV_READER_URL)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|url| ReaderConfig {
                url,
                connect_timeout,
            });

        let feed_raw = lookup(ENV_FEED_ADDR).unwrap_or_else(|| DEFAULT_FEED_ADDR.to_string());
        let feed_addr = feed_raw.parse().map_err(|_| ConfigError::Invalid {
            var: ENV_FEED_ADDR,
            value: feed_raw.clone(),
        })?;

        Ok(Self {
            api: ApiConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                timeout: api_timeout,
            },
            reader,
            feed_addr,
        })
    }

    pub fn reader(&self) -> Result<&ReaderConfig, ConfigError> {
        self.reader
            .as_ref()
            .ok_or(ConfigError::Missing(ENV_READER_URL))
    }
}

fn parse_secs<F>(lookup: &F, var: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(Duration::from_secs(default)),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .ok_or(ConfigError::Invalid { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_vars(vars(&[])).unwrap();
        assert_eq!(config.api.base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.api.timeout, Duration::from_secs(10));
        assert_eq!(config.feed_addr, "127.0.0.1:3500".parse().unwrap());
    }

    #[test]
    fn missing_reader_url_is_a_config_error() {
        let config = Config::from_vars(vars(&[(ENV_READER_URL, "  ")])).unwrap();
        assert!(matches!(
            config.reader(),
            Err(ConfigError::Missing(ENV_READER_URL))
        ));
    }

    #[test]
    fn reader_url_and_timeouts_are_read() {
        let config = Config::from_vars(vars(&[
            (ENV_READER_URL, "ws://127.0.0.1:9000"),
            (ENV_READER_CONNECT_TIMEOUT, "2"),
            (ENV_API_BASE_URL, "http://gym.local/api/"),
        ]))
        .unwrap();

        let reader = config.reader().unwrap();
        assert_eq!(reader.url, "ws://127.0.0.1:9000");
        assert_eq!(reader.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.api.base_url, "http://gym.local/api");
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = Config::from_vars(vars(&[(ENV_API_TIMEOUT, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: ENV_API_TIMEOUT, .. }));

        let err = Config::from_vars(vars(&[(ENV_FEED_ADDR, "nowhere")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: ENV_FEED_ADDR, .. }));
    }
}
