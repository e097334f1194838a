use crate::error::AppError;
use crate::logging::LogFormat;
use crate::market::backoff::{ReconnectPolicy, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_CAP_MS};
use crate::market::candles::DEFAULT_HISTORY_LIMIT;
use crate::market::types::{normalize_symbols, Symbol};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_POLL_FAILURES: u32 = 3;
pub const MIN_POLL_INTERVAL_MS: u64 = 250;
pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;
pub const MIN_CONNECT_TIMEOUT_MS: u64 = 1_000;
pub const MAX_CONNECT_TIMEOUT_MS: u64 = 60_000;
pub const MIN_BACKOFF_MS: u64 = 10;
pub const MAX_BACKOFF_MS: u64 = 600_000;
pub const MIN_POLL_FAILURES: u32 = 1;
pub const MAX_POLL_FAILURES: u32 = 100;
pub const MIN_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 10_000;

const ENV_BASE_URL: &str = "PRICE_FEED_BASE_URL";
const ENV_WS_URL: &str = "PRICE_FEED_WS_URL";
const ENV_AUTH_TOKEN: &str = "PRICE_FEED_AUTH_TOKEN";
const ENV_POLL_INTERVAL_MS: &str = "PRICE_FEED_POLL_INTERVAL_MS";
const ENV_SYMBOLS: &str = "PRICE_FEED_SYMBOLS";
const ENV_LOG_FORMAT: &str = "PRICE_FEED_LOG_FORMAT";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PriceFeedArgs {
    pub base_url: Option<String>,
    pub ws_url: Option<String>,
    pub auth_token: Option<String>,
    pub symbols: Option<Vec<String>>,
    pub poll_interval_ms: Option<u64>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_cap_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub max_consecutive_poll_failures: Option<u32>,
    pub history_limit: Option<usize>,
    pub log_format: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PriceFeedConfig {
    pub base_url: Option<Url>,
    pub ws_url: Option<Url>,
    pub auth_token: Option<String>,
    pub symbols: Vec<Symbol>,
    pub poll_interval_ms: u64,
    pub reconnect_policy: ReconnectPolicy,
    pub connect_timeout_ms: u64,
    pub max_consecutive_poll_failures: u32,
    pub history_limit: usize,
    pub log_format: LogFormat,
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>, AppError> {
    match read_env(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::InvalidArgument(format!("{key} must be a number"))),
        None => Ok(None),
    }
}

fn parse_url(raw: Option<String>, field: &str, schemes: &[&str]) -> Result<Option<Url>, AppError> {
    let Some(raw) = raw.map(|value| value.trim().to_string()) else {
        return Ok(None);
    };
    if raw.is_empty() {
        return Ok(None);
    }

    let url = Url::parse(&raw)
        .map_err(|error| AppError::InvalidArgument(format!("{field} is not a valid url: {error}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(AppError::InvalidArgument(format!(
            "{field} must use one of {schemes:?}"
        )));
    }
    Ok(Some(url))
}

impl PriceFeedArgs {
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            base_url: read_env(ENV_BASE_URL),
            ws_url: read_env(ENV_WS_URL),
            auth_token: read_env(ENV_AUTH_TOKEN),
            symbols: read_env(ENV_SYMBOLS)
                .map(|raw| raw.split(',').map(|entry| entry.to_string()).collect()),
            poll_interval_ms: parse_env_number(ENV_POLL_INTERVAL_MS)?,
            log_format: read_env(ENV_LOG_FORMAT),
            ..Self::default()
        })
    }

    pub fn normalize(self) -> Result<PriceFeedConfig, AppError> {
        let base_url = parse_url(self.base_url, "baseUrl", &["http", "https"])?;
        let ws_url = parse_url(self.ws_url, "wsUrl", &["ws", "wss"])?;
        let auth_token = self
            .auth_token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        let symbols = normalize_symbols(self.symbols.unwrap_or_default());

        let poll_interval_ms = self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&poll_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "pollIntervalMs must be between {MIN_POLL_INTERVAL_MS} and {MAX_POLL_INTERVAL_MS}"
            )));
        }

        let backoff_base_ms = self.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS);
        let backoff_cap_ms = self.backoff_cap_ms.unwrap_or(DEFAULT_BACKOFF_CAP_MS);
        if !(MIN_BACKOFF_MS..=MAX_BACKOFF_MS).contains(&backoff_base_ms)
            || !(MIN_BACKOFF_MS..=MAX_BACKOFF_MS).contains(&backoff_cap_ms)
        {
            return Err(AppError::InvalidArgument(format!(
                "backoff values must be between {MIN_BACKOFF_MS} and {MAX_BACKOFF_MS}"
            )));
        }
        if backoff_cap_ms < backoff_base_ms {
            return Err(AppError::InvalidArgument(
                "backoffCapMs must not be below backoffBaseMs".to_string(),
            ));
        }

        let connect_timeout_ms = self
            .connect_timeout_ms
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        if !(MIN_CONNECT_TIMEOUT_MS..=MAX_CONNECT_TIMEOUT_MS).contains(&connect_timeout_ms) {
            return Err(AppError::InvalidArgument(format!(
                "connectTimeoutMs must be between {MIN_CONNECT_TIMEOUT_MS} and {MAX_CONNECT_TIMEOUT_MS}"
            )));
        }

        let max_consecutive_poll_failures = self
            .max_consecutive_poll_failures
            .unwrap_or(DEFAULT_MAX_POLL_FAILURES);
        if !(MIN_POLL_FAILURES..=MAX_POLL_FAILURES).contains(&max_consecutive_poll_failures) {
            return Err(AppError::InvalidArgument(format!(
                "maxConsecutivePollFailures must be between {MIN_POLL_FAILURES} and {MAX_POLL_FAILURES}"
            )));
        }

        let history_limit = self.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if !(MIN_HISTORY_LIMIT..=MAX_HISTORY_LIMIT).contains(&history_limit) {
            return Err(AppError::InvalidArgument(format!(
                "historyLimit must be between {MIN_HISTORY_LIMIT} and {MAX_HISTORY_LIMIT}"
            )));
        }

        let log_format = match self.log_format {
            Some(raw) => LogFormat::parse(&raw).ok_or_else(|| {
                AppError::InvalidArgument(format!("unknown log format '{raw}'"))
            })?,
            None => LogFormat::default(),
        };

        Ok(PriceFeedConfig {
            base_url,
            ws_url,
            auth_token,
            symbols,
            poll_interval_ms,
            reconnect_policy: ReconnectPolicy::new(backoff_base_ms, backoff_cap_ms),
            connect_timeout_ms,
            max_consecutive_poll_failures,
            history_limit,
            log_format,
        })
    }
}

impl PriceFeedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn require_base_url(&self) -> Result<&Url, AppError> {
        self.base_url
            .as_ref()
            .ok_or(AppError::MissingConfiguration("backend base url"))
    }
}

impl Default for PriceFeedConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            ws_url: None,
            auth_token: None,
            symbols: Vec::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            reconnect_policy: ReconnectPolicy::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_consecutive_poll_failures: DEFAULT_MAX_POLL_FAILURES,
            history_limit: DEFAULT_HISTORY_LIMIT,
            log_format: LogFormat::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_defaults() {
        let config = PriceFeedArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert!(config.base_url.is_none());
        assert!(config.symbols.is_empty());
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.reconnect_policy, ReconnectPolicy::default());
        assert_eq!(config.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
        assert_eq!(
            config.max_consecutive_poll_failures,
            DEFAULT_MAX_POLL_FAILURES
        );
        assert_eq!(config.history_limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn missing_base_url_is_reported_not_rejected() {
        let config = PriceFeedArgs::default()
            .normalize()
            .expect("missing base url is not a normalize error");
        let error = config
            .require_base_url()
            .expect_err("missing base url should be a configuration error");
        assert!(matches!(error, AppError::MissingConfiguration(_)));
    }

    #[test]
    fn validates_url_schemes() {
        let result = PriceFeedArgs {
            base_url: Some("ftp://prices.example.com".to_string()),
            ..PriceFeedArgs::default()
        }
        .normalize();
        assert!(result.is_err());

        let result = PriceFeedArgs {
            base_url: Some("https://prices.example.com".to_string()),
            ws_url: Some("https://prices.example.com/ws".to_string()),
            ..PriceFeedArgs::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn validates_poll_interval_range() {
        let result = PriceFeedArgs {
            poll_interval_ms: Some(10),
            ..PriceFeedArgs::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn validates_backoff_ordering() {
        let result = PriceFeedArgs {
            backoff_base_ms: Some(5_000),
            backoff_cap_ms: Some(1_000),
            ..PriceFeedArgs::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn normalizes_symbol_list() {
        let config = PriceFeedArgs {
            base_url: Some(" https://prices.example.com ".to_string()),
            symbols: Some(vec!["aapl".to_string(), "AAPL".to_string(), " msft".to_string()]),
            log_format: Some("json".to_string()),
            ..PriceFeedArgs::default()
        }
        .normalize()
        .expect("args should be valid");

        let symbols: Vec<&str> = config.symbols.iter().map(Symbol::as_str).collect();
        assert_eq!(symbols, vec!["AAPL", "MSFT"]);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.require_base_url().is_ok());
    }
}
