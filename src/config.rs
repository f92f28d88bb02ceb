use crate::error::{ProxyError, Result};
use crate::models::{ProbeSettings, ProxyEndpoint, ValidationFilters};
use std::env;

/// Number of retries
pub const DEFAULT_RETRY: u32 = 3;
/// First retry delay in seconds
pub const DEFAULT_RETRY_FIRST_DELAY: u64 = 5;
pub const DEFAULT_GZIP: bool = true;
pub const DEFAULT_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/57.0.2987.133 Safari/537.36";
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 100;
pub const DEFAULT_LISTING_URL: &str = "https://free-proxy-list.net/";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Outbound client configuration
    pub http: HttpClientConfig,
    /// Candidate discovery configuration
    pub discovery: DiscoveryConfig,
    /// Validation filters
    pub validation: ValidationFilters,
    /// Probe endpoints
    pub probe: ProbeSettings,
    /// Logging configuration
    pub log: LogConfig,
}

/// Retry and client settings shared by every named client.
///
/// Read-only to the library except for `proxies`, which the validation pipeline fills in.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Retries per request, applied at both the transport and the application layer
    pub retry: u32,
    /// Added to the exponential part of every backoff delay, in seconds
    pub retry_first_delay: u64,
    /// Accept gzip-compressed responses
    pub gzip_enabled: bool,
    pub user_agent: String,
    /// Route requests through the proxy pool
    pub proxy_enabled: bool,
    /// Whole-request timeout in seconds
    pub request_timeout: u64,
    /// Validated proxies, fastest first
    pub proxies: Vec<ProxyEndpoint>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            retry: DEFAULT_RETRY,
            retry_first_delay: DEFAULT_RETRY_FIRST_DELAY,
            gzip_enabled: DEFAULT_GZIP,
            user_agent: DEFAULT_AGENT.to_string(),
            proxy_enabled: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            proxies: vec![],
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Listing page scraped for candidates
    pub listing_url: String,
    /// Fail setup when fewer than `required` proxies pass validation
    pub require_minimum: bool,
    /// Seconds between re-validation runs (0 = validate once)
    pub refresh_interval: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            listing_url: DEFAULT_LISTING_URL.to_string(),
            require_minimum: false,
            refresh_interval: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let probe_defaults = ProbeSettings::default();
        let filter_defaults = ValidationFilters::default();

        Ok(Config {
            http: HttpClientConfig {
                retry: parse_env("HTTP_RETRY", DEFAULT_RETRY)?,
                retry_first_delay: parse_env("HTTP_RETRY_FIRST_DELAY", DEFAULT_RETRY_FIRST_DELAY)?,
                gzip_enabled: parse_env("HTTP_GZIP", DEFAULT_GZIP)?,
                user_agent: get_env_or("HTTP_USER_AGENT", DEFAULT_AGENT),
                proxy_enabled: parse_env("PROXY_ENABLED", false)?,
                request_timeout: parse_env("HTTP_REQUEST_TIMEOUT", DEFAULT_REQUEST_TIMEOUT)?,
                proxies: parse_proxy_list()?,
            },
            discovery: DiscoveryConfig {
                listing_url: get_env_or("PROXY_LISTING_URL", DEFAULT_LISTING_URL),
                require_minimum: parse_env("PROXY_REQUIRE_MINIMUM", false)?,
                refresh_interval: parse_env("PROXY_REFRESH_INTERVAL", 0)?,
            },
            validation: ValidationFilters {
                non_transparent_only: parse_env(
                    "PROXY_NON_TRANSPARENT_ONLY",
                    filter_defaults.non_transparent_only,
                )?,
                countries: get_env_or("PROXY_COUNTRIES", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                https: parse_https_filter()?,
                required: parse_env("PROXY_REQUIRED", filter_defaults.required)?,
                max_latency_ms: parse_env("PROXY_MAX_LATENCY_MS", filter_defaults.max_latency_ms)?,
                probe_timeout_secs: parse_env(
                    "PROXY_PROBE_TIMEOUT",
                    filter_defaults.probe_timeout_secs,
                )?,
            },
            probe: ProbeSettings {
                echo_url: get_env_or("PROXY_ECHO_URL", &probe_defaults.echo_url),
                echo_selector: get_env_or("PROXY_ECHO_SELECTOR", &probe_defaults.echo_selector),
                liveness_url: get_env_or("PROXY_LIVENESS_URL", &probe_defaults.liveness_url),
                concurrency: parse_env("PROXY_PROBE_CONCURRENCY", probe_defaults.concurrency)?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ProxyError::InvalidConfig(format!("{} has an invalid value: {}", key, raw))),
        _ => Ok(default),
    }
}

fn parse_https_filter() -> Result<Option<bool>> {
    let raw = get_env_or("PROXY_HTTPS", "true");
    match raw.trim().to_lowercase().as_str() {
        "any" | "" => Ok(None),
        "true" | "yes" | "1" => Ok(Some(true)),
        "false" | "no" | "0" => Ok(Some(false)),
        other => Err(ProxyError::InvalidConfig(format!(
            "PROXY_HTTPS must be true, false or any, got: {}",
            other
        ))),
    }
}

fn parse_proxy_list() -> Result<Vec<ProxyEndpoint>> {
    let raw = env::var("PROXY_LIST").unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(vec![]);
    }

    let proxies: Vec<ProxyEndpoint> = serde_json::from_str(raw).map_err(|e| {
        ProxyError::InvalidConfig(format!("PROXY_LIST must be a JSON array of proxies: {}", e))
    })?;

    if let Some(bad) = proxies.iter().find(|p| p.ip.trim().is_empty() || p.port == 0) {
        return Err(ProxyError::InvalidConfig(format!(
            "PROXY_LIST contains an invalid entry: '{}:{}'",
            bad.ip, bad.port
        )));
    }

    Ok(proxies)
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
