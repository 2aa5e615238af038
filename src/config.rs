//! Process configuration read from the environment.

use crate::gate::{ConcurrencyConfig, KeySource, RateConfig, ThrottleConfig};
use crate::route::{RouteConfigError, RouteTable, RouteTableSpec, UpstreamUrls};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {0} is required")]
    Missing(&'static str),
    #[error("environment variable {var} has invalid value `{value}`")]
    Invalid { var: &'static str, value: String },
}

/// Retry schedule for upstream calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(3000),
            max_delay: Duration::from_millis(20_000),
        }
    }
}

/// Partition key per gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySources {
    pub throttle: KeySource,
    pub concurrency: KeySource,
    pub rate: KeySource,
}

impl Default for KeySources {
    fn default() -> Self {
        Self { throttle: KeySource::Address, concurrency: KeySource::Address, rate: KeySource::Identity }
    }
}

#[derive(Clone)]
pub struct GatewayConfig {
    pub port: u16,
    /// Echoed in the `X-Gateway-Instance` response header.
    pub instance_name: String,
    pub jwt_secret: String,
    pub redis_url: Option<String>,
    pub upstreams: UpstreamUrls,
    /// JSON route table replacing the built-in one.
    pub routes_file: Option<PathBuf>,
    pub trust_forwarded_for: bool,
    pub throttle: ThrottleConfig,
    pub concurrency: ConcurrencyConfig,
    pub rate: RateConfig,
    pub key_sources: KeySources,
    pub retry: RetrySettings,
    pub upstream_timeout: Duration,
    pub max_body_bytes: usize,
    pub max_user_data_bytes: usize,
    pub header_read_timeout: Duration,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("port", &self.port)
            .field("instance_name", &self.instance_name)
            .field("jwt_secret", &"<redacted>")
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<set>"))
            .field("upstreams", &self.upstreams)
            .field("routes_file", &self.routes_file)
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .field("throttle", &self.throttle)
            .field("concurrency", &self.concurrency)
            .field("rate", &self.rate)
            .field("key_sources", &self.key_sources)
            .field("retry", &self.retry)
            .field("upstream_timeout", &self.upstream_timeout)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("max_user_data_bytes", &self.max_user_data_bytes)
            .field("header_read_timeout", &self.header_read_timeout)
            .finish()
    }
}

impl GatewayConfig {
    /// Defaults for everything except the token secret.
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        Self {
            port: 8083,
            instance_name: "tixgate".into(),
            jwt_secret: jwt_secret.into(),
            redis_url: None,
            upstreams: UpstreamUrls::default(),
            routes_file: None,
            trust_forwarded_for: false,
            throttle: ThrottleConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            rate: RateConfig::default(),
            key_sources: KeySources::default(),
            retry: RetrySettings::default(),
            upstream_timeout: Duration::from_millis(10_000),
            max_body_bytes: 10 * 1024 * 1024,
            max_user_data_bytes: 4096,
            header_read_timeout: Duration::from_millis(10_000),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; `lookup` returns `None` for unset names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let secret = env.string("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        let mut config = Self::new(secret);

        config.port = env.parse("PORT")?.unwrap_or(config.port);
        if let Some(name) = env.string("INSTANCE_NAME") {
            config.instance_name = name;
        }
        config.redis_url = env.string("REDIS_URL");
        config.routes_file = env.string("GATEWAY_ROUTES").map(PathBuf::from);
        config.trust_forwarded_for = env.flag("TRUST_FORWARDED_FOR")?.unwrap_or(false);

        let urls = &mut config.upstreams;
        for (var, slot) in [
            ("AUTH_SERVICE_URL", &mut urls.auth),
            ("USER_SERVICE_URL", &mut urls.user),
            ("EVENT_SERVICE_URL", &mut urls.event),
            ("TICKET_SERVICE_URL", &mut urls.ticket),
            ("RESERVATION_SERVICE_URL", &mut urls.reservation),
            ("VENDOR_SERVICE_URL", &mut urls.vendor),
        ] {
            if let Some(url) = env.string(var) {
                *slot = url;
            }
        }

        let t = &mut config.throttle;
        t.min_interval = env.millis("THROTTLE_MIN_INTERVAL_MS")?.unwrap_or(t.min_interval);
        t.window = env.millis("THROTTLE_WINDOW_MS")?.unwrap_or(t.window);

        let c = &mut config.concurrency;
        c.max_concurrent = env.parse("CONCURRENCY_MAX")?.unwrap_or(c.max_concurrent);
        c.ttl = env.millis("CONCURRENCY_TTL_MS")?.unwrap_or(c.ttl);

        let r = &mut config.rate;
        r.window = env.millis("RATE_WINDOW_MS")?.unwrap_or(r.window);
        r.max_requests = env.parse("RATE_MAX_REQUESTS")?.unwrap_or(r.max_requests);

        let retry = &mut config.retry;
        retry.max_retries = env.parse("RETRY_MAX_RETRIES")?.unwrap_or(retry.max_retries);
        retry.initial_delay = env.millis("RETRY_INITIAL_DELAY_MS")?.unwrap_or(retry.initial_delay);
        retry.max_delay = env.millis("RETRY_MAX_DELAY_MS")?.unwrap_or(retry.max_delay);

        config.upstream_timeout = env.millis("UPSTREAM_TIMEOUT_MS")?.unwrap_or(config.upstream_timeout);
        config.max_body_bytes = env.parse("MAX_BODY_BYTES")?.unwrap_or(config.max_body_bytes);
        config.max_user_data_bytes = env.parse("MAX_USER_DATA_BYTES")?.unwrap_or(config.max_user_data_bytes);
        config.header_read_timeout =
            env.millis("HEADER_READ_TIMEOUT_MS")?.unwrap_or(config.header_read_timeout);

        if config.rate.max_requests == 0 {
            return Err(ConfigError::Invalid { var: "RATE_MAX_REQUESTS", value: "0".into() });
        }
        if config.concurrency.max_concurrent == 0 {
            return Err(ConfigError::Invalid { var: "CONCURRENCY_MAX", value: "0".into() });
        }
        // The throttle timestamp must outlive the interval it enforces.
        if config.throttle.min_interval > config.throttle.window {
            return Err(ConfigError::Invalid {
                var: "THROTTLE_MIN_INTERVAL_MS",
                value: format!(
                    "{} (exceeds THROTTLE_WINDOW_MS {})",
                    config.throttle.min_interval.as_millis(),
                    config.throttle.window.as_millis()
                ),
            });
        }
        Ok(config)
    }

    /// The configured route table: the JSON file when set, else the built-in one.
    pub fn route_table(&self) -> Result<RouteTable, RouteConfigError> {
        match &self.routes_file {
            Some(path) => RouteTableSpec::from_json_file(path)?.try_into(),
            None => RouteTable::builtin(&self.upstreams),
        }
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, var: &'static str) -> Result<Option<T>, ConfigError> {
        match self.string(var) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| ConfigError::Invalid { var, value: raw }),
        }
    }

    fn millis(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(var)?.map(Duration::from_millis))
    }

    fn flag(&self, var: &'static str) -> Result<Option<bool>, ConfigError> {
        match self.string(var) {
            None => Ok(None),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(ConfigError::Invalid { var, value: raw }),
            },
        }
    }
}
