// src/config.rs

//! Resolves the `STORE_*` environment surface into a single, normalized
//! connection descriptor.
//!
//! Exactly one configuration source populates the descriptor: a combined
//! `STORE_URL` takes precedence; otherwise the discrete `STORE_HOST`,
//! `STORE_PORT`, `STORE_PASSWORD` and `STORE_SSL` variables are read with
//! documented defaults. Malformed input fails fast with a descriptive
//! [`StoreError::Config`] instead of silently defaulting.

use crate::core::StoreError;
use crate::core::errors::StoreResult;
use config::{Config, Environment};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Conventional service name used when no host is configured.
pub const DEFAULT_HOST: &str = "redis";
/// The store's standard port.
pub const DEFAULT_PORT: u16 = 6379;
/// Pool upper bound suited to high fan-out callers.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;
/// Timeout for establishing a TCP (and TLS) connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout applied to each command round-trip on an established connection.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(5);
/// Idle connections unused for longer than this are re-probed on checkout.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Environment prefix for all configuration variables.
const ENV_PREFIX: &str = "STORE";

/// Normalized connection parameters, derived once per process from
/// environment state. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db_index: u32,
    pub use_tls: bool,
    pub max_pool_size: usize,
    pub retry_on_timeout: bool,
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
    pub health_check_interval: Duration,
}

impl ConnectionDescriptor {
    /// Creates a descriptor for an explicit endpoint with default tuning.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            db_index: 0,
            use_tls: false,
            max_pool_size: DEFAULT_MAX_CONNECTIONS,
            retry_on_timeout: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
        }
    }

    /// Resolves a descriptor from the process environment.
    ///
    /// No network side effects; all failures are [`StoreError::Config`].
    pub fn from_env() -> StoreResult<Self> {
        let desc = Self::resolve(RawSettings::gather()?)?;
        debug!(
            host = %desc.host,
            port = desc.port,
            db_index = desc.db_index,
            use_tls = desc.use_tls,
            max_pool_size = desc.max_pool_size,
            "resolved store connection descriptor"
        );
        Ok(desc)
    }

    /// Parses a combined connection URL, e.g.
    /// `redis://:password@host:6379/2` or `rediss://host` for TLS.
    pub fn from_url(raw: &str) -> StoreResult<Self> {
        let url = Url::parse(raw)
            .map_err(|e| StoreError::Config(format!("invalid connection URL: {e}")))?;

        let use_tls = match url.scheme() {
            "redis" => false,
            "rediss" => true,
            other => {
                return Err(StoreError::Config(format!(
                    "unsupported connection URL scheme '{other}' (expected 'redis' or 'rediss')"
                )));
            }
        };

        let host = url.host_str().unwrap_or(DEFAULT_HOST).to_string();
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let password = url
            .password()
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string());

        let db_index = match url.path() {
            "" | "/" => 0,
            path => path.trim_start_matches('/').parse::<u32>().map_err(|_| {
                StoreError::Config(format!(
                    "connection URL path '{path}' is not a numeric database index"
                ))
            })?,
        };

        let mut desc = Self::new(host, port);
        desc.password = password;
        desc.db_index = db_index;
        desc.use_tls = use_tls;
        Ok(desc)
    }

    /// Applies the resolution rules to a gathered set of raw settings.
    fn resolve(raw: RawSettings) -> StoreResult<Self> {
        let mut desc = match raw.url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => Self::from_url(url)?,
            None => {
                let host = raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
                let port = match raw.port {
                    Some(p) => p.parse::<u16>().map_err(|_| {
                        StoreError::Config(format!("{ENV_PREFIX}_PORT '{p}' is not a valid port"))
                    })?,
                    None => DEFAULT_PORT,
                };
                let mut desc = Self::new(host, port);
                desc.password = raw.password.filter(|p| !p.is_empty());
                desc.use_tls = match raw.ssl {
                    Some(s) => parse_bool(&s, "STORE_SSL")?,
                    None => false,
                };
                desc
            }
        };

        // Pool sizing and retry behavior apply regardless of the branch above.
        if let Some(max) = raw.max_connections {
            desc.max_pool_size = max.parse::<usize>().map_err(|_| {
                StoreError::Config(format!(
                    "{ENV_PREFIX}_MAX_CONNECTIONS '{max}' is not a valid pool size"
                ))
            })?;
        }
        if let Some(retry) = raw.retry_on_timeout {
            desc.retry_on_timeout = parse_bool(&retry, "STORE_RETRY_ON_TIMEOUT")?;
        }

        desc.validate()?;
        Ok(desc)
    }

    fn validate(&self) -> StoreResult<()> {
        if self.port == 0 {
            return Err(StoreError::Config("port must be non-zero".to_string()));
        }
        if self.max_pool_size == 0 {
            return Err(StoreError::Config(
                "max pool size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Raw, unparsed environment values gathered through the `config` crate.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawSettings {
    url: Option<String>,
    host: Option<String>,
    port: Option<String>,
    password: Option<String>,
    ssl: Option<String>,
    max_connections: Option<String>,
    retry_on_timeout: Option<String>,
}

impl RawSettings {
    fn gather() -> StoreResult<Self> {
        Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()
            .and_then(|cfg| cfg.try_deserialize::<RawSettings>())
            .map_err(|e| StoreError::Config(format!("failed to read environment: {e}")))
    }
}

/// Case-insensitive "true"/"false" parser for boolean variables.
fn parse_bool(value: &str, name: &str) -> StoreResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(StoreError::Config(format!(
            "{name} '{other}' is not a boolean (expected 'true' or 'false')"
        ))),
    }
}
