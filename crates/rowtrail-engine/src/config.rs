//! Configuration from the environment.
//!
//! Every key is optional except the source credentials; invalid values
//! are fatal at startup, before the reader is attached. The binary
//! loads an optional `.env` key-value file into the environment first.

use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

/// Default exclude pattern: system schemas are never audited.
const DEFAULT_EXCLUDE: &str = r"^(pg_catalog|information_schema)\..*";

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_FLUSH_TIMEOUT_SECS: u64 = 30;

/// Startup configuration failures. All of them exit the process
/// before replication starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration key {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Which replication dialect the reader speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFlavor {
    Postgres,
}

impl FromStr for SourceFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(format!("unsupported source flavor {other:?}")),
        }
    }
}

/// Replication source settings.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub flavor: SourceFlavor,
    pub client_id: u32,
    pub slot: String,
    pub publication: String,
    pub include: Option<String>,
    pub exclude: Option<String>,
}

/// Audit-store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub uri: String,
    pub database: String,
    pub events_collection: String,
    pub offsets_collection: String,
}

/// Batching and shutdown settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub timezone: Tz,
    pub flush_timeout: Duration,
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Read configuration from the process environment.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for a missing credential or an unparseable
    /// value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an explicit lookup function.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let addr = var("SOURCE_ADDR").unwrap_or_else(|| "127.0.0.1:5432".into());
        let (host, port) = split_addr("SOURCE_ADDR", &addr)?;

        let flavor: SourceFlavor = parse("SOURCE_FLAVOR", var("SOURCE_FLAVOR"), SourceFlavor::Postgres)?;
        let client_id: u32 = parse("SOURCE_CLIENT_ID", var("SOURCE_CLIENT_ID"), 2222)?;

        let include = var("INCLUDE_REGEX");
        let exclude = var("EXCLUDE_REGEX").or_else(|| Some(DEFAULT_EXCLUDE.to_string()));
        check_regex("INCLUDE_REGEX", include.as_deref())?;
        check_regex("EXCLUDE_REGEX", exclude.as_deref())?;

        let source = SourceConfig {
            host,
            port,
            user: var("SOURCE_USER").unwrap_or_else(|| "postgres".into()),
            password: var("SOURCE_PASS").ok_or(ConfigError::Missing("SOURCE_PASS"))?,
            database: var("SOURCE_DB").unwrap_or_else(|| "postgres".into()),
            flavor,
            client_id,
            slot: var("SOURCE_SLOT").unwrap_or_else(|| format!("rowtrail_{client_id}")),
            publication: var("SOURCE_PUBLICATION").unwrap_or_else(|| "rowtrail".into()),
            include,
            exclude,
        };

        let store = StoreConfig {
            uri: var("STORE_URI").unwrap_or_else(|| "mongodb://127.0.0.1:27017".into()),
            database: var("STORE_DB").unwrap_or_else(|| "audit".into()),
            events_collection: var("STORE_EVENTS_COLL").unwrap_or_else(|| "row_changes".into()),
            offsets_collection: var("STORE_OFFSETS_COLL").unwrap_or_else(|| "log_offsets".into()),
        };

        let batch_size: usize = parse("BATCH_SIZE", var("BATCH_SIZE"), DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "BATCH_SIZE",
                reason: "must be at least 1".into(),
            });
        }
        let timezone: Tz = parse("TZ", var("TZ"), Tz::UTC)?;

        Ok(Self {
            source,
            store,
            pipeline: PipelineConfig {
                batch_size,
                timezone,
                flush_timeout: Duration::from_secs(DEFAULT_FLUSH_TIMEOUT_SECS),
            },
        })
    }

    /// Scheme-qualified source identifier used as the offsets primary
    /// key.
    #[must_use]
    pub fn source_id(&self) -> String {
        match self.source.flavor {
            SourceFlavor::Postgres => {
                format!("postgres://{}:{}", self.source.host, self.source.port)
            }
        }
    }
}

fn split_addr(key: &'static str, addr: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| ConfigError::Invalid {
        key,
        reason: format!("expected host:port, got {addr:?}"),
    })?;
    let port: u16 = port.parse().map_err(|_| ConfigError::Invalid {
        key,
        reason: format!("invalid port in {addr:?}"),
    })?;
    if host.is_empty() {
        return Err(ConfigError::Invalid {
            key,
            reason: format!("empty host in {addr:?}"),
        });
    }
    Ok((host.to_string(), port))
}

fn parse<T>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
            key,
            reason: err.to_string(),
        }),
    }
}

fn check_regex(key: &'static str, pattern: Option<&str>) -> Result<(), ConfigError> {
    if let Some(pattern) = pattern {
        regex::Regex::new(pattern).map_err(|err| ConfigError::Invalid {
            key,
            reason: err.to_string(),
        })?;
    }
    Ok(())
}
