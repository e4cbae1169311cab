// ABOUTME: Server configuration read from SANDCHEST_* environment variables
// ABOUTME: Typed fields with defaults; malformed values fail startup with a ConfigError

use sandchest_api::{ApiKeys, RateLimits};
use std::env;
use std::net::IpAddr;
use std::num::ParseIntError;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid port number: {0}")]
    InvalidPort(#[from] ParseIntError),
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("Invalid bind address: {0}")]
    InvalidBind(String),
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("Invalid SANDCHEST_API_KEYS: {0}")]
    InvalidApiKeys(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationBackend {
    Memory,
    Sql,
}

impl FromStr for CoordinationBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(CoordinationBackend::Memory),
            "sql" => Ok(CoordinationBackend::Sql),
            _ => Err(ConfigError::InvalidValue {
                key: "SANDCHEST_COORDINATION",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStoreBackend {
    Memory,
    S3,
}

impl FromStr for ObjectStoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(ObjectStoreBackend::Memory),
            "s3" => Ok(ObjectStoreBackend::S3),
            _ => Err(ConfigError::InvalidValue {
                key: "SANDCHEST_OBJECT_STORE",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: IpAddr,
    pub database_url: String,
    pub coordination: CoordinationBackend,
    pub object_store: ObjectStoreBackend,
    pub s3_bucket: Option<String>,
    pub s3_region: String,
    pub s3_endpoint: Option<String>,
    pub s3_timeout_secs: u64,
    pub api_keys: ApiKeys,
    pub internal_token: Option<String>,
    pub instance_id: String,
    pub rate_limits: RateLimits,
    pub drain_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    pub lease_ttl_secs: u64,
    pub leader_ttl_secs: u64,
    pub node_heartbeat_ttl_secs: u64,
    pub node_timeout_secs: u64,
    pub idle_timeout_secs: i64,
    pub transition_timeout_secs: i64,
    pub default_ttl_secs: i64,
    pub replay_retention_days: i64,
    pub max_fork_depth: i32,
    pub log_format: LogFormat,
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        _ => Ok(default),
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = match non_empty(&lookup, "PORT") {
            Some(value) => value.parse::<u16>()?,
            None => 4100,
        };
        if port == 0 {
            return Err(ConfigError::PortOutOfRange(port));
        }

        let bind_str = non_empty(&lookup, "SANDCHEST_BIND").unwrap_or_else(|| "0.0.0.0".to_string());
        let bind = bind_str
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidBind(bind_str.clone()))?;

        let object_store = parse_or(&lookup, "SANDCHEST_OBJECT_STORE", ObjectStoreBackend::Memory)?;
        let s3_bucket = non_empty(&lookup, "SANDCHEST_S3_BUCKET");
        if object_store == ObjectStoreBackend::S3 && s3_bucket.is_none() {
            return Err(ConfigError::Missing("SANDCHEST_S3_BUCKET"));
        }

        let api_keys = ApiKeys::parse(&lookup("SANDCHEST_API_KEYS").unwrap_or_default())
            .map_err(ConfigError::InvalidApiKeys)?;

        let defaults = RateLimits::default();
        let rate_limits = RateLimits {
            sandbox_create_per_min: parse_or(
                &lookup,
                "SANDCHEST_RATE_SANDBOX_CREATE_PER_MIN",
                defaults.sandbox_create_per_min,
            )?,
            exec_per_min: parse_or(&lookup, "SANDCHEST_RATE_EXEC_PER_MIN", defaults.exec_per_min)?,
            read_per_min: parse_or(&lookup, "SANDCHEST_RATE_READ_PER_MIN", defaults.read_per_min)?,
        };

        let log_format = match non_empty(&lookup, "SANDCHEST_LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "SANDCHEST_LOG_FORMAT",
                    value: other.to_string(),
                })
            }
        };

        Ok(Config {
            port,
            bind,
            database_url: non_empty(&lookup, "SANDCHEST_DATABASE_URL")
                .unwrap_or_else(|| "sqlite://sandchest.db?mode=rwc".to_string()),
            coordination: parse_or(&lookup, "SANDCHEST_COORDINATION", CoordinationBackend::Sql)?,
            object_store,
            s3_bucket,
            s3_region: non_empty(&lookup, "SANDCHEST_S3_REGION")
                .unwrap_or_else(|| "us-east-1".to_string()),
            s3_endpoint: non_empty(&lookup, "SANDCHEST_S3_ENDPOINT"),
            s3_timeout_secs: parse_or(&lookup, "SANDCHEST_S3_TIMEOUT_SECS", 30)?,
            api_keys,
            internal_token: non_empty(&lookup, "SANDCHEST_INTERNAL_TOKEN"),
            instance_id: non_empty(&lookup, "SANDCHEST_INSTANCE_ID")
                .unwrap_or_else(|| format!("inst_{}", uuid::Uuid::new_v4().simple())),
            rate_limits,
            drain_timeout_secs: parse_or(&lookup, "SANDCHEST_DRAIN_TIMEOUT_SECS", 30)?,
            reaper_interval_secs: parse_or(&lookup, "SANDCHEST_REAPER_INTERVAL_SECS", 15)?,
            lease_ttl_secs: parse_or(&lookup, "SANDCHEST_LEASE_TTL_SECS", 60)?,
            leader_ttl_secs: parse_or(&lookup, "SANDCHEST_LEADER_TTL_SECS", 30)?,
            node_heartbeat_ttl_secs: parse_or(&lookup, "SANDCHEST_NODE_HEARTBEAT_TTL_SECS", 45)?,
            node_timeout_secs: parse_or(&lookup, "SANDCHEST_NODE_TIMEOUT_SECS", 30)?,
            idle_timeout_secs: parse_or(&lookup, "SANDCHEST_IDLE_TIMEOUT_SECS", 900)?,
            transition_timeout_secs: parse_or(
                &lookup,
                "SANDCHEST_TRANSITION_TIMEOUT_SECS",
                300,
            )?,
            default_ttl_secs: parse_or(&lookup, "SANDCHEST_DEFAULT_TTL_SECS", 3600)?,
            replay_retention_days: parse_or(&lookup, "SANDCHEST_REPLAY_RETENTION_DAYS", 30)?,
            max_fork_depth: parse_or(&lookup, "SANDCHEST_MAX_FORK_DEPTH", 16)?,
            log_format,
        })
    }
}
