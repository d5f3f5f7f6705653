//! Configuration management for the upload engine

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::upload::policy::Policy;
use crate::upload::types::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CHUNKS, SESSION_EXPIRY_HOURS};

const DEFAULT_REAPER_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Final artifacts land here unless a call names another destination
    pub upload_path: PathBuf,

    /// Staging area; `None` stages next to the destination
    pub temp_path: Option<PathBuf>,

    /// Root of chunk session directories
    pub chunks_directory: PathBuf,

    /// Chunk granularity advertised to clients; not enforced on writes
    pub chunk_size: usize,

    /// Largest chunk count a session may declare (0 = unlimited)
    pub max_chunks_per_session: usize,

    /// Idle sessions older than this are reaped (0 disables the reaper)
    pub session_ttl_hours: i64,

    pub reaper_interval_secs: u64,

    pub policy: Policy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            upload_path: PathBuf::from("./uploads"),
            temp_path: Some(PathBuf::from("./temp")),
            chunks_directory: PathBuf::from("./chunks"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunks_per_session: DEFAULT_MAX_CHUNKS,
            session_ttl_hours: SESSION_EXPIRY_HOURS,
            reaper_interval_secs: DEFAULT_REAPER_INTERVAL_SECS,
            policy: Policy::default(),
        }
    }
}

impl Config {
    /// Read configuration from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from any key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let policy = Policy {
            max_file_size: parse_or(&get, "MAX_FILE_SIZE", defaults.policy.max_file_size)?,
            max_batch_size: parse_or(&get, "MAX_BATCH_SIZE", defaults.policy.max_batch_size)?,
            max_upload_count: parse_or(&get, "MAX_UPLOAD_COUNT", defaults.policy.max_upload_count)?,
            allowed_types: get("ALLOWED_TYPES")
                .map(|v| parse_list(&v))
                .unwrap_or(defaults.policy.allowed_types),
            allow_unknown_types: parse_or(
                &get,
                "ALLOW_UNKNOWN_TYPES",
                defaults.policy.allow_unknown_types,
            )?,
            type_size_limits: match get("TYPE_SIZE_LIMITS") {
                Some(v) => parse_limits(&v)?,
                None => defaults.policy.type_size_limits,
            },
        };

        Ok(Config {
            upload_path: get("UPLOAD_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_path),
            temp_path: get("TEMP_PATH").map(PathBuf::from).or(defaults.temp_path),
            chunks_directory: get("CHUNKS_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or(defaults.chunks_directory),
            chunk_size: parse_or(&get, "CHUNK_SIZE", defaults.chunk_size)?,
            max_chunks_per_session: parse_or(
                &get,
                "MAX_CHUNKS_PER_SESSION",
                defaults.max_chunks_per_session,
            )?,
            session_ttl_hours: parse_or(&get, "SESSION_TTL_HOURS", defaults.session_ttl_hours)?,
            reaper_interval_secs: parse_or(
                &get,
                "REAPER_INTERVAL_SECS",
                defaults.reaper_interval_secs,
            )?,
            policy,
        })
    }

    /// Session idle limit, `None` when expiry is disabled
    pub fn session_ttl(&self) -> Option<chrono::Duration> {
        (self.session_ttl_hours > 0).then(|| chrono::Duration::hours(self.session_ttl_hours))
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key,
                reason: e.to_string(),
                value,
            }),
        None => Ok(default),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `image/png=1048576,video=524288000`
fn parse_limits(value: &str) -> Result<HashMap<String, u64>, ConfigError> {
    parse_list(value)
        .into_iter()
        .map(|pair| -> Result<(String, u64), ConfigError> {
            let invalid = |reason: String| ConfigError::InvalidValue {
                key: "TYPE_SIZE_LIMITS",
                value: pair.clone(),
                reason,
            };
            let (content_type, bytes) = pair
                .split_once('=')
                .ok_or_else(|| invalid("expected type=bytes".to_string()))?;
            let bytes = bytes
                .trim()
                .parse::<u64>()
                .map_err(|e| invalid(e.to_string()))?;
            Ok((content_type.trim().to_string(), bytes))
        })
        .collect()
}
