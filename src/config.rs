//! Configuration management for demovox
//!
//! Loads settings from environment variables (.env file)

use crate::audio::frame::GapPolicy;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory polled for new recordings
    pub inbox_dir: PathBuf,
    /// Artifacts and run metadata
    pub output_dir: PathBuf,
    /// How long finished runs stay visible
    pub ttl: Duration,
    /// Eviction sweep period
    pub sweep_interval: Duration,
    /// Inbox polling period
    pub poll_interval: Duration,
    /// Upper bound on extraction workers
    pub max_workers: usize,
    /// Wipe the output directory at startup
    pub clean_on_start: bool,
    /// Frame index handling after a concealed gap
    pub gap_policy: GapPolicy,
    /// Look up player names for runs with a match id
    pub enrich: bool,
    /// Optional bearer key for the match API
    pub faceit_api_key: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let inbox_dir = get("DEMOVOX_INBOX_DIR").unwrap_or_else(|| "uploads".to_string()).into();
        let output_dir = get("DEMOVOX_OUTPUT_DIR").unwrap_or_else(|| "output".to_string()).into();

        let ttl = Duration::from_secs(parse_or("DEMOVOX_TTL_SECS", get("DEMOVOX_TTL_SECS"), 300)?);
        let sweep_interval = Duration::from_secs(parse_or(
            "DEMOVOX_SWEEP_INTERVAL_SECS",
            get("DEMOVOX_SWEEP_INTERVAL_SECS"),
            30,
        )?);
        let poll_interval = Duration::from_secs(parse_or(
            "DEMOVOX_POLL_INTERVAL_SECS",
            get("DEMOVOX_POLL_INTERVAL_SECS"),
            5,
        )?);

        for (key, value) in [
            ("DEMOVOX_TTL_SECS", ttl),
            ("DEMOVOX_SWEEP_INTERVAL_SECS", sweep_interval),
            ("DEMOVOX_POLL_INTERVAL_SECS", poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue(key.to_string(), "0".to_string()));
            }
        }

        let available = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let max_workers = parse_or("DEMOVOX_WORKERS", get("DEMOVOX_WORKERS"), available)?;
        if max_workers == 0 {
            return Err(ConfigError::InvalidValue("DEMOVOX_WORKERS".to_string(), "0".to_string()));
        }

        let clean_on_start = parse_bool("DEMOVOX_CLEAN_ON_START", get("DEMOVOX_CLEAN_ON_START"), true)?;
        let enrich = parse_bool("DEMOVOX_ENRICH", get("DEMOVOX_ENRICH"), true)?;

        let gap_policy = match get("DEMOVOX_GAP_POLICY") {
            Some(s) => GapPolicy::from_str(&s)
                .ok_or_else(|| ConfigError::InvalidValue("DEMOVOX_GAP_POLICY".to_string(), s))?,
            None => GapPolicy::default(),
        };

        Ok(Self {
            inbox_dir,
            output_dir,
            ttl,
            sweep_interval,
            poll_interval,
            max_workers,
            clean_on_start,
            gap_policy,
            enrich,
            faceit_api_key: get("FACEIT_API_KEY"),
        })
    }
}

fn parse_or<T: FromStr>(key: &str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(s) => s
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), s)),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match value.as_deref().map(str::to_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(_) => Err(ConfigError::InvalidValue(
            key.to_string(),
            value.unwrap_or_default(),
        )),
    }
}
