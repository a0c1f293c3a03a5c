//! Environment-driven server configuration.
//!
//! All knobs ship with defaults; only the two secrets are mandatory. The
//! session-token secret is rejected at startup if it looks weak, since every
//! terminal-session signature hangs off it.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Minimum acceptable secret material: 32 bytes hex-encoded.
const MIN_SECRET_HEX_CHARS: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("{0} is too weak: expected at least 64 hex characters with some variety")]
    WeakSecret(&'static str),
}

/// Per-field minimum intervals for heartbeat-driven work. Bounds write
/// pressure on the store regardless of how chatty an agent is.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatIntervals {
    pub status: Duration,
    pub metrics: Duration,
    pub ports: Duration,
    pub broadcast: Duration,
}

impl Default for HeartbeatIntervals {
    fn default() -> Self {
        Self {
            status: Duration::from_millis(10_000),
            metrics: Duration::from_millis(15_000),
            ports: Duration::from_millis(60_000),
            broadcast: Duration::from_millis(5_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub heartbeat: HeartbeatIntervals,
    /// HMAC key for session-token signatures and web bearer verification.
    pub session_token_secret: String,
    /// Root secret the AES-256-GCM agent-secret key is derived from.
    pub master_secret: String,
    /// How long inflight executions survive an agent disconnect before they
    /// are failed.
    pub dispatch_grace: Duration,
    /// Global ceiling on parallel-mode in-flight executions.
    pub job_max_concurrency: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let session_token_secret = require("SESSION_TOKEN_SECRET")?;
        validate_secret("SESSION_TOKEN_SECRET", &session_token_secret)?;
        let master_secret = require("MASTER_SECRET")?;
        validate_secret("MASTER_SECRET", &master_secret)?;

        Ok(Self {
            bind_addr: parse_or("FLEET_BIND", "0.0.0.0:7070")?,
            heartbeat: HeartbeatIntervals {
                status: millis_or("HEARTBEAT_STATUS_INTERVAL_MS", 10_000)?,
                metrics: millis_or("HEARTBEAT_METRICS_INTERVAL_MS", 15_000)?,
                ports: millis_or("HEARTBEAT_PORTS_INTERVAL_MS", 60_000)?,
                broadcast: millis_or("HEARTBEAT_BROADCAST_INTERVAL_MS", 5_000)?,
            },
            session_token_secret,
            master_secret,
            dispatch_grace: Duration::from_secs(parse_or("DISPATCH_GRACE_SECS", "15")?),
            job_max_concurrency: parse_or("JOB_MAX_CONCURRENCY", "50")?,
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_or<T>(name: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}

fn millis_or(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let ms: u64 = raw.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })?;
    Ok(Duration::from_millis(ms))
}

/// A usable secret is hex, at least 32 bytes worth, and not a degenerate
/// repetition of one character.
fn validate_secret(name: &'static str, value: &str) -> Result<(), ConfigError> {
    let hex = value.len() >= MIN_SECRET_HEX_CHARS
        && value.chars().all(|c| c.is_ascii_hexdigit());
    if !hex {
        return Err(ConfigError::WeakSecret(name));
    }
    let mut chars: Vec<char> = value.chars().collect();
    chars.sort_unstable();
    chars.dedup();
    if chars.len() < 4 {
        return Err(ConfigError::WeakSecret(name));
    }
    Ok(())
}
