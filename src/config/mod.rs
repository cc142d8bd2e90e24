//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::security::SecurityTuning;
use crate::sync::RateTuning;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Shared secret for session tokens and message signing
    pub session_secret: String,
    /// Allowed client origins for CORS, comma-separated ("*" for any)
    pub client_origin: String,

    /// Transmission controller tuning
    pub rate: RateTuning,
    /// Integrity guard tuning
    pub security: SecurityTuning,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let mut rate = RateTuning::default();
        rate.min_rate = env_or("MIN_SEND_RATE", rate.min_rate)?;
        rate.max_rate = env_or("MAX_SEND_RATE", rate.max_rate)?;
        rate.step = env_or("SEND_RATE_STEP", rate.step)?;
        rate.high_latency_ms = env_or("HIGH_LATENCY_MS", rate.high_latency_ms)?;
        rate.low_latency_ms = env_or("LOW_LATENCY_MS", rate.low_latency_ms)?;
        rate.high_loss = env_or("HIGH_LOSS_RATIO", rate.high_loss)?;
        rate.low_loss = env_or("LOW_LOSS_RATIO", rate.low_loss)?;

        let mut security = SecurityTuning::default();
        security.max_action_rate = env_or("MAX_ACTION_RATE", security.max_action_rate)?;
        security.max_movement_speed = env_or("MAX_MOVEMENT_SPEED", security.max_movement_speed)?;
        security.suspicion_threshold =
            env_or("SUSPICION_THRESHOLD", security.suspicion_threshold)?;
        security.suspicion_decay_per_sec =
            env_or("SUSPICION_DECAY_PER_SEC", security.suspicion_decay_per_sec)?;
        security.timestamp_tolerance = Duration::from_secs(env_or(
            "TIMESTAMP_TOLERANCE_SECS",
            security.timestamp_tolerance.as_secs(),
        )?);
        security.nonce_ttl =
            Duration::from_secs(env_or("NONCE_TTL_SECS", security.nonce_ttl.as_secs())?);

        if rate.min_rate <= 0.0 || rate.min_rate > rate.max_rate {
            return Err(ConfigError::InvalidRateWindow);
        }
        // A nonce forgotten before its timestamp goes stale would reopen
        // the replay window
        if security.nonce_ttl < security.timestamp_tolerance {
            return Err(ConfigError::InvalidReplayWindow);
        }

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            session_secret: env::var("SESSION_SECRET")
                .map_err(|_| ConfigError::Missing("SESSION_SECRET"))?,

            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),

            rate,
            security,
        })
    }
}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("MIN_SEND_RATE must be positive and at most MAX_SEND_RATE")]
    InvalidRateWindow,

    #[error("NONCE_TTL_SECS must be at least TIMESTAMP_TOLERANCE_SECS")]
    InvalidReplayWindow,
}
