//! Signaling service configuration.
//!
//! Loaded from environment variables. Every setting has a default, so an
//! empty environment yields a working local server.

use crate::engine::TransportConfig;

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:4443";

/// Default health and metrics bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default interval between server Pings on idle connections.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 20;

/// Default time without any inbound frame before a connection is dropped.
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 60;

/// Default per-connection outbound queue capacity (frames).
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 256;

/// Default room actor mailbox capacity.
pub const DEFAULT_ROOM_MAILBOX_SIZE: usize = 500;

/// Default time allowed for rooms to drain on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;

/// Default media listen address handed to the engine.
pub const DEFAULT_MEDIA_LISTEN_IP: &str = "0.0.0.0";

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "sig";

/// Signaling service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket listener (default: "0.0.0.0:4443").
    pub bind_address: String,

    /// Health and metrics listener (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this instance, used in logs.
    pub instance_id: String,

    pub heartbeat_interval: Duration,

    /// Must be longer than `heartbeat_interval`.
    pub idle_timeout: Duration,

    pub outbound_queue_size: usize,

    pub room_mailbox_size: usize,

    pub shutdown_timeout: Duration,

    /// Address the media engine binds transports to.
    pub media_listen_ip: String,

    /// Public address advertised in ICE candidates, if different.
    pub media_announced_ip: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
    }
}

fn non_empty(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = non_empty(vars, "SIGNALING_BIND_ADDRESS")
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = non_empty(vars, "SIGNALING_HEALTH_BIND_ADDRESS")
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let heartbeat_seconds: u64 = parse_var(
            vars,
            "SIGNALING_HEARTBEAT_INTERVAL_SECONDS",
            DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
        )?;
        let idle_seconds: u64 = parse_var(
            vars,
            "SIGNALING_IDLE_TIMEOUT_SECONDS",
            DEFAULT_IDLE_TIMEOUT_SECONDS,
        )?;
        if heartbeat_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "SIGNALING_HEARTBEAT_INTERVAL_SECONDS must be positive".to_string(),
            ));
        }
        if idle_seconds <= heartbeat_seconds {
            return Err(ConfigError::InvalidValue(format!(
                "SIGNALING_IDLE_TIMEOUT_SECONDS ({idle_seconds}) must exceed \
                 SIGNALING_HEARTBEAT_INTERVAL_SECONDS ({heartbeat_seconds})"
            )));
        }

        let outbound_queue_size: usize = parse_var(
            vars,
            "SIGNALING_OUTBOUND_QUEUE_SIZE",
            DEFAULT_OUTBOUND_QUEUE_SIZE,
        )?;
        if outbound_queue_size == 0 {
            return Err(ConfigError::InvalidValue(
                "SIGNALING_OUTBOUND_QUEUE_SIZE must be positive".to_string(),
            ));
        }

        let room_mailbox_size: usize = parse_var(
            vars,
            "SIGNALING_ROOM_MAILBOX_SIZE",
            DEFAULT_ROOM_MAILBOX_SIZE,
        )?;
        if room_mailbox_size == 0 {
            return Err(ConfigError::InvalidValue(
                "SIGNALING_ROOM_MAILBOX_SIZE must be positive".to_string(),
            ));
        }

        let shutdown_seconds: u64 = parse_var(
            vars,
            "SIGNALING_SHUTDOWN_TIMEOUT_SECONDS",
            DEFAULT_SHUTDOWN_TIMEOUT_SECONDS,
        )?;

        let media_listen_ip = non_empty(vars, "MEDIA_LISTEN_IP")
            .unwrap_or_else(|| DEFAULT_MEDIA_LISTEN_IP.to_string());
        let media_announced_ip = non_empty(vars, "MEDIA_ANNOUNCED_IP");

        let instance_id = non_empty(vars, "SIGNALING_INSTANCE_ID").unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            health_bind_address,
            instance_id,
            heartbeat_interval: Duration::from_secs(heartbeat_seconds),
            idle_timeout: Duration::from_secs(idle_seconds),
            outbound_queue_size,
            room_mailbox_size,
            shutdown_timeout: Duration::from_secs(shutdown_seconds),
            media_listen_ip,
            media_announced_ip,
        })
    }

    /// Transport settings handed to the media engine.
    #[must_use]
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            listen_ip: self.media_listen_ip.clone(),
            announced_ip: self.media_announced_ip.clone(),
            ..TransportConfig::default()
        }
    }
}
