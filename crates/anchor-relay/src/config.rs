//! Relay configuration
//!
//! The binary fills this from flags and `ANCHOR_RELAY_*` environment
//! variables; library users build it directly.

use anchor_core::{RelayError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the relay server
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Interface to bind
    pub bind_address: String,
    /// Listen port; 0 lets the OS pick
    pub port: u16,
    /// Capacity of each client's outbound queue
    pub outbound_queue_capacity: usize,
    /// Inbound bytes a peer may hold without a delimiter. `None` is unbounded.
    pub max_buffered_bytes: Option<usize>,
    /// Silence after which a peer is dropped. `None` keeps peers forever.
    pub idle_timeout: Option<Duration>,
    /// Consecutive invalid frames after which the peer's address is banned.
    /// `None` never bans.
    pub ban_invalid_after: Option<u32>,
    /// Heartbeat cadence
    pub heartbeat_interval: Duration,
    /// Status document path for the external health watcher
    pub status_file: Option<PathBuf>,
    /// Status document cadence
    pub status_interval: Duration,
    /// Upper bound on how long `stop` waits for clients to settle
    pub stop_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 43384,
            outbound_queue_capacity: 256,
            max_buffered_bytes: None,
            idle_timeout: None,
            ban_invalid_after: None,
            heartbeat_interval: Duration::from_secs(30),
            status_file: None,
            status_interval: Duration::from_secs(5),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl RelayConfig {
    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.outbound_queue_capacity == 0 {
            return Err(RelayError::ConfigError("queue must be at least 1".into()));
        }
        if self.heartbeat_interval.is_zero() || self.status_interval.is_zero() {
            return Err(RelayError::ConfigError(
                "heartbeat and status intervals must be non-zero".into(),
            ));
        }
        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(RelayError::ConfigError("idle-timeout must be non-zero".into()));
        }
        if self.ban_invalid_after == Some(0) {
            return Err(RelayError::ConfigError("ban-invalid-after must be at least 1".into()));
        }
        Ok(())
    }

    /// `host:port` string for binding
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Parse a duration given in (possibly fractional) seconds
pub fn parse_secs(value: &str) -> Result<Duration> {
    let invalid = || RelayError::ConfigError(format!("invalid number of seconds: {:?}", value));
    let secs: f64 = value.trim().parse().map_err(|_| invalid())?;
    Duration::try_from_secs_f64(secs).map_err(|_| invalid())
}
