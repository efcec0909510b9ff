//! Streaming Configuration
//!
//! Defines the tunables for the log streaming subsystem:
//! - Admission limits (global connection cap)
//! - Delivery pipeline intervals (existence poll, backstop poll, debounce)
//! - Per-stream session timers (heartbeat, inactivity, shutdown grace)

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete streaming configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Connection admission limits
    pub admission: AdmissionConfig,
    /// Delivery pipeline timing
    pub delivery: DeliveryConfig,
    /// Per-stream session timers
    pub session: SessionConfig,
}

/// Connection admission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Maximum concurrent SSE connections across all sessions.
    /// The sole backpressure mechanism: requests beyond this are rejected
    /// immediately with 503, never queued.
    pub max_concurrent_connections: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 100,
        }
    }
}

/// Delivery pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Interval for polling the log medium into existence before the first
    /// line is written
    pub existence_poll_interval_ms: u64,
    /// Backstop tail poll interval. The filesystem watcher is a latency
    /// optimization; this poll is the correctness guarantee.
    pub poll_interval_ms: u64,
    /// Write-stabilization window: rapid successive watcher events within
    /// this window coalesce into a single tail check
    pub debounce_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            existence_poll_interval_ms: 100,
            poll_interval_ms: 250,
            debounce_ms: 50,
        }
    }
}

impl DeliveryConfig {
    pub fn existence_poll_interval(&self) -> Duration {
        Duration::from_millis(self.existence_poll_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Per-stream session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Heartbeat (comment keep-alive frame) interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Streams with no delivered batch for this long are closed
    pub inactivity_timeout_secs: u64,
    /// Grace period between the shutdown advisory frame and proactive close
    pub shutdown_grace_ms: u64,
    /// Reconnect delay advertised to clients in the shutdown advisory frame
    pub shutdown_reconnect_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            inactivity_timeout_secs: 300, // 5 minutes
            shutdown_grace_ms: 1000,
            shutdown_reconnect_delay_ms: 5000,
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();

        assert_eq!(config.admission.max_concurrent_connections, 100);
        assert_eq!(config.delivery.poll_interval(), Duration::from_millis(250));
        assert_eq!(
            config.delivery.existence_poll_interval(),
            Duration::from_millis(100)
        );
        assert_eq!(config.session.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(
            config.session.inactivity_timeout(),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_roundtrip() {
        let config = StreamConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: StreamConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed.admission.max_concurrent_connections,
            config.admission.max_concurrent_connections
        );
    }
}
