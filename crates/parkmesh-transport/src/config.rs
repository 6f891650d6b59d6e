//! Peer link configuration

use std::time::Duration;

use parkmesh_core::MAX_FRAME_SIZE;

/// Configuration shared by outbound links and the inbound server
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Fixed wait between reconnect attempts in milliseconds
    pub reconnect_backoff_ms: u64,
    /// Per-frame write timeout in milliseconds
    pub write_timeout_ms: u64,
    /// Frames queued per link before `send` starts returning false
    pub outbox_capacity: usize,
    /// Largest accepted frame in bytes
    pub max_frame_size: usize,
    /// Maximum concurrent inbound connections
    pub max_inbound_connections: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            reconnect_backoff_ms: 5_000,
            write_timeout_ms: 5_000,
            outbox_capacity: 1024,
            max_frame_size: MAX_FRAME_SIZE,
            max_inbound_connections: 64,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Set the reconnect backoff
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.reconnect_backoff(), Duration::from_secs(5));
        assert_eq!(config.outbox_capacity, 1024);
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
    }

    #[test]
    fn test_config_builders() {
        let config = TransportConfig::default()
            .with_reconnect_backoff(Duration::from_millis(50))
            .with_connect_timeout(Duration::from_millis(200));
        assert_eq!(config.reconnect_backoff_ms, 50);
        assert_eq!(config.connect_timeout_ms, 200);
    }
}
