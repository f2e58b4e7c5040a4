//! Network manager configuration.

use serde::Deserialize;
use std::time::Duration;

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_backlog() -> u32 {
    128
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_keepalive_timeout_ms() -> u64 {
    120_000
}

fn default_recv_buffer_size() -> usize {
    64 * 1024
}

fn default_max_concurrent_streams() -> u32 {
    100
}

/// Tunables for a [`NetMgr`](crate::NetMgr) instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetMgrConfig {
    /// Number of I/O worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Listen backlog used when the caller does not supply one.
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Default connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Read timeout for sockets without the keepalive flag.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Read timeout for sockets with the keepalive flag.
    #[serde(default = "default_keepalive_timeout_ms")]
    pub keepalive_timeout_ms: u64,

    /// Size of each worker's shared receive buffer.
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,

    /// Concurrent HTTP/2 streams accepted per DoH connection.
    #[serde(default = "default_max_concurrent_streams")]
    pub http_max_concurrent_streams: u32,
}

impl Default for NetMgrConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            backlog: default_backlog(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            keepalive_timeout_ms: default_keepalive_timeout_ms(),
            recv_buffer_size: default_recv_buffer_size(),
            http_max_concurrent_streams: default_max_concurrent_streams(),
        }
    }
}

impl NetMgrConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = NetMgrConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.backlog, 128);
        assert_eq!(config.recv_buffer_size, 64 * 1024);
    }

    #[test]
    fn timeout_conversions() {
        let config = NetMgrConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert!(config.keepalive_timeout() > config.idle_timeout());
    }
}
