use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Stream endpoint configuration
#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub bind_address: SocketAddr,
    /// Prefix of every route, without a trailing slash
    pub base_path: String,
    pub heartbeat_interval: Duration,
    /// Frames a connection may have queued before it is dropped
    pub backlog_size: usize,
    pub subscription_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv6Addr::UNSPECIFIED, 8878)),
            base_path: "/api".to_string(),
            heartbeat_interval: Duration::from_secs(45),
            backlog_size: 1000,
            subscription_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl StreamConfig {
    pub fn new(bind_address: impl Into<SocketAddr>) -> Self {
        Self {
            bind_address: bind_address.into(),
            ..Default::default()
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        let base_path = base_path.into();
        self.base_path = base_path.trim_end_matches('/').to_string();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_backlog_size(mut self, size: usize) -> Self {
        self.backlog_size = size;
        self
    }

    pub fn with_subscription_ttl(mut self, ttl: Duration) -> Self {
        self.subscription_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Main server configuration
#[derive(Clone, Debug, Default)]
pub struct ServerConfig {
    pub stream: StreamConfig,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream(mut self, config: StreamConfig) -> Self {
        self.stream = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.bind_address.port(), 8878);
        assert_eq!(config.base_path, "/api");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(45));
        assert_eq!(config.backlog_size, 1000);
    }

    #[test]
    fn test_base_path_trailing_slash_trimmed() {
        let config = StreamConfig::default().with_base_path("/live/");
        assert_eq!(config.base_path, "/live");
    }
}
