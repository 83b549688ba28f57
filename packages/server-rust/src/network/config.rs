//! Listener and lifecycle settings derived from [`ServiceConfig`].

use std::time::Duration;

use crate::service::ServiceConfig;

/// Request bodies above this size are rejected with 413.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Network and lifecycle configuration for the HTTP listener.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    /// Pause between failing readiness and starting teardown.
    pub drain_delay: Duration,
    /// Deadline shared by every teardown step.
    pub shutdown_timeout: Duration,
    /// Scrape path, or `None` when metrics are disabled.
    pub metrics_path: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            request_timeout: Duration::from_secs(30),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            drain_delay: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            metrics_path: Some("/metrics".to_string()),
        }
    }
}

impl From<&ServiceConfig> for NetworkConfig {
    fn from(cfg: &ServiceConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            request_timeout: cfg.request_timeout(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            drain_delay: cfg.drain_delay(),
            shutdown_timeout: cfg.shutdown_timeout(),
            metrics_path: cfg.metrics_enabled.then(|| cfg.metrics_path.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn network_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.metrics_path.as_deref(), Some("/metrics"));
    }

    #[test]
    fn derived_from_service_config() {
        let cfg = ServiceConfig::parse_from([
            "profile-server",
            "--port",
            "9000",
            "--shutdown-timeout",
            "20s",
            "--readiness-drain-delay",
            "2s",
            "--metrics-enabled",
            "false",
        ]);
        let net = NetworkConfig::from(&cfg);
        assert_eq!(net.port, 9000);
        assert_eq!(net.shutdown_timeout, Duration::from_secs(20));
        assert_eq!(net.drain_delay, Duration::from_secs(2));
        assert!(net.metrics_path.is_none());
    }
}
