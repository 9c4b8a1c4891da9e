// src/config/models.rs
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub shutdown: ShutdownConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind to, e.g. "0.0.0.0" or "127.0.0.1".
    pub host: String,
    pub port: u16,
    /// Pending-connection queue depth passed to `listen(2)`.
    pub backlog: u32,
    /// Upper bound on the bytes taken by a single read.
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5002,
            backlog: 5,
            buffer_size: 1024,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_period_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 2000,
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("server.host must not be empty")]
    EmptyHost,

    #[error("server.backlog must be greater than zero")]
    ZeroBacklog,

    #[error("server.buffer_size must be greater than zero")]
    ZeroBufferSize,

    #[error("metrics.path must start with '/', got {0:?}")]
    InvalidMetricsPath(String),

    #[error("metrics.port {0} collides with server.port")]
    MetricsPortCollision(u16),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.server.backlog == 0 {
            return Err(ConfigError::ZeroBacklog);
        }
        if self.server.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }

        if self.metrics.enabled {
            if !self.metrics.path.starts_with('/') {
                return Err(ConfigError::InvalidMetricsPath(self.metrics.path.clone()));
            }
            // port 0 asks the OS for any free port, so it never collides
            if self.server.port != 0 && self.metrics.port == self.server.port {
                return Err(ConfigError::MetricsPortCollision(self.metrics.port));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_deployment() {
        let config = Config::default();
        assert_eq!(config.server.socket_addr_string(), "0.0.0.0:5002");
        assert_eq!(config.server.backlog, 5);
        assert_eq!(config.server.buffer_size, 1024);
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_backlog_and_buffer() {
        let mut config = Config::default();
        config.server.backlog = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroBacklog)));

        let mut config = Config::default();
        config.server.buffer_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroBufferSize)));
    }

    #[test]
    fn metrics_checks_only_apply_when_enabled() {
        let mut config = Config::default();
        config.metrics.path = "metrics".to_string();
        config.metrics.port = config.server.port;
        assert!(config.validate().is_ok());

        config.metrics.enabled = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMetricsPath(_))
        ));

        config.metrics.path = "/metrics".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MetricsPortCollision(5002))
        ));
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let config: Config = serde_yaml::from_str("server:\n  port: 7000\n").unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.shutdown.grace_period_ms, 2000);
    }
}
