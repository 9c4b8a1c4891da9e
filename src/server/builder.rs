// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use super::echo_server::Server;
use super::error::ServerError;
use super::listener::bind_tcp;
use crate::config::{ServerConfig, ShutdownConfig};
use crate::metrics::MetricsCollector;
use std::sync::Arc;
use std::time::Duration;

/// Builder so `main.rs` (or a test) can inject metrics and tune shutdown.
pub struct ServerBuilder {
    config: ServerConfig,
    grace_period: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            grace_period: ShutdownConfig::default().grace_period(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// How long `shutdown` waits for handlers before aborting them.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Bind the listener. Accepting starts with [`Server::run`].
    pub async fn bind(self) -> Result<Server, ServerError> {
        let listener = bind_tcp(&self.config).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind {
                addr: self.config.socket_addr_string(),
                source,
            })?;
        tracing::info!(
            "Listening on {} (backlog {})",
            local_addr,
            self.config.backlog
        );

        Ok(Server::new(
            listener,
            local_addr,
            self.config.buffer_size,
            self.grace_period,
            self.metrics,
        ))
    }
}
