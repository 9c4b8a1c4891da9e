// src/server/handler.rs
use crate::connection::{Connection, ConnectionError, ConnectionId, ConnectionRegistry, Inbound};
use crate::metrics::MetricsCollector;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

pub const ECHO_PREFIX: &str = "Echo: ";

pub fn echo_reply(text: &str) -> String {
    format!("{ECHO_PREFIX}{text}")
}

/// Why a handler loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Error,
    Drained,
    /// The handler task was aborted or panicked before it could finish.
    Aborted,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::Error => "error",
            CloseReason::Drained => "drained",
            CloseReason::Aborted => "aborted",
        }
    }
}

/// Per-connection read/echo loop. Cloned once per accepted connection.
#[derive(Clone)]
pub struct ConnectionHandler {
    registry: Arc<ConnectionRegistry>,
    metrics: Option<Arc<MetricsCollector>>,
    buffer_size: usize,
}

impl ConnectionHandler {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        metrics: Option<Arc<MetricsCollector>>,
        buffer_size: usize,
    ) -> Self {
        Self {
            registry,
            metrics,
            buffer_size,
        }
    }

    /// Echo every message until the connection fails, the peer leaves or a
    /// close is requested, then deregister and close the socket.
    pub async fn handle(self, mut conn: Connection) -> CloseReason {
        let deregistration = Deregistration {
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            id: conn.id(),
            done: false,
        };
        let mut buf = vec![0u8; self.buffer_size];
        let mut messages = 0u64;

        let reason = loop {
            let text = match conn.read_message(&mut buf).await {
                Ok(Inbound::Message(text)) => text,
                Ok(Inbound::PeerClosed) => break CloseReason::PeerClosed,
                Ok(Inbound::Closed) => break CloseReason::Drained,
                Err(e) => {
                    debug!(conn_id = %conn.id(), error = %e, "read failed");
                    break CloseReason::Error;
                }
            };

            let reply = echo_reply(&text);
            match conn.write_all(reply.as_bytes()).await {
                Ok(()) => {
                    messages += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_echo(text.len(), reply.len());
                    }
                }
                Err(ConnectionError::ClosedDuringWrite) => break CloseReason::Drained,
                Err(e) => {
                    debug!(conn_id = %conn.id(), error = %e, "write failed");
                    break CloseReason::Error;
                }
            }
        };

        deregistration.complete(reason);

        let id = conn.id();
        let peer = conn.peer();
        let lifetime = Utc::now() - conn.connected_at();
        conn.close().await;

        info!(
            conn_id = %id,
            %peer,
            reason = reason.as_str(),
            messages,
            lifetime_ms = lifetime.num_milliseconds(),
            "disconnected"
        );

        reason
    }
}

/// Takes the connection out of the registry and settles its metrics, also
/// when the handler future is dropped early by an abort or a panic.
struct Deregistration {
    registry: Arc<ConnectionRegistry>,
    metrics: Option<Arc<MetricsCollector>>,
    id: ConnectionId,
    done: bool,
}

impl Deregistration {
    fn complete(mut self, reason: CloseReason) {
        self.release(reason);
        self.done = true;
    }

    fn release(&self, reason: CloseReason) {
        // a drain may already have taken the handle
        self.registry.remove(self.id);
        if let Some(metrics) = &self.metrics {
            metrics.record_close(reason.as_str());
        }
    }
}

impl Drop for Deregistration {
    fn drop(&mut self) {
        if !self.done {
            self.release(CloseReason::Aborted);
        }
    }
}
