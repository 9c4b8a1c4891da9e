// ────────────────────────────────
// src/server/echo_server.rs
// Accept loop, handler pool and coordinated shutdown.
// ────────────────────────────────
use super::error::ServerError;
use super::handler::ConnectionHandler;
use super::listener::{is_transient_accept_error, Accept};
use crate::connection::{Connection, ConnectionRegistry};
use crate::metrics::MetricsCollector;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// State only the accept loop touches while it runs. Shutdown gets it once
/// the loop has let go.
struct Acceptor {
    listener: Option<TcpListener>,
    handlers: JoinSet<()>,
}

pub struct Server {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    handler: ConnectionHandler,
    acceptor: Mutex<Acceptor>,
    stop_tx: watch::Sender<bool>,
    grace_period: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Server {
    pub(crate) fn new(
        listener: TcpListener,
        local_addr: SocketAddr,
        buffer_size: usize,
        grace_period: Duration,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let handler = ConnectionHandler::new(registry.clone(), metrics.clone(), buffer_size);
        let (stop_tx, _) = watch::channel(false);

        Self {
            local_addr,
            registry,
            handler,
            acceptor: Mutex::new(Acceptor {
                listener: Some(listener),
                handlers: JoinSet::new(),
            }),
            stop_tx,
            grace_period,
            metrics,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Accept connections until [`stop_accepting`](Self::stop_accepting) is
    /// called (returns `Ok`) or the listener fails for good (returns `Err`).
    /// Either way the listener is closed when this returns.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut acceptor = self.acceptor.lock().await;
        let Acceptor { listener, handlers } = &mut *acceptor;
        self.accept_loop(listener, handlers).await
    }

    async fn accept_loop<L: Accept>(
        &self,
        listener: &mut Option<L>,
        handlers: &mut JoinSet<()>,
    ) -> Result<(), ServerError> {
        let Some(active) = listener.as_ref() else {
            debug!("Listener already closed, nothing to accept");
            return Ok(());
        };

        let mut stop_rx = self.stop_tx.subscribe();
        info!("Accepting connections on {}", self.local_addr);

        let result = loop {
            tokio::select! {
                biased;

                _ = stopped(&mut stop_rx) => {
                    debug!("Accept loop stopping");
                    break Ok(());
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Connection handler panicked: {}", e);
                        }
                    }
                }
                accepted = active.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer, handlers),
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!("Dropped a connection during accept: {}", e);
                    }
                    Err(e) => {
                        error!("Accept loop failed: {}", e);
                        break Err(ServerError::Accept(e));
                    }
                },
            }
        };

        listener.take();
        result
    }

    /// Register a fresh connection and start its handler. Runs without
    /// yielding, so a stopped loop never admits anything afterwards.
    fn admit(&self, stream: TcpStream, peer: SocketAddr, handlers: &mut JoinSet<()>) {
        let id = self.registry.allocate_id();
        let (conn, handle) = Connection::new(id, stream, peer);

        if !self.registry.add(handle) {
            warn!(conn_id = %id, %peer, "Connection id already registered, dropping");
            return;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_accept();
        }
        info!(conn_id = %id, %peer, "connected");

        let handler = self.handler.clone();
        handlers.spawn(async move {
            handler.handle(conn).await;
        });
    }

    /// Make [`run`](Self::run) return and close the listener. Safe to call
    /// from any task, any number of times.
    pub fn stop_accepting(&self) {
        if !self.stop_tx.send_replace(true) {
            info!("No longer accepting connections");
        }
    }

    /// Stop accepting, close every registered connection and the listener,
    /// then wait up to the grace period for handler tasks to finish.
    ///
    /// Idempotent: later calls find nothing left to close.
    pub async fn shutdown(&self) {
        self.stop_accepting();

        // waits for a running accept loop to return
        let mut acceptor = self.acceptor.lock().await;
        if acceptor.listener.take().is_some() {
            debug!("Closed listener on {}", self.local_addr);
        }

        let drained = self.registry.drain();
        let mut closed = 0usize;
        for handle in &drained {
            if handle.close() {
                closed += 1;
                debug!(
                    conn_id = %handle.id(),
                    peer = %handle.peer(),
                    age_ms = (Utc::now() - handle.connected_at()).num_milliseconds(),
                    "Closing connection"
                );
            } else {
                debug!(conn_id = %handle.id(), "Connection was already closing");
            }
        }
        info!("Closed {} of {} open connections", closed, drained.len());
        drop(drained);

        let handlers = std::mem::take(&mut acceptor.handlers);
        drop(acceptor);
        reap_handlers(handlers, self.grace_period).await;
    }
}

async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}

async fn reap_handlers(mut handlers: JoinSet<()>, grace_period: Duration) {
    if handlers.is_empty() {
        return;
    }

    let finished = tokio::time::timeout(grace_period, async {
        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!("Connection handler panicked: {}", e);
                }
            }
        }
    })
    .await;

    if finished.is_err() {
        warn!(
            "Aborting {} connection handlers still running after {:?}",
            handlers.len(),
            grace_period
        );
        handlers.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::ServerBuilder;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::io;

    /// Fails `accept` with the queued error kinds, then waits forever.
    struct ScriptedListener {
        errors: SyncMutex<VecDeque<io::ErrorKind>>,
    }

    impl ScriptedListener {
        fn new(errors: impl IntoIterator<Item = io::ErrorKind>) -> Self {
            Self {
                errors: SyncMutex::new(errors.into_iter().collect()),
            }
        }
    }

    impl Accept for ScriptedListener {
        fn accept(
            &self,
        ) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send + '_ {
            let next = self.errors.lock().pop_front();
            async move {
                match next {
                    Some(kind) => Err(io::Error::from(kind)),
                    None => std::future::pending().await,
                }
            }
        }
    }

    async fn server() -> Server {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        };
        ServerBuilder::new(config).bind().await.unwrap()
    }

    #[tokio::test]
    async fn fatal_accept_error_ends_the_loop_and_closes_the_listener() {
        let server = server().await;
        let mut listener = Some(ScriptedListener::new([
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::PermissionDenied,
        ]));
        let mut handlers = JoinSet::new();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            server.accept_loop(&mut listener, &mut handlers),
        )
        .await
        .expect("accept loop should stop on a fatal error");

        match result {
            Err(ServerError::Accept(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("expected a fatal accept error, got {other:?}"),
        }
        assert!(listener.is_none());
    }

    #[tokio::test]
    async fn transient_accept_errors_keep_the_loop_running() {
        let server = server().await;
        let mut listener = Some(ScriptedListener::new([
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
        ]));
        let mut handlers = JoinSet::new();

        let (result, ()) = tokio::join!(
            server.accept_loop(&mut listener, &mut handlers),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                server.stop_accepting();
            }
        );

        assert!(result.is_ok());
        assert!(listener.is_none());
    }
}
