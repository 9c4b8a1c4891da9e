// ────────────────────────────────
// src/server/listener.rs
// Low-level TCP bind, kept apart from the accept loop.
// ────────────────────────────────
use super::error::ServerError;
use crate::config::ServerConfig;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Something the accept loop can take connections from.
pub trait Accept: Send + Sync {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send + '_;
}

impl Accept for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send + '_ {
        TcpListener::accept(self)
    }
}

/// Resolve `host:port` and listen on the first address with the configured
/// backlog. `SO_REUSEADDR` is set so a restart does not wait out TIME_WAIT.
pub async fn bind_tcp(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let addr_str = config.socket_addr_string();
    let addr = tokio::net::lookup_host(addr_str.as_str())
        .await
        .map_err(|source| ServerError::Resolve {
            addr: addr_str.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| ServerError::NoAddress(addr_str.clone()))?;

    listen(addr, config.backlog).map_err(|source| ServerError::Bind {
        addr: addr_str,
        source,
    })
}

fn listen(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Accept failures that concern only the connection being accepted, not the
/// listener.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(port: u16) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn binds_an_ephemeral_port() {
        let listener = bind_tcp(&loopback(0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn second_bind_on_a_listening_port_fails() {
        let first = bind_tcp(&loopback(0)).await.unwrap();
        let port = first.local_addr().unwrap().port();

        let err = bind_tcp(&loopback(port)).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[test]
    fn classifies_accept_errors() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(is_transient_accept_error(&aborted));
        assert!(!is_transient_accept_error(&denied));
    }
}
