// src/connection/handle.rs
use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Identifier for an accepted connection, unique per registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-owning side of a connection, held by the registry.
///
/// It can only ask the connection to close. The socket itself stays with the
/// handler task, which drops it once it sees the request.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    close_tx: watch::Sender<bool>,
}

impl ConnectionHandle {
    /// Create a handle and the signal its owning task listens on.
    pub fn new(id: ConnectionId, peer: SocketAddr) -> (Self, CloseSignal) {
        let (close_tx, close_rx) = watch::channel(false);
        let handle = Self {
            id,
            peer,
            connected_at: Utc::now(),
            close_tx,
        };
        (handle, CloseSignal { rx: close_rx })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Request the connection to close. Returns `false` if it was already
    /// requested through this handle.
    pub fn close(&self) -> bool {
        !self.close_tx.send_replace(true)
    }
}

/// Receiving side of [`ConnectionHandle::close`].
#[derive(Debug)]
pub struct CloseSignal {
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    /// Resolves once a close was requested, or once the handle is gone and
    /// nobody tracks this connection any more.
    pub async fn requested(&mut self) {
        let _ = self.rx.wait_for(|closed| *closed).await;
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }
}

/// What one read produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Message(String),
    /// Zero-length read: the peer shut down its side.
    PeerClosed,
    /// The registry side asked this connection to close.
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("received bytes are not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("connection closed while writing")]
    ClosedDuringWrite,
}

/// An accepted socket, owned by exactly one handler task.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    stream: TcpStream,
    close: CloseSignal,
}

impl Connection {
    /// Wrap an accepted stream, returning the connection and the handle the
    /// registry keeps for it.
    pub fn new(id: ConnectionId, stream: TcpStream, peer: SocketAddr) -> (Self, ConnectionHandle) {
        let (handle, close) = ConnectionHandle::new(id, peer);
        let conn = Self {
            id,
            peer,
            connected_at: handle.connected_at(),
            stream,
            close,
        };
        (conn, handle)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Read once into `buf` and decode what arrived as text.
    ///
    /// A pending close request wins over data that is already buffered.
    pub async fn read_message(&mut self, buf: &mut [u8]) -> Result<Inbound, ConnectionError> {
        if self.close.is_requested() {
            return Ok(Inbound::Closed);
        }

        tokio::select! {
            biased;

            _ = self.close.requested() => Ok(Inbound::Closed),
            read = self.stream.read(buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(Inbound::PeerClosed);
                }
                let text = std::str::from_utf8(&buf[..n])?;
                Ok(Inbound::Message(text.to_owned()))
            }
        }
    }

    /// Write all of `bytes`, giving up if a close is requested meanwhile.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        tokio::select! {
            biased;

            _ = self.close.requested() => Err(ConnectionError::ClosedDuringWrite),
            written = self.stream.write_all(bytes) => Ok(written?),
        }
    }

    /// Shut down the write side and drop the socket.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            // peer may already be gone
            tracing::debug!(conn_id = %self.id, error = %e, "socket shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    async fn connected_pair() -> (Connection, ConnectionHandle, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let (conn, handle) = Connection::new(ConnectionId(1), stream, peer);
        (conn, handle, client)
    }

    #[test]
    fn close_reports_only_the_first_request() {
        let (handle, signal) = ConnectionHandle::new(ConnectionId(7), peer());
        assert!(!signal.is_requested());
        assert!(handle.close());
        assert!(!handle.close());
        assert!(signal.is_requested());
    }

    #[tokio::test]
    async fn dropping_the_handle_releases_the_signal() {
        let (handle, mut signal) = ConnectionHandle::new(ConnectionId(8), peer());
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), signal.requested())
            .await
            .expect("signal should resolve once the handle is dropped");
    }

    #[tokio::test]
    async fn reads_text_and_reports_peer_close() {
        let (mut conn, _handle, mut client) = connected_pair().await;
        let mut buf = [0u8; 64];

        client.write_all(b"hello").await.unwrap();
        let inbound = conn.read_message(&mut buf).await.unwrap();
        assert_eq!(inbound, Inbound::Message("hello".to_string()));

        drop(client);
        let inbound = conn.read_message(&mut buf).await.unwrap();
        assert_eq!(inbound, Inbound::PeerClosed);
    }

    #[tokio::test]
    async fn close_request_unblocks_a_pending_read() {
        let (mut conn, handle, _client) = connected_pair().await;

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            conn.read_message(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.close());

        let inbound = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read should return after close")
            .unwrap()
            .unwrap();
        assert_eq!(inbound, Inbound::Closed);
    }

    #[tokio::test]
    async fn invalid_utf8_is_an_error() {
        let (mut conn, _handle, mut client) = connected_pair().await;
        let mut buf = [0u8; 64];

        client.write_all(&[0xff, 0xfe, 0xfd]).await.unwrap();
        let err = conn.read_message(&mut buf).await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidUtf8(_)));
    }
}
