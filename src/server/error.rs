// src/server/error.rs
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("could not resolve bind address {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("bind address {0} did not resolve to any socket address")]
    NoAddress(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}
