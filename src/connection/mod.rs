// src/connection/mod.rs
mod handle;
mod registry;

pub use handle::{
    CloseSignal, Connection, ConnectionError, ConnectionHandle, ConnectionId, Inbound,
};
pub use registry::ConnectionRegistry;
