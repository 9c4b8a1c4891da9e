pub mod builder;
pub mod echo_server;
pub mod error;
pub mod handler;
pub mod listener;

pub use builder::ServerBuilder;
pub use echo_server::Server;
pub use error::ServerError;
pub use handler::{echo_reply, CloseReason, ConnectionHandler, ECHO_PREFIX};
