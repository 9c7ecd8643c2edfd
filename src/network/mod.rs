//! Network Layer
//!
//! UDP listener that feeds datagrams to the handshake protocol.
//! Socket I/O lives here; every authentication decision lives in `auth/`.

pub mod config;
pub mod server;

pub use config::ServerConfig;
pub use server::{AuthServer, ConnectionTable, ReapEntry, ServerError};
