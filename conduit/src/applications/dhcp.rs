//! Dynamic host configuration, RFC 2131.
//!
//! The client leases an address for one interface and installs it, along
//! with the router the server names, into the internet family. The server
//! hands out addresses from a fixed pool and exists so that scenarios and
//! tests have something to talk to.

use conduit_core::{config::ConfigError, message::ScopeId, SocketError};
use thiserror::Error as ThisError;

mod client;
pub use client::{ClientState, DhcpClient, Lease};

mod server;
pub use server::{AddressPool, DhcpServer, ServerConfig};

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum DhcpError {
    #[error("There is no interface with scope {0}")]
    NoInterface(ScopeId),
    #[error("No server answered after every retransmission")]
    NoAnswer,
    #[error("The server refused the request")]
    Refused,
    #[error("The client holds no lease")]
    NotBound,
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
