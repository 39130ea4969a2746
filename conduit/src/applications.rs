//! Programs built on the socket API.

pub mod dhcp;
pub use dhcp::{DhcpClient, DhcpServer};
