//! Network-layer addresses and their lifecycle.
//!
//! An [`Inet4Address`] is the per-(scope, value) object shared by the address
//! table and by every message that refers to it. Besides the value it caches
//! the link-layer address and runs the neighbor resolution and duplicate
//! address detection state machine described by [`State`].

mod state;
pub use state::State;

mod inet4;
pub use inet4::{AddressKind, Inet4Address};

use crate::wire::Ipv4Address;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    #[error("{0} did not answer address resolution")]
    Unreachable(Ipv4Address),
    #[error("Timed out resolving {0}")]
    TimedOut(Ipv4Address),
}
