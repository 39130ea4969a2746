//! A small IPv4 network stack built as a graph of conduits.
//!
//! Packets travel through a graph of nodes in the style of the [x-kernel]:
//! protocols that each handle one header, muxes that pick the next node by a
//! key taken from the packet, and adapters that join the graph to devices and
//! sockets. Everything a node needs to know about a packet rides along in a
//! [`Message`].
//!
//! # Organization
//! - [`wire`] encodes and decodes the headers the stack speaks
//! - [`conduit`] holds the graph and the visitors that walk it
//! - [`address`] is the neighbor resolution and duplicate address detection
//!   state machine
//! - [`family`] builds the ARP and internet subgraphs and owns the address
//!   table
//! - [`Socket`] is the application interface
//! - [`Interface`] and [`device`] feed frames in and out
//! - [`Stack`] ties one host together
//!
//! [x-kernel]: https://ieeexplore.ieee.org/document/67579

mod logging;

pub mod wire;

pub mod message;
pub use message::Message;

pub mod conduit;
pub use conduit::Graph;

pub mod address;
pub use address::{Inet4Address, State};

pub mod config;
pub use config::StackConfig;

pub mod family;
pub use family::FamilyId;

pub mod socket;
pub use socket::{Socket, SocketError, SocketType};

pub mod device;
pub use device::Device;

pub mod interface;
pub use interface::Interface;

mod stack;
pub use stack::{Stack, StackError, MAX_INTERFACES};

/// A [`dashmap::DashMap`] with the Fx hasher.
pub type FxDashMap<K, V> =
    dashmap::DashMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
