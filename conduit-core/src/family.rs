//! Protocol families.
//!
//! A family owns a subgraph of the conduit graph and links it to every
//! interface whose link type it understands. The stack keeps its families in
//! a fixed list built at startup.

pub mod arp;
pub mod inet4;

use crate::{
    conduit::{Graph, Key, NodeId},
    config::ConfigError,
    message::ScopeId,
    wire::Mac,
};

/// Identifies a family when opening sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FamilyId {
    /// IPv4 and the protocols above it.
    Inet,
    /// The ARP pseudo-family. It has no sockets.
    Arp,
}

/// What a family needs to know about a new interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub scope: ScopeId,
    /// The interface's mux keyed by packet type.
    pub type_mux: NodeId,
    pub mac: Mac,
    /// An ARP hardware type, see [`crate::wire::arp::hardware`].
    pub hardware: u16,
}

pub trait Family: Send + Sync {
    fn id(&self) -> FamilyId;

    /// The packet type this family claims on an interface.
    fn ethertype(&self) -> u16;

    fn graph(&self) -> &Graph;

    /// The family's mux keyed by scope, the meeting point with interfaces.
    fn scope_mux(&self) -> NodeId;

    /// Whether the family runs over this link type.
    fn wants(&self, hardware: u16) -> bool {
        let _ = hardware;
        true
    }

    /// Family specific setup once an interface is linked in.
    fn interface_added(&self, link: &Link) -> Result<(), ConfigError>;

    /// Family specific cleanup once an interface is unlinked.
    fn interface_removed(&self, scope: ScopeId);

    /// Links the interface's type mux and this family's scope mux to each
    /// other.
    fn attach_interface(&self, link: &Link) -> Result<(), ConfigError> {
        self.graph().connect_bb(
            link.type_mux,
            Key::Number(self.ethertype() as u32),
            self.scope_mux(),
            Key::Number(link.scope as u32),
        )?;
        self.interface_added(link)
    }

    fn detach_interface(&self, link: &Link) {
        let graph = self.graph();
        graph.remove_b(link.type_mux, Some(Key::Number(self.ethertype() as u32)));
        graph.remove_b(self.scope_mux(), Some(Key::Number(link.scope as u32)));
        self.interface_removed(link.scope);
    }
}
