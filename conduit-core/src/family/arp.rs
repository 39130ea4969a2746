//! The ARP pseudo-family.
//!
//! ```text
//! interfaces ── scope mux ══ arp protocol ── arp mux ─┬─ address adapter
//!                                                     └─ address adapter
//! ```
//!
//! The ARP mux keys a request by the address it asks about and a reply by the
//! address it answers for, so both reach the [`Inet4Address`] concerned.

use super::{Family, FamilyId, Link};
use crate::{
    address::Inet4Address,
    conduit::{Accessor, Graph, GraphError, Key, NodeId, Receiver},
    config::ConfigError,
    message::{Message, ScopeId},
    wire::{
        arp::{hardware, ArpHeader},
        dix::ethertype,
        Mac,
    },
    FxDashMap,
};
use std::sync::Arc;
use tracing::debug;

pub struct ArpFamily {
    graph: Arc<Graph>,
    scope_mux: NodeId,
    arp_mux: NodeId,
    /// Link addresses of the interfaces ARP runs on.
    macs: FxDashMap<ScopeId, Mac>,
}

impl ArpFamily {
    pub fn new(graph: Arc<Graph>) -> Result<Self, GraphError> {
        let scope_mux = graph.add_mux(Accessor::Scope);
        let protocol = graph.add_protocol(Arc::new(ArpReceiver));
        let arp_mux = graph.add_mux(Accessor::ArpTarget);
        graph.connect_aa(scope_mux, protocol)?;
        graph.connect_ba(protocol, None, arp_mux)?;
        Ok(Self {
            graph,
            scope_mux,
            arp_mux,
            macs: Default::default(),
        })
    }

    /// The link address ARP uses on `scope`.
    pub fn mac(&self, scope: ScopeId) -> Option<Mac> {
        self.macs.get(&scope).map(|mac| *mac)
    }

    /// Whether addresses on `scope` need resolving.
    pub fn resolves(&self, scope: ScopeId) -> bool {
        self.macs.contains_key(&scope)
    }

    /// Connects an address to the ARP mux so it sees the packets about it.
    pub fn attach(&self, address: &Arc<Inet4Address>) -> Result<NodeId, GraphError> {
        let adapter = self.graph.add_adapter(address.clone());
        let key = Self::key(address);
        match self.graph.attach_created(self.arp_mux, key, adapter) {
            Some(winner) if winner == adapter => {
                address.set_arp_node(Some(adapter));
                Ok(adapter)
            }
            _ => Err(GraphError::Occupied(self.arp_mux)),
        }
    }

    pub fn detach(&self, address: &Inet4Address) {
        if let Some(adapter) = address.arp_node() {
            self.graph.remove_b(self.arp_mux, Some(Self::key(address)));
            self.graph.remove(adapter);
            address.set_arp_node(None);
        }
    }

    fn key(address: &Inet4Address) -> Key {
        Key::Scoped {
            scope: address.scope(),
            address: address.value(),
        }
    }
}

impl Family for ArpFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Arp
    }

    fn ethertype(&self) -> u16 {
        ethertype::ARP
    }

    fn graph(&self) -> &Graph {
        &self.graph
    }

    fn scope_mux(&self) -> NodeId {
        self.scope_mux
    }

    fn wants(&self, hardware: u16) -> bool {
        hardware == hardware::ETHERNET
    }

    fn interface_added(&self, link: &Link) -> Result<(), ConfigError> {
        self.macs.insert(link.scope, link.mac);
        Ok(())
    }

    fn interface_removed(&self, scope: ScopeId) {
        self.macs.remove(&scope);
    }
}

/// Validates ARP packets on the way up and tags them on the way down.
struct ArpReceiver;

impl Receiver for ArpReceiver {
    fn input(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        match ArpHeader::from_bytes(message.payload().iter().cloned()) {
            Ok(header) if header.sender_mac.is_multicast() => {
                debug!(sender = %header.sender_mac, "dropping ARP from a group address");
                false
            }
            Ok(_) => true,
            Err(error) => {
                debug!(%error, "dropping ARP packet");
                false
            }
        }
    }

    fn output(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        message.packet_type = ethertype::ARP;
        true
    }
}
