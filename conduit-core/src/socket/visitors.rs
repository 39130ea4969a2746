//! The structural walks a socket makes over the graph.

use super::{listen::AcceptFactory, SocketError};
use crate::{
    conduit::{Accessor, Conduit, ConduitKind, Graph, Heading, NodeId, Receiver, Visitor},
    message::Message,
};
use std::sync::Arc;
use tracing::debug;

/// Walks down from a transport protocol along the keys of a template
/// message, creating missing muxes and the connection protocol through the
/// factories on the way, and links the socket's adapter under the
/// connection protocol.
pub(crate) struct SocketBinder<'a> {
    template: &'a Message,
    adapter: NodeId,
    outcome: Option<Result<NodeId, SocketError>>,
}

impl<'a> SocketBinder<'a> {
    pub fn new(template: &'a Message, adapter: NodeId) -> Self {
        Self {
            template,
            adapter,
            outcome: None,
        }
    }

    /// The connection protocol the adapter was linked under.
    pub fn outcome(self) -> Result<NodeId, SocketError> {
        self.outcome.unwrap_or(Err(SocketError::Unsupported))
    }
}

impl Visitor for SocketBinder<'_> {
    fn at_protocol(
        &mut self,
        graph: &Graph,
        node: &Conduit,
        _receiver: &dyn Receiver,
        _heading: Heading,
    ) -> bool {
        match node.b() {
            Some(b) if graph.get(b).map_or(false, |b| b.is_mux()) => true,
            Some(_) => {
                self.outcome = Some(Err(SocketError::AddressInUse));
                false
            }
            None => {
                let linked = graph.connect_ba(node.id(), None, self.adapter);
                self.outcome = Some(linked.map(|_| node.id()).map_err(SocketError::from));
                false
            }
        }
    }

    fn at_mux(&mut self, graph: &Graph, node: &Conduit, accessor: &Accessor) -> Option<NodeId> {
        let key = accessor.key(self.template)?;
        if let Some(child) = graph.child(node.id(), key) {
            return Some(child);
        }
        let Some(factory) = graph.factory(node.id()) else {
            debug!(mux = node.id(), ?key, "nothing to bind to");
            return None;
        };
        match factory.create(graph, key, self.template) {
            Some(created) => graph.attach_created(node.id(), key, created),
            None => {
                self.outcome = Some(Err(SocketError::AddressInUse));
                None
            }
        }
    }
}

/// Unlinks a socket's adapter, removes the connection protocol above it and
/// prunes the muxes that become empty.
#[derive(Default)]
pub(crate) struct SocketDisconnector {
    top: Option<NodeId>,
    parent: Option<NodeId>,
}

impl SocketDisconnector {
    pub fn run(graph: &Graph, adapter: NodeId) {
        let mut disconnector = Self::default();
        graph.accept(adapter, Heading::A, &mut disconnector);
        match (disconnector.top, disconnector.parent) {
            (Some(_), Some(parent)) => graph.prune(parent),
            (Some(top), None) => {
                debug!(node = top, "connection protocol had no parent mux");
            }
            _ => {}
        }
    }
}

impl Visitor for SocketDisconnector {
    fn at_protocol(
        &mut self,
        graph: &Graph,
        node: &Conduit,
        _receiver: &dyn Receiver,
        _heading: Heading,
    ) -> bool {
        if self.top.is_some() {
            return false;
        }
        graph.remove_b(node.id(), None);
        self.top = Some(node.id());
        true
    }

    fn at_adapter(
        &mut self,
        _graph: &Graph,
        _node: &Conduit,
        _receiver: &dyn Receiver,
        _heading: Heading,
    ) -> bool {
        true
    }

    fn at_mux(&mut self, _graph: &Graph, _node: &Conduit, _accessor: &Accessor) -> Option<NodeId> {
        None
    }

    fn leaving_mux(&mut self, graph: &Graph, node: &Conduit, from: Option<NodeId>) -> bool {
        if let Some(from) = from {
            graph.detach_child(node.id(), from);
            graph.remove_tree(from);
        }
        self.parent = Some(node.id());
        false
    }
}

/// Climbs from a bound stream socket to its remote port mux and makes that
/// mux accept connections.
pub(crate) struct ListenInstaller {
    factory: Option<Arc<AcceptFactory>>,
    installed: Option<NodeId>,
}

impl ListenInstaller {
    pub fn new(factory: Arc<AcceptFactory>) -> Self {
        Self {
            factory: Some(factory),
            installed: None,
        }
    }

    /// The mux the factory went on.
    pub fn installed(&self) -> Option<NodeId> {
        self.installed
    }
}

impl Visitor for ListenInstaller {
    fn at_protocol(
        &mut self,
        _graph: &Graph,
        _node: &Conduit,
        _receiver: &dyn Receiver,
        _heading: Heading,
    ) -> bool {
        true
    }

    fn at_mux(&mut self, _graph: &Graph, _node: &Conduit, _accessor: &Accessor) -> Option<NodeId> {
        None
    }

    fn leaving_mux(&mut self, graph: &Graph, node: &Conduit, _from: Option<NodeId>) -> bool {
        if !matches!(node.kind(), ConduitKind::Mux(Accessor::RemotePort)) {
            return true;
        }
        if let Some(factory) = self.factory.take() {
            match graph.set_factory(node.id(), Some(factory.clone())) {
                Ok(previous) => {
                    factory.set_previous(previous);
                    self.installed = Some(node.id());
                }
                Err(error) => debug!(%error, "could not install the accept factory"),
            }
        }
        false
    }
}
