use super::{Accessor, Conduit, Graph, Heading, NodeId, Receiver};
use crate::message::{Command, Message};
use tracing::debug;

/// Something that walks the graph. See [`Graph::accept`].
pub trait Visitor {
    /// Visits a protocol. Returning false abandons the traversal.
    fn at_protocol(
        &mut self,
        graph: &Graph,
        node: &Conduit,
        receiver: &dyn Receiver,
        heading: Heading,
    ) -> bool;

    /// Visits an adapter. Treated like a protocol unless overridden.
    fn at_adapter(
        &mut self,
        graph: &Graph,
        node: &Conduit,
        receiver: &dyn Receiver,
        heading: Heading,
    ) -> bool {
        self.at_protocol(graph, node, receiver, heading)
    }

    /// Picks the child of a mux entered from its A side. `None` abandons the
    /// traversal.
    fn at_mux(&mut self, graph: &Graph, node: &Conduit, accessor: &Accessor) -> Option<NodeId>;

    /// Called when a traversal climbs out of a mux from the child `from`.
    fn leaving_mux(&mut self, graph: &Graph, node: &Conduit, from: Option<NodeId>) -> bool {
        let _ = (graph, node, from);
        true
    }
}

/// Delivers a message, calling the receiver method its command selects.
pub struct Transporter<'a> {
    message: &'a mut Message,
}

impl<'a> Transporter<'a> {
    pub fn new(message: &'a mut Message) -> Self {
        Self { message }
    }
}

impl Visitor for Transporter<'_> {
    fn at_protocol(
        &mut self,
        graph: &Graph,
        node: &Conduit,
        receiver: &dyn Receiver,
        _heading: Heading,
    ) -> bool {
        let message = &mut *self.message;
        match message.command {
            Command::Input => receiver.input(graph, node.id(), message),
            Command::Output => receiver.output(graph, node.id(), message),
            Command::Error => receiver.error(graph, node.id(), message),
            Command::Read => receiver.read(graph, node.id(), message),
        }
    }

    /// Looks for the exact key, then the wildcard key, then asks a listening
    /// factory to create the child.
    fn at_mux(&mut self, graph: &Graph, node: &Conduit, accessor: &Accessor) -> Option<NodeId> {
        let Some(key) = accessor.key(self.message) else {
            debug!(mux = node.id(), ?accessor, "no key in message, dropping");
            return None;
        };
        if let Some(child) = graph.child(node.id(), key) {
            return Some(child);
        }
        if let Some(child) = accessor
            .wildcard()
            .filter(|wildcard| *wildcard != key)
            .and_then(|wildcard| graph.child(node.id(), wildcard))
        {
            return Some(child);
        }
        if let Some(factory) = graph.factory(node.id()).filter(|f| f.listening()) {
            if let Some(created) = factory.create(graph, key, self.message) {
                return graph.attach_created(node.id(), key, created);
            }
        }
        debug!(mux = node.id(), ?key, "no conduit for key, dropping");
        None
    }
}
