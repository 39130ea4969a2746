use super::{Accessor, Graph, Key, NodeId, Receiver};
use crate::message::Message;
use std::sync::Arc;

/// Builds the child of a mux the first time its key is seen.
///
/// Structural visitors (bind, connect) consult the factory of every mux on
/// their path. Packet delivery only consults a factory that is
/// [`listening`](ConduitFactory::listening), which is how a listening socket
/// accepts connections from peers it has not seen before.
pub trait ConduitFactory: Send + Sync {
    /// Creates the child for `key`, or `None` when no child can be made (for
    /// example when a backlog is full). The new node is not linked yet.
    fn create(&self, graph: &Graph, key: Key, message: &Message) -> Option<NodeId>;

    fn listening(&self) -> bool {
        false
    }
}

/// Creates a mux, optionally carrying a factory for its own children.
pub struct MuxFactory {
    accessor: Accessor,
    child: Option<Arc<dyn ConduitFactory>>,
}

impl MuxFactory {
    pub fn new(accessor: Accessor, child: Option<Arc<dyn ConduitFactory>>) -> Self {
        Self { accessor, child }
    }
}

impl ConduitFactory for MuxFactory {
    fn create(&self, graph: &Graph, _key: Key, _message: &Message) -> Option<NodeId> {
        Some(match &self.child {
            Some(factory) => graph.add_mux_with(self.accessor, factory.clone()),
            None => graph.add_mux(self.accessor),
        })
    }
}

type MakeReceiver = dyn Fn(&Message) -> Option<Arc<dyn Receiver>> + Send + Sync;

/// Creates a protocol whose receiver is built from the message that asked
/// for it.
pub struct ProtocolFactory {
    make: Box<MakeReceiver>,
}

impl ProtocolFactory {
    pub fn new(
        make: impl Fn(&Message) -> Option<Arc<dyn Receiver>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            make: Box::new(make),
        }
    }
}

impl ConduitFactory for ProtocolFactory {
    fn create(&self, graph: &Graph, _key: Key, message: &Message) -> Option<NodeId> {
        let receiver = (self.make)(message)?;
        Some(graph.add_protocol(receiver))
    }
}
