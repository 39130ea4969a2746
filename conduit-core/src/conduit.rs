//! The protocol graph.
//!
//! Every node ("conduit") lives in one [`Graph`] arena and is addressed by a
//! [`NodeId`]. A node has an A side and a B side. For protocols and adapters
//! each side is a single link; for a [`Mux`](ConduitKind::Mux) the B side is a
//! map from [`Key`] to child. Messages and structural queries travel the graph
//! as [`Visitor`]s, see [`Graph::accept`].
//!
//! Links are changed under the owning node's lock only. Traversals copy the
//! links they need and never hold a lock while a receiver or visitor runs, so
//! a receiver may start a new traversal or rewire the graph.

mod accessor;
pub use accessor::{Accessor, Key};

mod factory;
pub use factory::{ConduitFactory, MuxFactory, ProtocolFactory};

mod visitor;
pub use visitor::{Transporter, Visitor};

use crate::{message::Message, FxDashMap};
use rustc_hash::FxHashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use thiserror::Error as ThisError;
use tracing::debug;

/// A stable handle to a node in a [`Graph`].
pub type NodeId = u64;

/// The callbacks a protocol or adapter provides. Each returns whether the
/// traversal should go on to the next node.
pub trait Receiver: Send + Sync {
    fn input(&self, graph: &Graph, node: NodeId, message: &mut Message) -> bool {
        let _ = (graph, node, message);
        true
    }

    fn output(&self, graph: &Graph, node: NodeId, message: &mut Message) -> bool {
        let _ = (graph, node, message);
        true
    }

    fn error(&self, graph: &Graph, node: NodeId, message: &mut Message) -> bool {
        let _ = (graph, node, message);
        true
    }

    /// Answers a read request. Only receivers that buffer data override this.
    fn read(&self, graph: &Graph, node: NodeId, message: &mut Message) -> bool {
        let _ = (graph, node, message);
        false
    }
}

/// Which side of the current node a traversal continues toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Heading {
    A,
    B,
}

pub enum ConduitKind {
    /// Processes one header and owns its receiver.
    Protocol(Arc<dyn Receiver>),
    /// Bridges the graph to something outside it, such as a socket or a
    /// device.
    Adapter(Arc<dyn Receiver>),
    /// Routes toward one of many children by a key taken from the message.
    Mux(Accessor),
}

#[derive(Default)]
struct Links {
    a: Option<NodeId>,
    b: Option<NodeId>,
    children: FxHashMap<Key, NodeId>,
    factory: Option<Arc<dyn ConduitFactory>>,
}

/// A node of the graph.
pub struct Conduit {
    id: NodeId,
    kind: ConduitKind,
    links: Mutex<Links>,
}

impl Conduit {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &ConduitKind {
        &self.kind
    }

    pub fn a(&self) -> Option<NodeId> {
        self.links.lock().unwrap().a
    }

    pub fn b(&self) -> Option<NodeId> {
        self.links.lock().unwrap().b
    }

    pub fn is_mux(&self) -> bool {
        matches!(self.kind, ConduitKind::Mux(_))
    }

    pub fn is_adapter(&self) -> bool {
        matches!(self.kind, ConduitKind::Adapter(_))
    }

    fn sides(&self) -> (Option<NodeId>, Option<NodeId>) {
        let links = self.links.lock().unwrap();
        (links.a, links.b)
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
    #[error("There is no conduit {0}")]
    UnknownNode(NodeId),
    #[error("Conduit {0} is a mux and needs a key to link its B side")]
    KeyRequired(NodeId),
    #[error("The B side of conduit {0} is already linked")]
    Occupied(NodeId),
}

/// The arena every conduit lives in.
#[derive(Default)]
pub struct Graph {
    nodes: FxDashMap<NodeId, Arc<Conduit>>,
    next_id: AtomicU64,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, kind: ConduitKind) -> NodeId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conduit = Conduit {
            id,
            kind,
            links: Default::default(),
        };
        self.nodes.insert(id, Arc::new(conduit));
        id
    }

    pub fn add_protocol(&self, receiver: Arc<dyn Receiver>) -> NodeId {
        self.add(ConduitKind::Protocol(receiver))
    }

    pub fn add_adapter(&self, receiver: Arc<dyn Receiver>) -> NodeId {
        self.add(ConduitKind::Adapter(receiver))
    }

    pub fn add_mux(&self, accessor: Accessor) -> NodeId {
        self.add(ConduitKind::Mux(accessor))
    }

    /// Adds a mux that creates missing children with `factory`.
    pub fn add_mux_with(&self, accessor: Accessor, factory: Arc<dyn ConduitFactory>) -> NodeId {
        let id = self.add_mux(accessor);
        if let Some(node) = self.get(id) {
            node.links.lock().unwrap().factory = Some(factory);
        }
        id
    }

    /// Looks a node up. The returned handle keeps the node alive even if it
    /// is removed from the arena meanwhile.
    pub fn get(&self, id: NodeId) -> Option<Arc<Conduit>> {
        self.nodes.get(&id).map(|entry| entry.value().clone())
    }

    fn node(&self, id: NodeId) -> Result<Arc<Conduit>, GraphError> {
        self.get(id).ok_or(GraphError::UnknownNode(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn set_a(&self, id: NodeId, to: NodeId) -> Result<(), GraphError> {
        self.node(id)?.links.lock().unwrap().a = Some(to);
        Ok(())
    }

    fn set_b(&self, id: NodeId, key: Option<Key>, to: NodeId) -> Result<(), GraphError> {
        let node = self.node(id)?;
        let mut links = node.links.lock().unwrap();
        match (node.is_mux(), key) {
            (true, Some(key)) => match links.children.get(&key) {
                Some(child) if *child != to => Err(GraphError::Occupied(id))?,
                _ => {
                    links.children.insert(key, to);
                }
            },
            (true, None) => Err(GraphError::KeyRequired(id))?,
            (false, _) => links.b = Some(to),
        }
        Ok(())
    }

    /// Links the A sides of `x` and `y` to each other.
    pub fn connect_aa(&self, x: NodeId, y: NodeId) -> Result<(), GraphError> {
        self.node(y)?;
        self.set_a(x, y)?;
        self.set_a(y, x)
    }

    /// Links the A side of `x` to the B side of `y`. `key` selects the child
    /// slot when `y` is a mux, and must not hold another child already.
    pub fn connect_ab(&self, x: NodeId, y: NodeId, key: Option<Key>) -> Result<(), GraphError> {
        self.node(x)?;
        self.set_b(y, key, x)?;
        self.set_a(x, y)
    }

    /// Links the B side of `x` to the A side of `y`. `key` selects the child
    /// slot when `x` is a mux.
    pub fn connect_ba(&self, x: NodeId, key: Option<Key>, y: NodeId) -> Result<(), GraphError> {
        self.connect_ab(y, x, key)
    }

    /// Links the B sides of two muxes to each other, each under its own key.
    /// Neither side is changed if either key is already taken.
    pub fn connect_bb(&self, x: NodeId, x_key: Key, y: NodeId, y_key: Key) -> Result<(), GraphError> {
        self.node(y)?;
        self.set_b(x, Some(x_key), y)?;
        if let Err(error) = self.set_b(y, Some(y_key), x) {
            let node = self.node(x)?;
            let mut links = node.links.lock().unwrap();
            if links.children.get(&x_key) == Some(&y) {
                links.children.remove(&x_key);
            }
            Err(error)?
        }
        Ok(())
    }

    /// Unlinks the B side of `x` (the child under `key` for a mux) and
    /// returns what was there. The child's A side is cleared if it pointed
    /// back at `x`.
    pub fn remove_b(&self, x: NodeId, key: Option<Key>) -> Option<NodeId> {
        let node = self.get(x)?;
        let removed = {
            let mut links = node.links.lock().unwrap();
            match key {
                Some(key) if node.is_mux() => links.children.remove(&key),
                _ => links.b.take(),
            }
        }?;
        if let Some(child) = self.get(removed) {
            let mut links = child.links.lock().unwrap();
            if links.a == Some(x) {
                links.a = None;
            }
        }
        Some(removed)
    }

    /// Unlinks `child` from whichever key of `mux` holds it.
    pub fn detach_child(&self, mux: NodeId, child: NodeId) -> Option<Key> {
        let node = self.get(mux)?;
        let key = {
            let links = node.links.lock().unwrap();
            links
                .children
                .iter()
                .find_map(|(key, id)| (*id == child).then_some(*key))
        }?;
        self.remove_b(mux, Some(key));
        Some(key)
    }

    /// Removes a node from the arena. Its neighbors keep their links until
    /// they are unlinked with [`Graph::remove_b`].
    pub fn remove(&self, id: NodeId) -> Option<Arc<Conduit>> {
        self.nodes.remove(&id).map(|(_, node)| node)
    }

    /// Removes a node and everything it owns on its B side.
    pub fn remove_tree(&self, id: NodeId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let Some(node) = self.remove(id) else {
                continue;
            };
            let links = node.links.lock().unwrap();
            let owned = links.b.iter().chain(links.children.values());
            for child in owned {
                if self.get(*child).and_then(|c| c.a()) == Some(id) {
                    pending.push(*child);
                }
            }
        }
    }

    /// Removes `mux` if it has become empty, then its parent if that has
    /// become empty too, stopping at muxes with a listening factory and at
    /// the first parent that is not a mux.
    pub fn prune(&self, mux: NodeId) {
        let mut current = mux;
        while let Some(node) = self.get(current) {
            let parent = {
                let links = node.links.lock().unwrap();
                let listening = links.factory.as_ref().map_or(false, |f| f.listening());
                if !node.is_mux() || !links.children.is_empty() || listening {
                    return;
                }
                links.a
            };
            let Some(parent) = parent.filter(|p| self.get(*p).map_or(false, |p| p.is_mux())) else {
                return;
            };
            self.detach_child(parent, current);
            self.remove(current);
            debug!(node = current, "pruned empty mux");
            current = parent;
        }
    }

    pub fn child(&self, mux: NodeId, key: Key) -> Option<NodeId> {
        let node = self.get(mux)?;
        let links = node.links.lock().unwrap();
        links.children.get(&key).copied()
    }

    pub fn children(&self, mux: NodeId) -> Vec<(Key, NodeId)> {
        self.get(mux)
            .map(|node| {
                let links = node.links.lock().unwrap();
                links.children.iter().map(|(k, v)| (*k, *v)).collect()
            })
            .unwrap_or_default()
    }

    pub fn factory(&self, mux: NodeId) -> Option<Arc<dyn ConduitFactory>> {
        self.get(mux)?.links.lock().unwrap().factory.clone()
    }

    /// Replaces the factory of `mux`, returning the previous one.
    pub fn set_factory(
        &self,
        mux: NodeId,
        factory: Option<Arc<dyn ConduitFactory>>,
    ) -> Result<Option<Arc<dyn ConduitFactory>>, GraphError> {
        let node = self.node(mux)?;
        let mut links = node.links.lock().unwrap();
        Ok(std::mem::replace(&mut links.factory, factory))
    }

    /// Installs a freshly created child under `key` unless one is already
    /// there, in which case the new subtree is discarded. Returns the child
    /// that holds the key.
    pub fn attach_created(&self, mux: NodeId, key: Key, created: NodeId) -> Option<NodeId> {
        let node = self.get(mux)?;
        let winner = {
            let mut links = node.links.lock().unwrap();
            *links.children.entry(key).or_insert(created)
        };
        if winner == created {
            self.set_a(created, mux).ok()?;
        } else {
            self.remove_tree(created);
        }
        Some(winner)
    }

    /// Walks the graph from `start`, handing each node to `visitor`.
    ///
    /// `heading` gives the direction at the start node. After that the
    /// direction follows from where the traversal came from: a protocol or
    /// adapter entered from its A side continues out its B side and the other
    /// way around; a mux entered from its A side asks the visitor for a child,
    /// and a mux entered from a child continues out its A side.
    ///
    /// Returns false if the traversal was abandoned, either by a receiver or
    /// because a mux had no child for the message.
    pub fn accept(&self, start: NodeId, heading: Heading, visitor: &mut dyn Visitor) -> bool {
        self.traverse(Some(start), None, heading, visitor)
    }

    /// Like [`Graph::accept`], but starts at the neighbor of `from` on the
    /// `heading` side without visiting `from` itself.
    pub fn forward(&self, from: NodeId, heading: Heading, visitor: &mut dyn Visitor) -> bool {
        let Some(node) = self.get(from) else {
            return false;
        };
        let (a, b) = node.sides();
        let next = match heading {
            Heading::A => a,
            Heading::B => b,
        };
        match next {
            Some(next) => self.traverse(Some(next), Some(from), heading, visitor),
            None => true,
        }
    }

    fn traverse(
        &self,
        mut next: Option<NodeId>,
        mut from: Option<NodeId>,
        heading: Heading,
        visitor: &mut dyn Visitor,
    ) -> bool {
        while let Some(id) = next {
            let Some(node) = self.get(id) else {
                debug!(node = id, "traversal reached a removed conduit");
                return false;
            };
            let (a, b) = node.sides();
            let toward = match from {
                Some(from) if Some(from) == a => Heading::B,
                Some(_) => Heading::A,
                None => heading,
            };
            let side = match toward {
                Heading::A => a,
                Heading::B => b,
            };
            next = match &node.kind {
                ConduitKind::Protocol(receiver) => {
                    if !visitor.at_protocol(self, &node, receiver.as_ref(), toward) {
                        return false;
                    }
                    side
                }
                ConduitKind::Adapter(receiver) => {
                    if !visitor.at_adapter(self, &node, receiver.as_ref(), toward) {
                        return false;
                    }
                    side
                }
                ConduitKind::Mux(accessor) => match toward {
                    Heading::B => match visitor.at_mux(self, &node, accessor) {
                        Some(child) => Some(child),
                        None => return false,
                    },
                    Heading::A => {
                        if !visitor.leaving_mux(self, &node, from) {
                            return false;
                        }
                        a
                    }
                },
            };
            from = Some(id);
        }
        true
    }
}
