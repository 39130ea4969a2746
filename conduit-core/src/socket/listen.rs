use super::Socket;
use crate::{
    conduit::{Accessor, ConduitFactory, Graph, Key, NodeId},
    family::inet4::{Endpoint, InFamily, StreamReceiver},
    message::{Command, Message},
    wire::tcp::{flags, TcpHeader},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};
use tokio::sync::mpsc;
use tracing::debug;

/// Sits on the remote port mux of a listening stream socket and opens a
/// connection, with its own socket, for every SYN from a new peer.
///
/// Under a new remote port it first creates a remote address mux carrying
/// this same factory, then under that the connection itself.
pub(crate) struct AcceptFactory {
    family: Weak<InFamily>,
    capacity: usize,
    backlog: mpsc::Sender<Socket>,
    previous: Mutex<Option<Arc<dyn ConduitFactory>>>,
    open: AtomicBool,
    this: Weak<AcceptFactory>,
}

impl AcceptFactory {
    pub fn new(family: &Arc<InFamily>, backlog: mpsc::Sender<Socket>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            family: Arc::downgrade(family),
            capacity: family.config().stream_capacity,
            backlog,
            previous: Mutex::new(None),
            open: AtomicBool::new(true),
            this: this.clone(),
        })
    }

    pub fn set_previous(&self, previous: Option<Arc<dyn ConduitFactory>>) {
        *self.previous.lock().unwrap() = previous;
    }

    pub fn previous(&self) -> Option<Arc<dyn ConduitFactory>> {
        self.previous.lock().unwrap().clone()
    }

    /// Stops accepting. Muxes this factory created become prunable.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn opens_connection(message: &Message) -> bool {
        TcpHeader::from_bytes(message.payload())
            .map_or(false, |header| header.has(flags::SYN) && !header.has(flags::ACK))
    }

    fn connection(&self, graph: &Graph, message: &Message) -> Option<NodeId> {
        let family = self.family.upgrade()?;
        let Ok(permit) = self.backlog.try_reserve() else {
            debug!(port = message.local_port, "backlog full, refusing connection");
            return None;
        };
        let endpoint = Endpoint::from_message(message)?;
        let receiver = StreamReceiver::passive(Arc::downgrade(&family), self.capacity, endpoint.clone());
        let stream = graph.add_protocol(Arc::new(receiver));
        match Socket::accepted(family, endpoint, stream) {
            Ok(socket) => {
                permit.send(socket);
                Some(stream)
            }
            Err(error) => {
                debug!(%error, "could not open an accepted socket");
                graph.remove(stream);
                None
            }
        }
    }
}

impl ConduitFactory for AcceptFactory {
    fn create(&self, graph: &Graph, key: Key, message: &Message) -> Option<NodeId> {
        if message.command != Command::Input || !self.listening() {
            return None;
        }
        if !Self::opens_connection(message) {
            return None;
        }
        match key {
            Key::Number(_) => {
                let this: Arc<dyn ConduitFactory> = self.this.upgrade()?;
                Some(graph.add_mux_with(Accessor::RemoteAddress, this))
            }
            Key::Address(_) => self.connection(graph, message),
            Key::Scoped { .. } => None,
        }
    }

    fn listening(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
