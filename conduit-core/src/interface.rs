//! Network interfaces.
//!
//! An interface joins a [`Device`] to the conduit graph. Its adapter sits at
//! the bottom of the graph with a mux keyed by packet type above it, and the
//! families link their scope muxes into that mux. A pump task reads frames
//! from the device and sends them up until the interface is stopped.

use crate::{
    conduit::{Accessor, Graph, GraphError, Heading, NodeId, Receiver, Transporter},
    config::ConfigError,
    device::Device,
    family::Link,
    logging::frame_event,
    message::{Message, ScopeId},
    wire::{
        arp::hardware,
        dix::{self, ethertype, DixHeader},
        Mac,
    },
};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The largest frame a pump reads: a maximal IP packet on loopback.
const READ_BUFFER: usize = u16::MAX as usize + dix::HEADER_LEN;

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("Every interface slot is in use")]
    TableFull,
    #[error("Link type {0} is not supported")]
    UnknownLinkType(u16),
    #[error("There is no interface with scope {0}")]
    UnknownScope(ScopeId),
    #[error("Interfaces must be added from within a tokio runtime")]
    NoRuntime,
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct Interface {
    scope: ScopeId,
    hardware: u16,
    mac: Mac,
    device: Arc<dyn Device>,
    adapter: NodeId,
    type_mux: NodeId,
    cancel: CancellationToken,
}

impl Interface {
    /// Adds the interface's nodes to `graph`. Nothing is read from the
    /// device until [`Interface::start`].
    pub fn new(
        graph: &Graph,
        scope: ScopeId,
        device: Arc<dyn Device>,
        hardware: u16,
    ) -> Result<Self, InterfaceError> {
        let mac = device.mac();
        let receiver: Arc<dyn Receiver> = match hardware {
            hardware::ETHERNET => Arc::new(DixReceiver {
                scope,
                mac,
                device: device.clone(),
            }),
            hardware::LOOPBACK => Arc::new(LoopbackReceiver {
                scope,
                device: device.clone(),
            }),
            other => Err(InterfaceError::UnknownLinkType(other))?,
        };
        let adapter = graph.add_adapter(receiver);
        let type_mux = graph.add_mux(Accessor::Type);
        graph.connect_ba(adapter, None, type_mux)?;
        Ok(Self {
            scope,
            hardware,
            mac,
            device,
            adapter,
            type_mux,
            cancel: CancellationToken::new(),
        })
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn hardware(&self) -> u16 {
        self.hardware
    }

    pub fn mac(&self) -> Mac {
        self.mac
    }

    /// What the families need to link themselves to this interface.
    pub fn link(&self) -> Link {
        Link {
            scope: self.scope,
            type_mux: self.type_mux,
            mac: self.mac,
            hardware: self.hardware,
        }
    }

    /// Spawns the pump on the current runtime.
    pub fn start(&self, graph: Arc<Graph>) -> Result<(), InterfaceError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| InterfaceError::NoRuntime)?;
        runtime.spawn(pump(
            graph,
            self.device.clone(),
            self.adapter,
            self.scope,
            self.cancel.clone(),
        ));
        info!(scope = self.scope, mac = %self.mac, "interface up");
        Ok(())
    }

    /// Stops the pump and removes the interface's nodes. The families must
    /// have been detached already.
    pub fn stop(&self, graph: &Graph) {
        self.cancel.cancel();
        graph.remove(self.type_mux);
        graph.remove(self.adapter);
        info!(scope = self.scope, "interface down");
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump(
    graph: Arc<Graph>,
    device: Arc<dyn Device>,
    adapter: NodeId,
    scope: ScopeId,
    cancel: CancellationToken,
) {
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => break,
            read = device.read(&mut buffer) => match read {
                Ok(len) => len,
                Err(error) => {
                    warn!(scope, %error, "device failed, stopping the interface");
                    break;
                }
            },
        };
        let mut message = Message::input(&buffer[..len], scope);
        graph.accept(adapter, Heading::B, &mut Transporter::new(&mut message));
    }
    debug!(scope, "pump stopped");
}

/// Ethernet II framing.
struct DixReceiver {
    scope: ScopeId,
    mac: Mac,
    device: Arc<dyn Device>,
}

impl Receiver for DixReceiver {
    fn input(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        let Some(bytes) = message.header(dix::HEADER_LEN) else {
            debug!(scope = self.scope, len = message.len(), "dropping runt frame");
            return false;
        };
        let Ok(header) = DixHeader::from_bytes(bytes.iter().cloned()) else {
            return false;
        };
        if header.destination != self.mac && !header.destination.is_broadcast() {
            return false;
        }
        frame_event(self.scope, "in", header.ethertype, message.len());
        message.link_source = Some(header.source);
        message.packet_type = header.ethertype;
        message.move_position(dix::HEADER_LEN as isize);
        true
    }

    fn output(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        let destination = message
            .link_destination
            .or_else(|| {
                let hop = message.next_hop.as_ref()?;
                if hop.value().is_broadcast() {
                    Some(Mac::BROADCAST)
                } else {
                    hop.mac()
                }
            });
        let Some(destination) = destination else {
            debug!(scope = self.scope, "no link address for the next hop, dropping");
            return false;
        };
        if message.packet_type != ethertype::IPV4 && message.packet_type != ethertype::ARP {
            debug!(packet_type = message.packet_type, "not framing an unknown packet type");
            return false;
        }
        message.move_position(-(dix::HEADER_LEN as isize));
        DixHeader::new(destination, self.mac, message.packet_type)
            .write(message.fix(dix::HEADER_LEN));
        frame_event(self.scope, "out", message.packet_type, message.len());
        if let Err(error) = self.device.write(message.payload()) {
            warn!(scope = self.scope, %error, "device write failed");
            return false;
        }
        true
    }
}

/// Loopback carries bare IP packets.
struct LoopbackReceiver {
    scope: ScopeId,
    device: Arc<dyn Device>,
}

impl Receiver for LoopbackReceiver {
    fn input(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        frame_event(self.scope, "in", ethertype::IPV4, message.len());
        message.packet_type = ethertype::IPV4;
        true
    }

    fn output(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        if message.packet_type != ethertype::IPV4 {
            return false;
        }
        frame_event(self.scope, "out", message.packet_type, message.len());
        if let Err(error) = self.device.write(message.payload()) {
            warn!(scope = self.scope, %error, "loopback write failed");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Segment, SegmentPort};

    struct Count(std::sync::atomic::AtomicUsize);

    impl Receiver for Count {
        fn input(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
            assert_eq!(message.payload(), b"payload");
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            false
        }
    }

    fn frame(destination: Mac) -> Vec<u8> {
        let mut frame = vec![0u8; dix::HEADER_LEN];
        DixHeader::new(destination, Mac::new([2, 0, 0, 0, 0, 9]), ethertype::IPV4)
            .write(&mut frame);
        frame.extend_from_slice(b"payload");
        frame
    }

    #[test]
    fn frames_for_others_are_ignored() {
        let graph = Graph::new();
        let own = Mac::new([2, 0, 0, 0, 0, 1]);
        let segment = Segment::new();
        let port: Arc<SegmentPort> = Arc::new(segment.port(own));
        let interface = Interface::new(&graph, 1, port, hardware::ETHERNET).unwrap();
        let count = Arc::new(Count(Default::default()));
        let above = graph.add_protocol(count.clone());
        graph
            .connect_ba(
                interface.type_mux,
                Some(crate::conduit::Key::Number(ethertype::IPV4 as u32)),
                above,
            )
            .unwrap();

        for destination in [own, Mac::BROADCAST, Mac::new([2, 0, 0, 0, 0, 7])] {
            let mut message = Message::input(&frame(destination), 1);
            graph.accept(interface.adapter, Heading::B, &mut Transporter::new(&mut message));
        }
        assert_eq!(count.0.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_link_types_are_refused() {
        let graph = Graph::new();
        let device = Arc::new(crate::device::Loopback::new());
        assert!(matches!(
            Interface::new(&graph, 1, device, 0xffff),
            Err(InterfaceError::UnknownLinkType(0xffff))
        ));
    }

    #[test]
    fn starting_needs_a_runtime() {
        let graph = Arc::new(Graph::new());
        let device = Arc::new(crate::device::Loopback::new());
        let interface = Interface::new(&graph, 1, device, hardware::LOOPBACK).unwrap();
        assert_eq!(interface.start(graph.clone()), Err(InterfaceError::NoRuntime));
    }
}
