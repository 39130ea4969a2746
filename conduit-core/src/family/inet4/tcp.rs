use crate::{
    conduit::{Graph, NodeId, Receiver},
    message::Message,
    wire::{
        ipv4::protocol,
        tcp::{self, TcpHeader},
    },
};
use tracing::debug;

/// The TCP protocol. It checks segments and reads their ports. The header
/// stays in place for the connection's [`StreamReceiver`](super::StreamReceiver).
pub(super) struct TcpReceiver;

impl Receiver for TcpReceiver {
    fn input(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        let segment = message.payload();
        if let Err(error) = tcp::verify_ipv4(segment, message.remote_value(), message.local_value())
        {
            debug!(%error, "dropping TCP segment");
            return false;
        }
        match TcpHeader::from_bytes(segment) {
            Ok(header) => {
                message.local_port = header.destination;
                message.remote_port = header.source;
                true
            }
            Err(error) => {
                debug!(%error, "dropping TCP segment");
                false
            }
        }
    }

    fn output(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        let (source, destination) = (message.local_value(), message.remote_value());
        tcp::seal_ipv4(message.payload_mut(), source, destination);
        message.packet_type = protocol::TCP as u16;
        true
    }

    fn error(&self, _graph: &Graph, _node: NodeId, _message: &mut Message) -> bool {
        true
    }
}
