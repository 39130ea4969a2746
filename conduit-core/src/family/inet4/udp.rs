use super::InFamily;
use crate::{
    address::AddressKind,
    conduit::{Graph, Heading, NodeId, Receiver, Transporter},
    message::{Message, HEADROOM},
    wire::{
        icmp::{unreachable, IcmpHeader},
        ipv4::protocol,
        udp::{build_udp_header, UdpHeader, HEADER_OCTETS},
    },
};
use std::sync::Weak;
use tracing::debug;

/// The UDP protocol.
pub(super) struct UdpReceiver;

impl Receiver for UdpReceiver {
    fn input(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        let header = match UdpHeader::from_bytes_ipv4(
            message.payload(),
            message.remote_value(),
            message.local_value(),
        ) {
            Ok(header) => header,
            Err(error) => {
                debug!(%error, "dropping UDP datagram");
                return false;
            }
        };
        message.local_port = header.destination;
        message.remote_port = header.source;
        message.set_len(header.length as usize);
        message.move_position(HEADER_OCTETS as isize);
        true
    }

    fn output(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        let header = build_udp_header(
            message.local_value(),
            message.local_port,
            message.remote_value(),
            message.remote_port,
            message.payload(),
        );
        let header = match header {
            Ok(header) => header,
            Err(error) => {
                debug!(%error, "dropping UDP output");
                return false;
            }
        };
        message.move_position(-(HEADER_OCTETS as isize));
        message.fix(HEADER_OCTETS).copy_from_slice(&header);
        message.packet_type = protocol::UDP as u16;
        true
    }

    fn error(&self, _graph: &Graph, _node: NodeId, _message: &mut Message) -> bool {
        true
    }
}

/// Sits under the wildcard port and answers datagrams for ports nobody has
/// bound with an ICMP port unreachable.
pub(super) struct PortUnreachable {
    family: Weak<InFamily>,
}

impl PortUnreachable {
    pub fn new(family: Weak<InFamily>) -> Self {
        Self { family }
    }
}

impl Receiver for PortUnreachable {
    fn input(&self, graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        let Some(family) = self.family.upgrade() else {
            return false;
        };
        let (Some(local), Some(remote)) = (message.local.clone(), message.remote.clone()) else {
            return false;
        };
        if local.kind() != AddressKind::Local || remote.kind() == AddressKind::Unspecified {
            debug!(port = message.local_port, "no socket for broadcast datagram");
            return false;
        }
        debug!(port = message.local_port, from = %remote.value(), "port unreachable");

        let datagram = message.datagram();
        let header_len = (datagram[0] & 0x0f) as usize * 4;
        let quoted = &datagram[..datagram.len().min(header_len + HEADER_OCTETS)];
        let mut reply = vec![0u8; IcmpHeader::SIZE];
        IcmpHeader::unreachable(unreachable::PORT).write(&mut reply);
        reply.extend_from_slice(quoted);

        let mut answer = Message::output(&reply, HEADROOM);
        answer.local = Some(local);
        answer.remote = Some(remote);
        graph.accept(
            family.nodes().icmp,
            Heading::A,
            &mut Transporter::new(&mut answer),
        );
        false
    }

    fn error(&self, _graph: &Graph, _node: NodeId, _message: &mut Message) -> bool {
        false
    }
}
