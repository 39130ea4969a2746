use super::InFamily;
use crate::{
    address::AddressKind,
    conduit::{Graph, Heading, NodeId, Receiver, Transporter},
    message::{Command, Message, HEADROOM},
    wire::{
        icmp::{self, kind, IcmpHeader},
        ipv4::protocol,
        BytesExt,
    },
};
use std::sync::Weak;
use tokio::sync::Notify;
use tracing::debug;

/// Checks ICMP messages on the way up and seals them on the way down.
pub(super) struct IcmpReceiver;

impl Receiver for IcmpReceiver {
    fn input(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        match icmp::verify(message.payload()) {
            Ok(_) => true,
            Err(error) => {
                debug!(%error, "dropping ICMP message");
                false
            }
        }
    }

    fn output(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        if message.len() < IcmpHeader::SIZE {
            return false;
        }
        icmp::seal(message.payload_mut());
        message.packet_type = protocol::ICMP as u16;
        true
    }
}

/// Answers echo requests for one local address.
pub(super) struct EchoResponder {
    family: Weak<InFamily>,
}

impl EchoResponder {
    pub fn new(family: Weak<InFamily>) -> Self {
        Self { family }
    }
}

impl Receiver for EchoResponder {
    fn input(&self, graph: &Graph, node: NodeId, message: &mut Message) -> bool {
        let Some(family) = self.family.upgrade() else {
            return false;
        };
        let (Some(local), Some(remote)) = (message.local.clone(), message.remote.clone()) else {
            return false;
        };
        if local.kind() != AddressKind::Local || remote.kind() == AddressKind::Unspecified {
            return false;
        }
        let mut reply = message.payload().to_vec();
        reply[0] = kind::ECHO_REPLY;
        let mut answer = Message::output(&reply, HEADROOM);
        answer.local = Some(local);
        answer.remote = Some(remote.clone());
        let Some(hop) = family.next_hop(&remote) else {
            return false;
        };
        let resolved = hop.kind() != AddressKind::Remote
            || hop.mac().is_some()
            || !family.arp.resolves(hop.scope());
        if resolved {
            graph.forward(node, Heading::A, &mut Transporter::new(&mut answer));
            return false;
        }
        // The requester is a stranger: resolve it first, off the input path.
        tokio::spawn(async move {
            let timeout = family.config().resolution_time();
            if family.resolve(&hop, timeout).await.is_ok() {
                family
                    .graph()
                    .forward(node, Heading::A, &mut Transporter::new(&mut answer));
            } else {
                debug!(remote = %remote.value(), "echo requester did not resolve");
            }
        });
        false
    }
}

/// Waits for the echo reply from one remote address.
#[derive(Default)]
pub(super) struct EchoObserver {
    notify: Notify,
}

impl EchoObserver {
    pub async fn replied(&self) {
        self.notify.notified().await
    }
}

impl Receiver for EchoObserver {
    fn input(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        if message.payload().get(4..8) == Some(&[0, 0, 0, 0][..]) {
            self.notify.notify_one();
        }
        false
    }
}

/// Turns a destination unreachable message into an error travelling up the
/// transport protocol the offending datagram came from.
pub(super) struct UnreachReceiver {
    family: Weak<InFamily>,
}

impl UnreachReceiver {
    pub fn new(family: Weak<InFamily>) -> Self {
        Self { family }
    }
}

impl Receiver for UnreachReceiver {
    fn input(&self, graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        let Some(family) = self.family.upgrade() else {
            return false;
        };
        let code = message.payload()[1];
        let Some(quoted) = message.payload().get(IcmpHeader::SIZE..) else {
            return false;
        };
        // The quoted header is cut short by the sender, so it is read field
        // by field rather than validated as a whole.
        let mut bytes = quoted.iter().cloned();
        let Some(version_and_ihl) = bytes.next_u8() else {
            return false;
        };
        let header_len = (version_and_ihl & 0x0f) as usize * 4;
        let mut fields = quoted.iter().cloned().skip(9);
        let (Some(number), Some(_checksum), Some(source), Some(destination)) = (
            fields.next_u8(),
            fields.next_u16_be(),
            fields.next_ipv4addr(),
            fields.next_ipv4addr(),
        ) else {
            return false;
        };
        let mut ports = quoted.iter().cloned().skip(header_len);
        let (Some(source_port), Some(destination_port)) = (ports.next_u16_be(), ports.next_u16_be())
        else {
            return false;
        };
        let Some(transport) = family.nodes().transport(number) else {
            debug!(protocol = number, "unreachable for a protocol with no error path");
            return false;
        };

        let scope = message.scope;
        let mut error = Message::output(&[], 0);
        error.command = Command::Error;
        error.error_code = code;
        error.scope = scope;
        error.local = family.lookup(scope, source);
        error.remote = Some(family.get_host_by_address(destination, scope));
        error.local_port = source_port;
        error.remote_port = destination_port;
        error.packet_type = number as u16;
        debug!(%destination, destination_port, code, "destination unreachable");
        graph.accept(transport, Heading::B, &mut Transporter::new(&mut error));
        false
    }
}
