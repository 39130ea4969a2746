use super::InFamily;
use crate::{
    address::AddressKind,
    conduit::{Graph, NodeId, Receiver},
    message::Message,
    wire::{
        dix::ethertype,
        ipv4::{Ipv4Header, Ipv4HeaderBuilder},
    },
};
use std::sync::Weak;
use tracing::debug;

/// The IPv4 protocol.
pub(super) struct InReceiver {
    family: Weak<InFamily>,
}

impl InReceiver {
    pub fn new(family: Weak<InFamily>) -> Self {
        Self { family }
    }
}

impl Receiver for InReceiver {
    fn input(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        let Some(family) = self.family.upgrade() else {
            return false;
        };
        let header = match Ipv4Header::from_bytes(message.payload()) {
            Ok(header) => header,
            Err(error) => {
                debug!(%error, "dropping IPv4 packet");
                return false;
            }
        };
        if header.is_fragment() {
            debug!(source = %header.source, "dropping fragment, reassembly is not supported");
            return false;
        }
        let scope = message.scope;

        let Some(local) = family.lookup(scope, header.destination).or_else(|| {
            (Some(scope) == family.loopback_scope())
                .then(|| family.local(header.destination))
                .flatten()
        }) else {
            debug!(destination = %header.destination, scope, "not addressed to us");
            return false;
        };
        if matches!(local.kind(), AddressKind::Remote) {
            debug!(destination = %header.destination, scope, "not addressed to us");
            return false;
        }

        let remote = family.get_host_by_address(header.source, scope);
        if let Some(mac) = message.link_source {
            let on_link = family
                .source_on(scope)
                .map_or(false, |source| source.contains(header.source));
            if remote.kind() == AddressKind::Remote && on_link {
                remote.learn(mac);
            }
        }

        message.set_len(header.total_length as usize);
        message.network_offset = message.position();
        message.local = Some(local);
        message.remote = Some(remote);
        message.packet_type = header.protocol as u16;
        message.move_position(header.header_len() as isize);
        true
    }

    fn output(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        let Some(family) = self.family.upgrade() else {
            return false;
        };
        let (Some(local), Some(remote)) = (message.local.clone(), message.remote.clone()) else {
            debug!("dropping IPv4 output without addresses");
            return false;
        };
        let Some(hop) = family.next_hop(&remote) else {
            debug!(destination = %remote.value(), "no route");
            return false;
        };
        let header = Ipv4HeaderBuilder::new(
            local.value(),
            remote.value(),
            message.packet_type as u8,
            message.len(),
        )
        .identification(family.next_identification())
        .time_to_live(family.config().default_ttl)
        .build();
        let header = match header {
            Ok(header) => header,
            Err(error) => {
                debug!(%error, "dropping IPv4 output");
                return false;
            }
        };
        message.move_position(-(header.len() as isize));
        message.fix(header.len()).copy_from_slice(&header);
        message.network_offset = message.position();
        message.scope = hop.scope();
        message.next_hop = Some(hop);
        message.packet_type = ethertype::IPV4;
        true
    }

    fn error(&self, _graph: &Graph, _node: NodeId, _message: &mut Message) -> bool {
        true
    }
}
