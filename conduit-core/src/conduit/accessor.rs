use crate::{
    message::{Message, ScopeId},
    wire::{arp::ArpHeader, Ipv4Address},
};

/// A mux key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    /// A port, protocol number, EtherType, ICMP type or scope.
    Number(u32),
    Address(Ipv4Address),
    /// An address on a particular interface.
    Scoped { scope: ScopeId, address: Ipv4Address },
}

/// Derives a mux key from a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Accessor {
    /// The packet type tag.
    Type,
    Scope,
    LocalPort,
    RemotePort,
    LocalAddress,
    RemoteAddress,
    /// The first byte of an ICMP message.
    IcmpType,
    /// The address an ARP packet is about: the target of a request, the
    /// sender of a reply.
    ArpTarget,
}

impl Accessor {
    pub fn key(&self, message: &Message) -> Option<Key> {
        Some(match self {
            Self::Type => Key::Number(message.packet_type as u32),
            Self::Scope => Key::Number(message.scope as u32),
            Self::LocalPort => Key::Number(message.local_port as u32),
            Self::RemotePort => Key::Number(message.remote_port as u32),
            Self::LocalAddress => Key::Address(message.local_value()),
            Self::RemoteAddress => Key::Address(message.remote_value()),
            Self::IcmpType => Key::Number(*message.payload().first()? as u32),
            Self::ArpTarget => {
                let header = ArpHeader::from_bytes(message.payload().iter().cloned()).ok()?;
                Key::Scoped {
                    scope: message.scope,
                    address: header.subject(),
                }
            }
        })
    }

    /// The key that matches anything at this level, if the level has one.
    pub fn wildcard(&self) -> Option<Key> {
        match self {
            Self::LocalPort | Self::RemotePort => Some(Key::Number(0)),
            Self::LocalAddress | Self::RemoteAddress => {
                Some(Key::Address(Ipv4Address::UNSPECIFIED))
            }
            _ => None,
        }
    }
}
