//! Structured events for the interesting moments of a packet's life.
//!
//! These wrap `tracing::event!` so the fields stay consistent across the
//! crate. Targets are upper case so a subscriber can filter on them.

use crate::{address::State, message::ScopeId, wire::Ipv4Address};
use tracing::{event, Level};

/// A frame crossing an interface.
pub fn frame_event(scope: ScopeId, direction: &str, ethertype: u16, len: usize) {
    event!(
        target: "FRAME",
        Level::TRACE,
        scope,
        direction,
        ethertype = format!("{:#06x}", ethertype),
        len
    );
}

/// An address changing state.
pub fn transition_event(address: Ipv4Address, scope: ScopeId, from: State, to: State) {
    event!(
        target: "ADDRESS",
        Level::DEBUG,
        address = %address,
        scope,
        from = ?from,
        to = ?to
    );
}

/// A socket binding, connecting or closing.
pub fn socket_event(
    action: &str,
    local: Ipv4Address,
    local_port: u16,
    remote: Ipv4Address,
    remote_port: u16,
) {
    event!(
        target: "SOCKET",
        Level::DEBUG,
        action,
        local = %local,
        local_port,
        remote = %remote,
        remote_port
    );
}
