//! Prebuilt hosts and exchanges, run from the command line and the tests.
//!
//! Every scenario builds its own stacks, returns once the exchange has
//! finished and fails if any host saw something unexpected.

use conduit_core::{
    device::Segment,
    message::ScopeId,
    wire::{arp::hardware, Mac},
    Stack, StackConfig,
};
use std::{sync::Arc, time::Duration};

mod loopback;
pub use loopback::loopback;

mod link_local;
pub use link_local::link_local;

mod dhcp;
pub use dhcp::dhcp;

/// How long any single step of a scenario may take.
pub const STEP: Duration = Duration::from_secs(10);

/// A host with one Ethernet interface on `segment`.
pub fn ethernet_host(segment: &Segment, mac: Mac) -> anyhow::Result<(Stack, ScopeId)> {
    let stack = Stack::new(StackConfig::default())?;
    let scope = stack.add_interface(Arc::new(segment.port(mac)), hardware::ETHERNET)?;
    Ok((stack, scope))
}
