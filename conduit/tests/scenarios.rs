use conduit::scenarios::{self, ethernet_host};
use conduit_core::{
    device::Segment,
    wire::{Ipv4Address, Mac},
    State,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn leases_carry_default_timers() {
    let leases = scenarios::dhcp().await.unwrap();
    let mut addresses: Vec<_> = leases.iter().map(|lease| lease.address).collect();
    addresses.sort();
    addresses.dedup();
    assert_eq!(addresses.len(), 3);
    for lease in &leases {
        assert_eq!(lease.prefix, 24);
        assert_eq!(lease.router, Some(Ipv4Address::new([10, 0, 0, 1])));
        assert_eq!(lease.timers.lease, 3600);
        assert_eq!(lease.timers.renewal, 1800);
        assert_eq!(lease.timers.rebinding, 3150);
    }
}

#[tokio::test(start_paused = true)]
async fn link_local_addresses_probe_before_use() -> anyhow::Result<()> {
    let segment = Segment::new();
    let (host, scope) = ethernet_host(&segment, Mac::new([2, 0, 0, 0, 0, 1]))?;
    let address = host
        .inet()
        .add_address(Ipv4Address::new([169, 254, 0, 1]), 16, scope)?;
    assert_eq!(address.state(), State::Tentative);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(address.state(), State::Preferred);
    Ok(())
}
