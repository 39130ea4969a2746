use super::{ethernet_host, STEP};
use crate::applications::dhcp::{AddressPool, DhcpClient, DhcpServer, Lease, ServerConfig};
use conduit_core::{
    device::Segment,
    wire::{Ipv4Address, Mac},
    State,
};
use futures::future::try_join_all;
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::info;

const SERVER: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
const SERVER_MAC: Mac = Mac::new([2, 0, 0, 0, 0, 1]);
const POOL: AddressPool = AddressPool {
    first: Ipv4Address::new([10, 0, 0, 10]),
    last: Ipv4Address::new([10, 0, 0, 19]),
};
const CLIENTS: u8 = 3;
/// One hour, with renewal and rebinding left to the clients.
pub const LEASE: u32 = 3600;

/// A server and three clients share a segment. Every client leases an
/// address, the first one pings the server and hands its lease back.
/// Returns the leases in client order.
pub async fn dhcp() -> anyhow::Result<Vec<Lease>> {
    let segment = Segment::new();
    let (server_host, server_scope) = ethernet_host(&segment, SERVER_MAC)?;
    server_host
        .inet()
        .add_preferred_address(SERVER, 24, server_scope)?;
    let config = ServerConfig::new(SERVER, 24, POOL)
        .router(SERVER)
        .lease_times(LEASE, 0, 0);
    let server = Arc::new(DhcpServer::new(config));
    let mut socket = DhcpServer::socket(&server_host, server_scope)?;
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(&mut socket).await }
    });

    let mut hosts = vec![];
    let mut clients = vec![];
    for n in 0..CLIENTS {
        let (stack, scope) = ethernet_host(&segment, Mac::new([2, 0, 0, 0, 1, n]))?;
        clients.push(DhcpClient::new(&stack, scope)?);
        hosts.push(stack);
    }
    let leases = time::timeout(
        STEP,
        try_join_all(clients.iter_mut().map(|client| client.acquire())),
    )
    .await??;
    for (host, lease) in hosts.iter().zip(&leases) {
        let address = host
            .inet()
            .local(lease.address)
            .ok_or_else(|| anyhow::anyhow!("{} was not installed", lease.address))?;
        anyhow::ensure!(
            address.state() == State::Preferred,
            "{} is not usable",
            lease.address
        );
        info!(address = %lease.address, "client configured");
    }
    anyhow::ensure!(server.bindings().len() == CLIENTS as usize, "bindings went missing");

    anyhow::ensure!(
        hosts[0].inet().is_reachable(SERVER, STEP).await,
        "a configured client cannot reach the server"
    );

    clients[0].release().await?;
    anyhow::ensure!(
        hosts[0].inet().local(leases[0].address).is_none(),
        "the released address is still installed"
    );
    time::timeout(STEP, async {
        while server.bindings().len() != CLIENTS as usize - 1 {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    info!("lease released");

    serving.abort();
    Ok(leases)
}
