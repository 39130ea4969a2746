use super::{ethernet_host, STEP};
use conduit_core::{
    device::Segment,
    wire::{Ipv4Address, Mac},
    Inet4Address, State,
};
use futures::try_join;
use std::sync::Arc;
use tokio::time;
use tracing::info;

const ALICE: Ipv4Address = Ipv4Address::new([169, 254, 0, 1]);
const BOB: Ipv4Address = Ipv4Address::new([169, 254, 0, 2]);

/// Two hosts on one segment claim link-local addresses, wait out
/// duplicate address detection and then ping each other.
pub async fn link_local() -> anyhow::Result<()> {
    let segment = Segment::new();
    let (alice, alice_scope) = ethernet_host(&segment, Mac::new([2, 0, 0, 0, 0, 1]))?;
    let (bob, bob_scope) = ethernet_host(&segment, Mac::new([2, 0, 0, 0, 0, 2]))?;

    let alice_address = alice.inet().add_address(ALICE, 16, alice_scope)?;
    let bob_address = bob.inet().add_address(BOB, 16, bob_scope)?;
    anyhow::ensure!(alice_address.state() == State::Tentative, "{ALICE} skipped probing");
    try_join!(preferred(&alice_address), preferred(&bob_address))?;
    info!("both addresses are preferred");

    anyhow::ensure!(
        alice.inet().is_reachable(BOB, STEP).await,
        "{BOB} did not answer a ping"
    );
    anyhow::ensure!(
        bob.inet().is_reachable(ALICE, STEP).await,
        "{ALICE} did not answer a ping"
    );
    info!("link-local hosts reach each other");
    Ok(())
}

/// Waits until duplicate address detection lets `address` be used.
async fn preferred(address: &Arc<Inet4Address>) -> anyhow::Result<()> {
    let mut states = address.subscribe();
    time::timeout(STEP, async {
        while *states.borrow_and_update() != State::Preferred {
            states.changed().await?;
        }
        anyhow::Ok(())
    })
    .await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    #[tokio::test(start_paused = true)]
    async fn link_local() {
        super::link_local().await.unwrap()
    }
}
