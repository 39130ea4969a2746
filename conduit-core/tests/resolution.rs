use conduit_core::{
    device::{Frame, Segment},
    wire::{
        arp::{hardware, ArpHeader, Operation},
        dix::{self, ethertype, DixHeader},
        Ipv4Address, Mac,
    },
    Stack, StackConfig, State,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;

const OWN: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
const OWN_MAC: Mac = Mac::new([2, 0, 0, 0, 0, 1]);
const PEER: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
const PEER_MAC: Mac = Mac::new([2, 0, 0, 0, 0, 2]);

fn host(segment: &Segment) -> anyhow::Result<(Stack, usize)> {
    let stack = Stack::new(StackConfig::default())?;
    let scope = stack.add_interface(Arc::new(segment.port(OWN_MAC)), hardware::ETHERNET)?;
    stack.inet().add_preferred_address(OWN, 24, scope)?;
    Ok((stack, scope))
}

fn requests_for(monitor: &mut broadcast::Receiver<Frame>, target: Ipv4Address) -> usize {
    let mut count = 0;
    while let Ok(frame) = monitor.try_recv() {
        if frame.bytes.len() < dix::HEADER_LEN || frame.bytes[12..14] != ethertype::ARP.to_be_bytes() {
            continue;
        }
        let Ok(header) = ArpHeader::from_bytes(frame.bytes[dix::HEADER_LEN..].iter().cloned()) else {
            continue;
        };
        if header.operation == Operation::Request && header.target_ip == target {
            count += 1;
        }
    }
    count
}

#[tokio::test(start_paused = true)]
async fn unanswered_resolution_falls_back_to_init() -> anyhow::Result<()> {
    let segment = Segment::new();
    let (stack, scope) = host(&segment)?;
    let mut monitor = segment.monitor();

    let neighbor = stack.inet().get_host_by_address(PEER, scope);
    assert_eq!(neighbor.state(), State::Init);
    neighbor.start();
    assert_eq!(neighbor.state(), State::Incomplete);

    tokio::time::sleep(stack.config().resolution_time()).await;
    assert_eq!(neighbor.state(), State::Init);
    assert_eq!(requests_for(&mut monitor, PEER), 6);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn a_reply_resolves_and_stops_the_retries() -> anyhow::Result<()> {
    let segment = Segment::new();
    let (stack, scope) = host(&segment)?;
    let mut monitor = segment.monitor();

    let neighbor = stack.inet().get_host_by_address(PEER, scope);
    neighbor.start();

    let mut frame = vec![0u8; dix::HEADER_LEN];
    DixHeader::new(OWN_MAC, PEER_MAC, ethertype::ARP).write(&mut frame);
    frame.extend_from_slice(&ArpHeader::new_reply(PEER_MAC, PEER, OWN_MAC, OWN).build());
    segment.inject(&frame);

    assert_eq!(neighbor.resolve(Duration::from_secs(30)).await, Ok(PEER_MAC));
    assert_eq!(neighbor.state(), State::Reachable);

    tokio::time::sleep(stack.config().resolution_time()).await;
    assert_eq!(neighbor.state(), State::Reachable);
    assert_eq!(requests_for(&mut monitor, PEER), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn requests_for_own_addresses_are_answered() -> anyhow::Result<()> {
    let segment = Segment::new();
    let (_stack, _scope) = host(&segment)?;
    let mut monitor = segment.monitor();

    let mut frame = vec![0u8; dix::HEADER_LEN];
    DixHeader::new(Mac::BROADCAST, PEER_MAC, ethertype::ARP).write(&mut frame);
    frame.extend_from_slice(&ArpHeader::new_request(PEER_MAC, PEER, OWN).build());
    segment.inject(&frame);

    let reply = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let frame = monitor.recv().await?;
            if frame.port == Segment::OUTSIDE {
                continue;
            }
            let header = ArpHeader::from_bytes(frame.bytes[dix::HEADER_LEN..].iter().cloned())?;
            return anyhow::Ok(header);
        }
    })
    .await??;
    assert_eq!(reply.operation, Operation::Reply);
    assert_eq!(reply.sender_mac, OWN_MAC);
    assert_eq!(reply.sender_ip, OWN);
    assert_eq!(reply.target_mac, PEER_MAC);
    Ok(())
}
