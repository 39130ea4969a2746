use conduit_core::{
    wire::Ipv4Address, FamilyId, SocketError, SocketType, Stack, StackConfig,
};
use std::time::Duration;

const LOCALHOST: Ipv4Address = Ipv4Address::LOCALHOST;
const WAIT: Option<Duration> = Some(Duration::from_secs(5));

#[tokio::test]
async fn loopback_datagram_round_trip() -> anyhow::Result<()> {
    let stack = Stack::new(StackConfig::default())?;
    let mut server = stack.socket(FamilyId::Inet, SocketType::Dgram, 0)?;
    server.bind(LOCALHOST, 53)?;
    server.set_timeout(WAIT);

    let mut client = stack.socket(FamilyId::Inet, SocketType::Dgram, 0)?;
    client.connect(LOCALHOST, 53).await?;
    assert_eq!(client.write(b"abc").await?, 3);

    let mut buffer = [0u8; 16];
    let (len, from, port) = server.recv_from(&mut buffer).await?;
    assert_eq!(&buffer[..len], b"abc");
    assert_eq!(from, LOCALHOST);
    assert_eq!(port, client.local_addr().1);

    server.send_to(b"reply", from, port).await?;
    client.set_timeout(WAIT);
    let len = client.read(&mut buffer).await?;
    assert_eq!(&buffer[..len], b"reply");
    Ok(())
}

#[tokio::test]
async fn loopback_answers_echo_requests() -> anyhow::Result<()> {
    let stack = Stack::new(StackConfig::default())?;
    assert!(
        stack
            .inet()
            .is_reachable(LOCALHOST, Duration::from_secs(1))
            .await
    );
    Ok(())
}

#[tokio::test]
async fn binding_is_exclusive_until_close() -> anyhow::Result<()> {
    let stack = Stack::new(StackConfig::default())?;
    let mut first = stack.socket(FamilyId::Inet, SocketType::Dgram, 0)?;
    first.bind(LOCALHOST, 53)?;
    let mut second = stack.socket(FamilyId::Inet, SocketType::Dgram, 0)?;
    assert_eq!(second.bind(LOCALHOST, 53), Err(SocketError::AddressInUse));

    drop(first);
    second.bind(LOCALHOST, 53)?;
    Ok(())
}

#[tokio::test]
async fn unbound_ports_answer_with_unreachable() -> anyhow::Result<()> {
    let stack = Stack::new(StackConfig::default())?;
    let mut client = stack.socket(FamilyId::Inet, SocketType::Dgram, 0)?;
    client.set_timeout(WAIT);
    client.connect(LOCALHOST, 9).await?;
    client.write(b"anyone?").await?;

    let mut buffer = [0u8; 16];
    assert_eq!(
        client.read(&mut buffer).await,
        Err(SocketError::ConnectionRefused)
    );
    Ok(())
}

#[tokio::test]
async fn reads_time_out() -> anyhow::Result<()> {
    let stack = Stack::new(StackConfig::default())?;
    let mut socket = stack.socket(FamilyId::Inet, SocketType::Dgram, 0)?;
    socket.bind(LOCALHOST, 0)?;
    socket.set_timeout(Some(Duration::from_millis(50)));
    let mut buffer = [0u8; 4];
    assert_eq!(
        socket.recv_from(&mut buffer).await,
        Err(SocketError::TimedOut)
    );
    Ok(())
}

#[tokio::test]
async fn loopback_stream_connects_and_carries_data() -> anyhow::Result<()> {
    let stack = Stack::new(StackConfig::default())?;
    let mut listener = stack.socket(FamilyId::Inet, SocketType::Stream, 0)?;
    listener.bind(Ipv4Address::UNSPECIFIED, 8080)?;
    listener.listen(4)?;
    listener.set_timeout(WAIT);

    let mut client = stack.socket(FamilyId::Inet, SocketType::Stream, 0)?;
    client.set_timeout(WAIT);
    let (connected, accepted) = tokio::join!(client.connect(LOCALHOST, 8080), listener.accept());
    connected?;
    let mut server = accepted?;
    server.set_timeout(WAIT);
    assert_eq!(server.peer_addr(), Some(client.local_addr()));

    assert_eq!(client.write(b"hello").await?, 5);
    let mut buffer = [0u8; 16];
    let len = server.read(&mut buffer).await?;
    assert_eq!(&buffer[..len], b"hello");

    client.shutdown_output();
    assert_eq!(server.read(&mut buffer).await?, 0);
    assert_eq!(client.write(b"late").await, Err(SocketError::Shutdown));
    Ok(())
}

#[tokio::test]
async fn a_refused_connect_keeps_the_old_binding() -> anyhow::Result<()> {
    let stack = Stack::new(StackConfig::default())?;
    let mut first = stack.socket(FamilyId::Inet, SocketType::Dgram, 0)?;
    first.bind(LOCALHOST, 53)?;
    first.connect(LOCALHOST, 9).await?;

    let mut second = stack.socket(FamilyId::Inet, SocketType::Dgram, 0)?;
    second.bind(LOCALHOST, 53)?;
    second.set_timeout(WAIT);
    assert_eq!(
        second.connect(LOCALHOST, 9).await,
        Err(SocketError::AddressInUse)
    );
    assert_eq!(second.peer_addr(), None);
    assert_eq!(second.local_addr(), (LOCALHOST, 53));

    let mut sender = stack.socket(FamilyId::Inet, SocketType::Dgram, 0)?;
    sender.send_to(b"still here", LOCALHOST, 53).await?;
    let mut buffer = [0u8; 16];
    let (len, _, _) = second.recv_from(&mut buffer).await?;
    assert_eq!(&buffer[..len], b"still here");
    Ok(())
}
