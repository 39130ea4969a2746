use super::STEP;
use conduit_core::{wire::Ipv4Address, FamilyId, SocketType, Stack, StackConfig};
use futures::try_join;
use tracing::info;

const PORT: u16 = 7;

/// Echoes a datagram through the loopback interface, then pings it.
pub async fn loopback() -> anyhow::Result<()> {
    let stack = Stack::new(StackConfig::default())?;
    let mut server = stack.socket(FamilyId::Inet, SocketType::Dgram, 0)?;
    server.bind(Ipv4Address::LOCALHOST, PORT)?;
    server.set_timeout(Some(STEP));
    let mut client = stack.socket(FamilyId::Inet, SocketType::Dgram, 0)?;
    client.set_timeout(Some(STEP));
    client.connect(Ipv4Address::LOCALHOST, PORT).await?;

    let echo = async {
        let mut buffer = [0u8; 64];
        let (len, from, port) = server.recv_from(&mut buffer).await?;
        server.send_to(&buffer[..len], from, port).await?;
        anyhow::Ok(())
    };
    let ask = async {
        client.write(b"Hello!").await?;
        let mut buffer = [0u8; 64];
        let len = client.read(&mut buffer).await?;
        anyhow::ensure!(&buffer[..len] == b"Hello!", "the echo came back changed");
        anyhow::Ok(())
    };
    try_join!(echo, ask)?;
    info!("datagram echoed");

    anyhow::ensure!(
        stack.inet().is_reachable(Ipv4Address::LOCALHOST, STEP).await,
        "loopback did not answer a ping"
    );
    info!("loopback answers pings");
    Ok(())
}

#[cfg(test)]
mod tests {
    #[tokio::test]
    async fn loopback() {
        super::loopback().await.unwrap()
    }
}
