use super::DhcpError;
use conduit_core::{
    family::inet4::InFamily,
    message::ScopeId,
    wire::{
        dhcp::{self, code, DhcpMessage, LeaseTimers, MessageType},
        Ipv4Address, Mac,
    },
    FamilyId, Socket, SocketError, SocketType, Stack,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{fmt, sync::Arc, time::Duration};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

const RETRANSMIT_BASE: Duration = Duration::from_secs(4);
const RETRANSMIT_MAX: Duration = Duration::from_secs(64);
const MAX_RETRANSMISSIONS: u32 = 4;
/// A lease without a lease time never runs out.
const INFINITE: u32 = u32::MAX;
const BUFFER: usize = 1500;
const PARAMETERS: [u8; 4] = [code::SUBNET_MASK, code::ROUTER, code::DNS, code::DOMAIN_NAME];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    Selecting,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
    Rebooting,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An address leased from a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub address: Ipv4Address,
    pub prefix: u8,
    pub router: Option<Ipv4Address>,
    pub dns: Vec<Ipv4Address>,
    pub server: Ipv4Address,
    pub timers: LeaseTimers,
    pub acquired: Instant,
}

impl Lease {
    pub fn renews_at(&self) -> Instant {
        self.acquired + seconds(self.timers.renewal)
    }

    pub fn rebinds_at(&self) -> Instant {
        self.acquired + seconds(self.timers.rebinding)
    }

    pub fn expires_at(&self) -> Instant {
        self.acquired + seconds(self.timers.lease)
    }
}

/// Leases an address for one interface.
pub struct DhcpClient {
    inet: Arc<InFamily>,
    socket: Socket,
    scope: ScopeId,
    mac: Mac,
    rng: SmallRng,
    xid: u32,
    state: ClientState,
    lease: Option<Lease>,
}

impl DhcpClient {
    /// Claims the client port on the interface `scope`.
    pub fn new(stack: &Stack, scope: ScopeId) -> Result<Self, DhcpError> {
        let mac = stack
            .interface_mac(scope)
            .ok_or(DhcpError::NoInterface(scope))?;
        let mut socket = stack.socket(FamilyId::Inet, SocketType::Dgram, 0)?;
        socket.set_interface(Some(scope));
        socket.bind(Ipv4Address::UNSPECIFIED, dhcp::CLIENT_PORT)?;
        Ok(Self {
            inet: stack.inet().clone(),
            socket,
            scope,
            mac,
            rng: SmallRng::from_entropy(),
            xid: 0,
            state: ClientState::Init,
            lease: None,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Runs discover, offer, request and acknowledge, then installs the
    /// leased address and router. A client that already holds a lease
    /// returns it.
    pub async fn acquire(&mut self) -> Result<Lease, DhcpError> {
        if let Some(lease) = &self.lease {
            return Ok(lease.clone());
        }
        let result = self.negotiate().await;
        if result.is_err() {
            self.transition(ClientState::Init);
        }
        result
    }

    async fn negotiate(&mut self) -> Result<Lease, DhcpError> {
        self.xid = self.rng.gen();
        self.transition(ClientState::Selecting);
        let discover = self.message(MessageType::Discover);
        let offer = self.exchange(&discover, &[MessageType::Offer]).await?;
        let server = offer.options.server_id.unwrap_or(offer.siaddr);
        info!(offered = %offer.yiaddr, %server, "received an offer");

        self.transition(ClientState::Requesting);
        let mut request = self.message(MessageType::Request);
        request.options.requested_address = Some(offer.yiaddr);
        request.options.server_id = Some(server);
        let answer = self
            .exchange(&request, &[MessageType::Ack, MessageType::Nak])
            .await?;
        if answer.message_type() == Some(MessageType::Nak) {
            warn!(requested = %offer.yiaddr, %server, "the server refused the request");
            Err(DhcpError::Refused)?
        }
        self.bind(&answer, server)
    }

    fn bind(&mut self, ack: &DhcpMessage, server: Ipv4Address) -> Result<Lease, DhcpError> {
        let prefix = ack
            .options
            .subnet_mask
            .map(Ipv4Address::prefix_len)
            .unwrap_or_else(|| natural_prefix(ack.yiaddr));
        let lease = Lease {
            address: ack.yiaddr,
            prefix,
            router: ack.options.router,
            dns: ack.options.dns.clone(),
            server,
            timers: ack
                .options
                .lease_timers()
                .unwrap_or_else(|| LeaseTimers::derive(INFINITE, 0, 0)),
            acquired: Instant::now(),
        };
        self.inet
            .add_preferred_address(lease.address, lease.prefix, self.scope)?;
        if let Some(router) = lease.router {
            if let Err(error) = self.inet.add_router(router, self.scope) {
                if let Err(error) = self.inet.remove_address(lease.address, self.scope) {
                    warn!(%error, "could not take back the leased address");
                }
                Err(error)?
            }
        }
        info!(
            address = %lease.address,
            prefix,
            lease = lease.timers.lease,
            renewal = lease.timers.renewal,
            rebinding = lease.timers.rebinding,
            "bound"
        );
        self.lease = Some(lease.clone());
        self.transition(ClientState::Bound);
        Ok(lease)
    }

    /// Hands the lease back to the server and withdraws the address.
    pub async fn release(&mut self) -> Result<(), DhcpError> {
        let lease = self.lease.take().ok_or(DhcpError::NotBound)?;
        let mut release = self.message(MessageType::Release);
        release.flags = 0;
        release.ciaddr = lease.address;
        release.options.server_id = Some(lease.server);
        release.options.request_list.clear();
        let sent = time::timeout(
            RETRANSMIT_BASE,
            self.socket
                .send_to(&release.build(), lease.server, dhcp::SERVER_PORT),
        )
        .await
        .unwrap_or(Err(SocketError::TimedOut));
        self.withdraw(&lease);
        self.transition(ClientState::Init);
        sent?;
        Ok(())
    }

    /// Waits for the lease to run out, then withdraws the address.
    pub async fn expire(&mut self) -> Result<(), DhcpError> {
        let expires = self
            .lease
            .as_ref()
            .ok_or(DhcpError::NotBound)?
            .expires_at();
        time::sleep_until(expires).await;
        if let Some(lease) = self.lease.take() {
            warn!(address = %lease.address, "lease expired");
            self.withdraw(&lease);
            self.transition(ClientState::Init);
        }
        Ok(())
    }

    fn withdraw(&self, lease: &Lease) {
        if let Err(error) = self.inet.remove_address(lease.address, self.scope) {
            warn!(%error, "leased address was already gone");
        }
        if let Some(router) = lease.router {
            self.inet.remove_router(router, self.scope);
        }
    }

    fn message(&self, kind: MessageType) -> DhcpMessage {
        let mut message = DhcpMessage::request(kind, self.xid, self.mac);
        message.options.request_list = PARAMETERS.to_vec();
        message
    }

    /// Broadcasts `message` until a reply of one of the `wanted` kinds
    /// arrives, backing off from 4 to 64 seconds.
    async fn exchange(
        &mut self,
        message: &DhcpMessage,
        wanted: &[MessageType],
    ) -> Result<DhcpMessage, DhcpError> {
        let bytes = message.build();
        let mut wait = RETRANSMIT_BASE;
        for attempt in 0..=MAX_RETRANSMISSIONS {
            self.socket
                .send_to(&bytes, Ipv4Address::BROADCAST, dhcp::SERVER_PORT)
                .await?;
            debug!(xid = self.xid, attempt, kind = ?message.message_type(), "sent");
            match time::timeout(wait, self.reply(wanted)).await {
                Ok(reply) => return reply,
                Err(_) => debug!(xid = self.xid, ?wait, "no reply"),
            }
            wait = (wait * 2).min(RETRANSMIT_MAX);
        }
        Err(DhcpError::NoAnswer)
    }

    async fn reply(&mut self, wanted: &[MessageType]) -> Result<DhcpMessage, DhcpError> {
        let mut buffer = vec![0u8; BUFFER];
        loop {
            let (len, from, _) = self.socket.recv_from(&mut buffer).await?;
            let reply = match DhcpMessage::from_bytes(&buffer[..len]) {
                Ok(reply) => reply,
                Err(error) => {
                    debug!(%from, %error, "ignoring a malformed message");
                    continue;
                }
            };
            if reply.chaddr != self.mac {
                continue;
            }
            match reply.check_reply(self.xid) {
                Ok(kind) if wanted.contains(&kind) => return Ok(reply),
                Ok(kind) => debug!(?kind, "ignoring an unexpected reply"),
                Err(error) => debug!(%from, %error, "ignoring a reply"),
            }
        }
    }

    fn transition(&mut self, to: ClientState) {
        if self.state != to {
            debug!(scope = self.scope, from = %self.state, %to, "dhcp client");
            self.state = to;
        }
    }
}

fn seconds(value: u32) -> Duration {
    Duration::from_secs(value as u64)
}

/// The classful prefix, for servers that send no subnet mask.
fn natural_prefix(address: Ipv4Address) -> u8 {
    match address.to_bytes()[0] {
        0..=127 => 8,
        128..=191 => 16,
        _ => 24,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classful_prefixes() {
        assert_eq!(natural_prefix(Ipv4Address::new([10, 1, 2, 3])), 8);
        assert_eq!(natural_prefix(Ipv4Address::new([172, 16, 0, 1])), 16);
        assert_eq!(natural_prefix(Ipv4Address::new([192, 168, 1, 1])), 24);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_deadlines_follow_the_timers() {
        let lease = Lease {
            address: Ipv4Address::new([10, 0, 0, 10]),
            prefix: 24,
            router: None,
            dns: vec![],
            server: Ipv4Address::new([10, 0, 0, 1]),
            timers: LeaseTimers::derive(3600, 0, 0),
            acquired: Instant::now(),
        };
        assert_eq!(lease.renews_at() - lease.acquired, Duration::from_secs(1800));
        assert_eq!(lease.rebinds_at() - lease.acquired, Duration::from_secs(3150));
        assert_eq!(lease.expires_at() - lease.acquired, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn clients_need_an_interface() {
        let stack = Stack::new(Default::default()).unwrap();
        assert!(matches!(
            DhcpClient::new(&stack, 5),
            Err(DhcpError::NoInterface(5))
        ));
    }
}
