use super::DhcpError;
use conduit_core::{
    message::ScopeId,
    wire::{
        dhcp::{self, op, DhcpMessage, MessageType},
        Ipv4Address, Mac,
    },
    FamilyId, Socket, SocketType, Stack,
};
use rustc_hash::FxHashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

const BUFFER: usize = 1500;

/// An inclusive range of addresses a server may hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    pub first: Ipv4Address,
    pub last: Ipv4Address,
}

impl AddressPool {
    pub fn new(first: Ipv4Address, last: Ipv4Address) -> Self {
        Self { first, last }
    }

    pub fn contains(&self, address: Ipv4Address) -> bool {
        (self.first.to_u32()..=self.last.to_u32()).contains(&address.to_u32())
    }

    pub fn iter(&self) -> impl Iterator<Item = Ipv4Address> {
        (self.first.to_u32()..=self.last.to_u32()).map(Ipv4Address::from)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// The server's own address, sent as the server identifier.
    pub address: Ipv4Address,
    pub prefix: u8,
    pub pool: AddressPool,
    pub router: Option<Ipv4Address>,
    pub dns: Vec<Ipv4Address>,
    pub lease: u32,
    /// Left out of replies when zero, so clients fall back to their defaults.
    pub renewal: u32,
    pub rebinding: u32,
}

impl ServerConfig {
    /// A one day lease with no router.
    pub fn new(address: Ipv4Address, prefix: u8, pool: AddressPool) -> Self {
        Self {
            address,
            prefix,
            pool,
            router: None,
            dns: vec![],
            lease: 86_400,
            renewal: 0,
            rebinding: 0,
        }
    }

    pub fn router(mut self, router: Ipv4Address) -> Self {
        self.router = Some(router);
        self
    }

    pub fn dns(mut self, servers: Vec<Ipv4Address>) -> Self {
        self.dns = servers;
        self
    }

    pub fn lease_times(mut self, lease: u32, renewal: u32, rebinding: u32) -> Self {
        self.lease = lease;
        self.renewal = renewal;
        self.rebinding = rebinding;
        self
    }
}

/// Answers DISCOVER with OFFER and REQUEST with ACK, or NAK when the
/// requested address is outside the pool or held by someone else.
pub struct DhcpServer {
    config: ServerConfig,
    bindings: Mutex<FxHashMap<Ipv4Address, Mac>>,
}

impl DhcpServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            bindings: Default::default(),
        }
    }

    /// Opens the server port on the interface `scope`.
    pub fn socket(stack: &Stack, scope: ScopeId) -> Result<Socket, DhcpError> {
        let mut socket = stack.socket(FamilyId::Inet, SocketType::Dgram, 0)?;
        socket.set_interface(Some(scope));
        socket.bind(Ipv4Address::UNSPECIFIED, dhcp::SERVER_PORT)?;
        Ok(socket)
    }

    /// Addresses currently bound or offered, and their holders.
    pub fn bindings(&self) -> Vec<(Ipv4Address, Mac)> {
        let mut bindings: Vec<_> = self
            .bindings
            .lock()
            .unwrap()
            .iter()
            .map(|(address, mac)| (*address, *mac))
            .collect();
        bindings.sort();
        bindings
    }

    /// Serves on `socket` until it fails.
    pub async fn serve(&self, socket: &mut Socket) -> Result<(), DhcpError> {
        let mut buffer = vec![0u8; BUFFER];
        loop {
            let (len, from, port) = socket.recv_from(&mut buffer).await?;
            let request = match DhcpMessage::from_bytes(&buffer[..len]) {
                Ok(request) => request,
                Err(error) => {
                    debug!(%from, port, %error, "ignoring a malformed message");
                    continue;
                }
            };
            if let Some(reply) = self.answer(&request) {
                socket
                    .send_to(&reply.build(), Ipv4Address::BROADCAST, dhcp::CLIENT_PORT)
                    .await?;
            }
        }
    }

    /// The reply to one client message, if it deserves one.
    pub fn answer(&self, request: &DhcpMessage) -> Option<DhcpMessage> {
        if request.op != op::REQUEST {
            return None;
        }
        let client = request.chaddr;
        let mut bindings = self.bindings.lock().unwrap();
        match request.message_type()? {
            MessageType::Discover => {
                let held = bindings
                    .iter()
                    .find(|(_, holder)| **holder == client)
                    .map(|(address, _)| *address);
                let wanted = request
                    .options
                    .requested_address
                    .filter(|address| self.config.pool.contains(*address))
                    .filter(|address| !bindings.contains_key(address));
                let free = || {
                    self.config
                        .pool
                        .iter()
                        .find(|address| !bindings.contains_key(address))
                };
                let Some(address) = held.or(wanted).or_else(free) else {
                    warn!(%client, "address pool exhausted");
                    return None;
                };
                bindings.insert(address, client);
                info!(%client, %address, "offering");
                Some(self.reply(MessageType::Offer, request, address))
            }
            MessageType::Request => {
                if let Some(server) = request.options.server_id {
                    if server != self.config.address {
                        bindings.retain(|_, holder| *holder != client);
                        debug!(%client, %server, "client chose another server");
                        return None;
                    }
                }
                let requested = request
                    .options
                    .requested_address
                    .unwrap_or(request.ciaddr);
                let available = self.config.pool.contains(requested)
                    && bindings.get(&requested).map_or(true, |holder| *holder == client);
                if !available {
                    warn!(%client, %requested, "refusing request");
                    return Some(self.reply(MessageType::Nak, request, Ipv4Address::UNSPECIFIED));
                }
                bindings.retain(|_, holder| *holder != client);
                bindings.insert(requested, client);
                info!(%client, address = %requested, "acknowledging");
                Some(self.reply(MessageType::Ack, request, requested))
            }
            MessageType::Release | MessageType::Decline => {
                if bindings.get(&request.ciaddr) == Some(&client) {
                    bindings.remove(&request.ciaddr);
                    info!(%client, address = %request.ciaddr, "released");
                }
                None
            }
            kind => {
                debug!(%client, ?kind, "ignoring");
                None
            }
        }
    }

    fn reply(&self, kind: MessageType, request: &DhcpMessage, address: Ipv4Address) -> DhcpMessage {
        let mut reply = DhcpMessage::reply(kind, request);
        reply.options.server_id = Some(self.config.address);
        if kind == MessageType::Nak {
            return reply;
        }
        reply.yiaddr = address;
        reply.siaddr = self.config.address;
        let options = &mut reply.options;
        options.subnet_mask = Some(Ipv4Address::netmask(self.config.prefix));
        options.router = self.config.router;
        options.dns = self.config.dns.clone();
        options.lease_time = Some(self.config.lease);
        options.renewal_time = (self.config.renewal != 0).then_some(self.config.renewal);
        options.rebinding_time = (self.config.rebinding != 0).then_some(self.config.rebinding);
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
    const ALICE: Mac = Mac::new([2, 0, 0, 0, 0, 0xa]);
    const BOB: Mac = Mac::new([2, 0, 0, 0, 0, 0xb]);

    fn server() -> DhcpServer {
        let pool = AddressPool::new(
            Ipv4Address::new([10, 0, 0, 10]),
            Ipv4Address::new([10, 0, 0, 11]),
        );
        DhcpServer::new(ServerConfig::new(SERVER, 24, pool))
    }

    fn request(kind: MessageType, client: Mac, address: Option<Ipv4Address>) -> DhcpMessage {
        let mut message = DhcpMessage::request(kind, 7, client);
        message.options.requested_address = address;
        message
    }

    #[test]
    fn offers_come_from_the_pool_in_order() {
        let server = server();
        let offer = server
            .answer(&request(MessageType::Discover, ALICE, None))
            .unwrap();
        assert_eq!(offer.check_reply(7), Ok(MessageType::Offer));
        assert_eq!(offer.yiaddr, Ipv4Address::new([10, 0, 0, 10]));
        assert_eq!(offer.options.server_id, Some(SERVER));
        assert_eq!(offer.options.subnet_mask, Some(Ipv4Address::new([255, 255, 255, 0])));
        assert_eq!(offer.options.renewal_time, None);

        let again = server
            .answer(&request(MessageType::Discover, ALICE, None))
            .unwrap();
        assert_eq!(again.yiaddr, offer.yiaddr);

        let other = server
            .answer(&request(MessageType::Discover, BOB, None))
            .unwrap();
        assert_eq!(other.yiaddr, Ipv4Address::new([10, 0, 0, 11]));
        assert!(server
            .answer(&request(MessageType::Discover, Mac::new([2, 0, 0, 0, 0, 0xc]), None))
            .is_none());
    }

    #[test]
    fn requests_outside_the_pool_are_refused() {
        let server = server();
        let nak = server
            .answer(&request(
                MessageType::Request,
                ALICE,
                Some(Ipv4Address::new([10, 0, 0, 99])),
            ))
            .unwrap();
        assert_eq!(nak.check_reply(7), Ok(MessageType::Nak));
        assert!(server.bindings().is_empty());
    }

    #[test]
    fn requests_for_held_addresses_are_refused() {
        let server = server();
        let held = Ipv4Address::new([10, 0, 0, 10]);
        let ack = server
            .answer(&request(MessageType::Request, ALICE, Some(held)))
            .unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        let nak = server
            .answer(&request(MessageType::Request, BOB, Some(held)))
            .unwrap();
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
        assert_eq!(server.bindings(), vec![(held, ALICE)]);
    }

    #[test]
    fn release_frees_the_address() {
        let server = server();
        let held = Ipv4Address::new([10, 0, 0, 10]);
        server.answer(&request(MessageType::Request, ALICE, Some(held)));
        let mut release = request(MessageType::Release, ALICE, None);
        release.ciaddr = held;
        assert!(server.answer(&release).is_none());
        assert!(server.bindings().is_empty());
    }
}
