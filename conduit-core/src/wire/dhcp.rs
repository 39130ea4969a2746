//! BOOTP/DHCP messages, RFC 2131 and RFC 2132.

use super::{BytesExt, Ipv4Address, Mac};
use thiserror::Error as ThisError;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;
/// 99.130.83.99
pub const MAGIC_COOKIE: u32 = 0x6382_5363;
/// The fixed BOOTP part, up to but excluding the cookie.
pub const HEADER_LEN: usize = 236;
/// BOOTP relays may drop anything shorter.
pub const MIN_LEN: usize = 300;
/// Set in `flags` to ask the server to broadcast its replies.
pub const FLAG_BROADCAST: u16 = 0x8000;

const SNAME: std::ops::Range<usize> = 44..108;
const FILE: std::ops::Range<usize> = 108..236;

pub mod op {
    pub const REQUEST: u8 = 1;
    pub const REPLY: u8 = 2;
}

/// Option codes understood by the codec.
pub mod code {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DNS: u8 = 6;
    pub const HOST_NAME: u8 = 12;
    pub const DOMAIN_NAME: u8 = 15;
    pub const DEFAULT_TTL: u8 = 23;
    pub const INTERFACE_MTU: u8 = 26;
    pub const BROADCAST: u8 = 28;
    pub const STATIC_ROUTE: u8 = 33;
    pub const REQUESTED_ADDRESS: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const OVERLOAD: u8 = 52;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const REQUEST_LIST: u8 = 55;
    pub const RENEWAL_TIME: u8 = 58;
    pub const REBINDING_TIME: u8 = 59;
    pub const END: u8 = 255;
}

/// Values of the Overload option.
const OVERLOAD_FILE: u8 = 1;
const OVERLOAD_SNAME: u8 = 2;

/// The smallest MTU a host must accept.
const MIN_MTU: u16 = 68;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
}

impl TryFrom<u8> for MessageType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            other => Err(ParseError::UnknownMessageType(other))?,
        })
    }
}

/// The options a message carries. Absent options are `None` or empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpOptions {
    pub message_type: Option<MessageType>,
    pub subnet_mask: Option<Ipv4Address>,
    pub router: Option<Ipv4Address>,
    /// At most two servers are kept.
    pub dns: Vec<Ipv4Address>,
    pub host_name: Option<String>,
    pub domain_name: Option<String>,
    pub default_ttl: Option<u8>,
    pub interface_mtu: Option<u16>,
    pub broadcast: Option<Ipv4Address>,
    /// (destination, router) pairs.
    pub static_routes: Vec<(Ipv4Address, Ipv4Address)>,
    pub requested_address: Option<Ipv4Address>,
    pub lease_time: Option<u32>,
    pub server_id: Option<Ipv4Address>,
    pub request_list: Vec<u8>,
    pub renewal_time: Option<u32>,
    pub rebinding_time: Option<u32>,
}

impl DhcpOptions {
    /// The lease timers with defaults applied, if a lease time was given.
    pub fn lease_timers(&self) -> Option<LeaseTimers> {
        self.lease_time.map(|lease| {
            LeaseTimers::derive(
                lease,
                self.renewal_time.unwrap_or(0),
                self.rebinding_time.unwrap_or(0),
            )
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        fn put(out: &mut Vec<u8>, code: u8, data: &[u8]) {
            out.push(code);
            out.push(data.len() as u8);
            out.extend_from_slice(data);
        }

        if let Some(kind) = self.message_type {
            put(out, code::MESSAGE_TYPE, &[kind as u8]);
        }
        if let Some(server) = self.server_id {
            put(out, code::SERVER_ID, &server.to_bytes());
        }
        if let Some(requested) = self.requested_address {
            put(out, code::REQUESTED_ADDRESS, &requested.to_bytes());
        }
        if let Some(lease) = self.lease_time {
            put(out, code::LEASE_TIME, &lease.to_be_bytes());
        }
        if let Some(renewal) = self.renewal_time {
            put(out, code::RENEWAL_TIME, &renewal.to_be_bytes());
        }
        if let Some(rebinding) = self.rebinding_time {
            put(out, code::REBINDING_TIME, &rebinding.to_be_bytes());
        }
        if let Some(mask) = self.subnet_mask {
            put(out, code::SUBNET_MASK, &mask.to_bytes());
        }
        if let Some(router) = self.router {
            put(out, code::ROUTER, &router.to_bytes());
        }
        if !self.dns.is_empty() {
            let servers: Vec<u8> = self.dns.iter().flat_map(|a| a.to_bytes()).collect();
            put(out, code::DNS, &servers);
        }
        if let Some(broadcast) = self.broadcast {
            put(out, code::BROADCAST, &broadcast.to_bytes());
        }
        if let Some(name) = &self.host_name {
            put(out, code::HOST_NAME, name.as_bytes());
        }
        if let Some(name) = &self.domain_name {
            put(out, code::DOMAIN_NAME, name.as_bytes());
        }
        if let Some(ttl) = self.default_ttl {
            put(out, code::DEFAULT_TTL, &[ttl]);
        }
        if let Some(mtu) = self.interface_mtu {
            put(out, code::INTERFACE_MTU, &mtu.to_be_bytes());
        }
        if !self.static_routes.is_empty() {
            let routes: Vec<u8> = self
                .static_routes
                .iter()
                .flat_map(|(destination, router)| {
                    destination.to_bytes().into_iter().chain(router.to_bytes())
                })
                .collect();
            put(out, code::STATIC_ROUTE, &routes);
        }
        if !self.request_list.is_empty() {
            put(out, code::REQUEST_LIST, &self.request_list);
        }
        out.push(code::END);
    }

    /// Parses one option area, returning the Overload value if it was seen.
    fn parse(&mut self, mut area: &[u8]) -> Result<u8, ParseError> {
        let mut overload = 0;
        while let Some((&tag, rest)) = area.split_first() {
            match tag {
                code::PAD => {
                    area = rest;
                    continue;
                }
                code::END => break,
                _ => {}
            }
            let (&len, rest) = rest.split_first().ok_or(ParseError::TruncatedOption(tag))?;
            let data = rest
                .get(..len as usize)
                .ok_or(ParseError::TruncatedOption(tag))?;
            area = &rest[len as usize..];

            let address = || (data.len() >= 4).then(|| data.iter().cloned().next_ipv4addr()).flatten();
            let seconds = || (data.len() == 4).then(|| data.iter().cloned().next_u32_be()).flatten();
            match tag {
                code::SUBNET_MASK => self.subnet_mask = address(),
                code::ROUTER => self.router = address(),
                code::DNS => {
                    self.dns = data
                        .chunks_exact(4)
                        .take(2)
                        .filter_map(|a| a.iter().cloned().next_ipv4addr())
                        .collect()
                }
                code::HOST_NAME => self.host_name = Some(String::from_utf8_lossy(data).into_owned()),
                code::DOMAIN_NAME => {
                    self.domain_name = Some(String::from_utf8_lossy(data).into_owned())
                }
                code::DEFAULT_TTL => self.default_ttl = data.first().copied(),
                code::INTERFACE_MTU => {
                    self.interface_mtu = data
                        .iter()
                        .cloned()
                        .next_u16_be()
                        .filter(|mtu| *mtu >= MIN_MTU)
                }
                code::BROADCAST => self.broadcast = address(),
                code::STATIC_ROUTE => {
                    self.static_routes = data
                        .chunks_exact(8)
                        .filter_map(|pair| {
                            let mut pair = pair.iter().cloned();
                            Some((pair.next_ipv4addr()?, pair.next_ipv4addr()?))
                        })
                        .collect()
                }
                code::REQUESTED_ADDRESS => self.requested_address = address(),
                code::LEASE_TIME => self.lease_time = seconds(),
                code::OVERLOAD => overload = data.first().copied().unwrap_or(0),
                code::MESSAGE_TYPE => {
                    let kind = data.first().ok_or(ParseError::TruncatedOption(tag))?;
                    self.message_type = Some(MessageType::try_from(*kind)?);
                }
                code::SERVER_ID => self.server_id = address(),
                code::REQUEST_LIST => self.request_list = data.to_vec(),
                code::RENEWAL_TIME => self.renewal_time = seconds(),
                code::REBINDING_TIME => self.rebinding_time = seconds(),
                _ => {}
            }
        }
        Ok(overload)
    }
}

/// Lease, renewal (T1) and rebinding (T2) times in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTimers {
    pub lease: u32,
    pub renewal: u32,
    pub rebinding: u32,
}

impl LeaseTimers {
    /// Applies the defaults for missing or inconsistent server values:
    /// T1 falls back to half the lease, T2 to seven eighths, and a T2 that
    /// does not exceed T1 pulls T1 down to 4/7 of T2.
    pub fn derive(lease: u32, renewal: u32, rebinding: u32) -> Self {
        let fraction = |numerator: u64, denominator: u64, of: u32| {
            (of as u64 * numerator / denominator) as u32
        };
        let mut renewal = renewal;
        let mut rebinding = rebinding;
        if renewal == 0 || renewal >= lease {
            renewal = fraction(1, 2, lease);
        }
        if rebinding == 0 || rebinding >= lease {
            rebinding = fraction(7, 8, lease);
        }
        if rebinding <= renewal {
            renewal = fraction(4, 7, rebinding);
        }
        Self {
            lease,
            renewal,
            rebinding,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    /// Transaction id chosen by the client.
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    /// Client address, when the client already has one.
    pub ciaddr: Ipv4Address,
    /// "Your" address, offered by the server.
    pub yiaddr: Ipv4Address,
    pub siaddr: Ipv4Address,
    pub giaddr: Ipv4Address,
    pub chaddr: Mac,
    pub server_name: String,
    pub boot_file: String,
    pub options: DhcpOptions,
}

impl DhcpMessage {
    /// A client message with the given transaction id and hardware address.
    pub fn request(kind: MessageType, xid: u32, chaddr: Mac) -> Self {
        Self {
            op: op::REQUEST,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid,
            secs: 0,
            flags: FLAG_BROADCAST,
            ciaddr: Ipv4Address::UNSPECIFIED,
            yiaddr: Ipv4Address::UNSPECIFIED,
            siaddr: Ipv4Address::UNSPECIFIED,
            giaddr: Ipv4Address::UNSPECIFIED,
            chaddr,
            server_name: String::new(),
            boot_file: String::new(),
            options: DhcpOptions {
                message_type: Some(kind),
                ..Default::default()
            },
        }
    }

    /// A server reply echoing the client's transaction.
    pub fn reply(kind: MessageType, to: &DhcpMessage) -> Self {
        Self {
            op: op::REPLY,
            flags: to.flags,
            giaddr: to.giaddr,
            ..Self::request(kind, to.xid, to.chaddr)
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options.message_type
    }

    /// Serializes the message, padded to the BOOTP minimum size.
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_LEN);
        out.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        for address in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            out.extend_from_slice(&address.to_bytes());
        }
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&self.chaddr.to_bytes());
        out.extend_from_slice(&chaddr);
        put_text(&mut out, &self.server_name, SNAME.len());
        put_text(&mut out, &self.boot_file, FILE.len());
        out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        self.options.write(&mut out);
        if out.len() < MIN_LEN {
            out.resize(MIN_LEN, code::PAD);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < HEADER_LEN + 4 {
            Err(ParseError::HeaderTooShort)?
        }
        let mut fields = bytes.iter().cloned();
        let hts = ParseError::HeaderTooShort;
        let op = fields.next_u8().ok_or(hts)?;
        let htype = fields.next_u8().ok_or(hts)?;
        let hlen = fields.next_u8().ok_or(hts)?;
        let hops = fields.next_u8().ok_or(hts)?;
        let xid = fields.next_u32_be().ok_or(hts)?;
        let secs = fields.next_u16_be().ok_or(hts)?;
        let flags = fields.next_u16_be().ok_or(hts)?;
        let ciaddr = fields.next_ipv4addr().ok_or(hts)?;
        let yiaddr = fields.next_ipv4addr().ok_or(hts)?;
        let siaddr = fields.next_ipv4addr().ok_or(hts)?;
        let giaddr = fields.next_ipv4addr().ok_or(hts)?;
        let chaddr = fields.next_mac().ok_or(hts)?;

        let cookie = u32::from_be_bytes([
            bytes[HEADER_LEN],
            bytes[HEADER_LEN + 1],
            bytes[HEADER_LEN + 2],
            bytes[HEADER_LEN + 3],
        ]);
        if cookie != MAGIC_COOKIE {
            Err(ParseError::BadCookie(cookie))?
        }

        let mut options = DhcpOptions::default();
        let overload = options.parse(&bytes[HEADER_LEN + 4..])?;
        let (server_name, boot_file) = match overload {
            0 => (text(&bytes[SNAME]), text(&bytes[FILE])),
            _ => {
                if overload & OVERLOAD_SNAME != 0 {
                    options.parse(&bytes[SNAME])?;
                }
                if overload & OVERLOAD_FILE != 0 {
                    options.parse(&bytes[FILE])?;
                }
                (
                    if overload & OVERLOAD_SNAME != 0 { String::new() } else { text(&bytes[SNAME]) },
                    if overload & OVERLOAD_FILE != 0 { String::new() } else { text(&bytes[FILE]) },
                )
            }
        };

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            server_name,
            boot_file,
            options,
        })
    }

    /// Checks that a server reply belongs to transaction `xid` and carries a
    /// usable address.
    pub fn check_reply(&self, xid: u32) -> Result<MessageType, ReplyError> {
        if self.op != op::REPLY {
            Err(ReplyError::NotAReply)?
        }
        if self.htype != 1 || self.hlen != 6 {
            Err(ReplyError::WrongHardware)?
        }
        if self.xid != xid {
            Err(ReplyError::XidMismatch {
                expected: xid,
                actual: self.xid,
            })?
        }
        let kind = self.message_type().ok_or(ReplyError::MissingType)?;
        if matches!(kind, MessageType::Offer | MessageType::Ack) {
            let offered = self.yiaddr;
            if offered.is_multicast()
                || offered.is_reserved()
                || offered.is_unspecified()
                || offered.is_loopback()
                || offered.is_broadcast()
            {
                Err(ReplyError::UnusableAddress(offered))?
            }
        }
        Ok(kind)
    }
}

fn put_text(out: &mut Vec<u8>, text: &str, width: usize) {
    let bytes = text.as_bytes();
    let len = bytes.len().min(width - 1);
    out.extend_from_slice(&bytes[..len]);
    out.resize(out.len() + width - len, 0);
}

fn text(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("The DHCP message is shorter than a BOOTP header")]
    HeaderTooShort,
    #[error("Expected the DHCP magic cookie, found {0:#010x}")]
    BadCookie(u32),
    #[error("Option {0} runs past the end of its area")]
    TruncatedOption(u8),
    #[error("Unknown DHCP message type {0}")]
    UnknownMessageType(u8),
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    #[error("The message is not a server reply")]
    NotAReply,
    #[error("The reply is not for an Ethernet client")]
    WrongHardware,
    #[error("Transaction {actual:#x} does not match {expected:#x}")]
    XidMismatch { expected: u32, actual: u32 },
    #[error("The reply has no message type")]
    MissingType,
    #[error("The offered address {0} cannot be assigned to a host")]
    UnusableAddress(Ipv4Address),
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_MAC: Mac = Mac::new([2, 0, 0, 0, 0, 0x42]);
    const SERVER: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
    const OFFERED: Ipv4Address = Ipv4Address::new([10, 0, 0, 100]);

    fn exchange() -> [DhcpMessage; 4] {
        let mut discover = DhcpMessage::request(MessageType::Discover, 0xfeed, CLIENT_MAC);
        discover.options.request_list = vec![code::SUBNET_MASK, code::ROUTER, code::DNS];

        let mut offer = DhcpMessage::reply(MessageType::Offer, &discover);
        offer.yiaddr = OFFERED;
        offer.options.server_id = Some(SERVER);
        offer.options.lease_time = Some(3600);
        offer.options.subnet_mask = Some(Ipv4Address::netmask(24));
        offer.options.router = Some(SERVER);

        let mut request = DhcpMessage::request(MessageType::Request, 0xfeed, CLIENT_MAC);
        request.options.requested_address = Some(OFFERED);
        request.options.server_id = Some(SERVER);

        let mut ack = DhcpMessage::reply(MessageType::Ack, &request);
        ack.yiaddr = OFFERED;
        ack.options.server_id = Some(SERVER);
        ack.options.lease_time = Some(3600);
        ack.options.renewal_time = Some(0);
        ack.options.rebinding_time = Some(0);
        ack.options.dns = vec![SERVER, Ipv4Address::new([1, 1, 1, 1])];
        ack.options.host_name = Some("client".into());
        ack.options.interface_mtu = Some(1500);
        ack.options.static_routes = vec![(Ipv4Address::new([10, 1, 0, 0]), SERVER)];

        [discover, offer, request, ack]
    }

    #[test]
    fn exchange_round_trips() -> anyhow::Result<()> {
        for message in exchange() {
            let bytes = message.build();
            assert!(bytes.len() >= MIN_LEN);
            assert_eq!(&bytes[HEADER_LEN..HEADER_LEN + 4], &[99, 130, 83, 99]);
            assert_eq!(DhcpMessage::from_bytes(&bytes)?, message);
        }
        Ok(())
    }

    #[test]
    fn default_timers_from_lease() -> anyhow::Result<()> {
        let [_, _, _, ack] = exchange();
        let parsed = DhcpMessage::from_bytes(&ack.build())?;
        let timers = parsed.options.lease_timers().expect("the ack carries a lease");
        assert_eq!(
            timers,
            LeaseTimers {
                lease: 3600,
                renewal: 1800,
                rebinding: 3150
            }
        );
        Ok(())
    }

    #[test]
    fn rebinding_before_renewal_pulls_renewal_down() {
        let timers = LeaseTimers::derive(1000, 900, 700);
        assert_eq!(timers.rebinding, 700);
        assert_eq!(timers.renewal, 400);
        assert_eq!(LeaseTimers::derive(u32::MAX, 0, 0).rebinding, 3_758_096_383);
    }

    #[test]
    fn overloaded_fields_carry_options() -> anyhow::Result<()> {
        let mut bytes = DhcpMessage::reply(
            MessageType::Ack,
            &DhcpMessage::request(MessageType::Request, 7, CLIENT_MAC),
        )
        .build();
        // Replace the option area with just an Overload option.
        bytes.truncate(HEADER_LEN + 4);
        bytes.extend_from_slice(&[code::OVERLOAD, 1, 3, code::MESSAGE_TYPE, 1, 5, code::END]);
        bytes[SNAME.start..SNAME.start + 6].copy_from_slice(&[code::HOST_NAME, 3, b'b', b'o', b'x', code::END]);
        bytes[FILE.start..FILE.start + 7].copy_from_slice(&[code::LEASE_TIME, 4, 0, 0, 0x0e, 0x10, code::END]);

        let parsed = DhcpMessage::from_bytes(&bytes)?;
        assert_eq!(parsed.options.host_name.as_deref(), Some("box"));
        assert_eq!(parsed.options.lease_time, Some(3600));
        assert_eq!(parsed.message_type(), Some(MessageType::Ack));
        assert!(parsed.server_name.is_empty());
        Ok(())
    }

    #[test]
    fn small_mtu_is_ignored() -> anyhow::Result<()> {
        let mut message = DhcpMessage::request(MessageType::Discover, 1, CLIENT_MAC);
        message.options.interface_mtu = Some(40);
        let parsed = DhcpMessage::from_bytes(&message.build())?;
        assert_eq!(parsed.options.interface_mtu, None);
        Ok(())
    }

    #[test]
    fn reply_validation() {
        let [discover, offer, ..] = exchange();
        assert_eq!(offer.check_reply(0xfeed), Ok(MessageType::Offer));
        assert_eq!(discover.check_reply(0xfeed), Err(ReplyError::NotAReply));
        assert!(matches!(
            offer.check_reply(0xbeef),
            Err(ReplyError::XidMismatch { .. })
        ));

        let mut loopback = offer;
        loopback.yiaddr = Ipv4Address::LOCALHOST;
        assert_eq!(
            loopback.check_reply(0xfeed),
            Err(ReplyError::UnusableAddress(Ipv4Address::LOCALHOST))
        );
    }

    #[test]
    fn rejects_bad_cookie() {
        let mut bytes = DhcpMessage::request(MessageType::Discover, 1, CLIENT_MAC).build();
        bytes[HEADER_LEN] = 0;
        assert!(matches!(
            DhcpMessage::from_bytes(&bytes),
            Err(ParseError::BadCookie(_))
        ));
    }
}
