//! The per-connection end of a TCP binding.
//!
//! Only what a reliable in-order link needs is here: the three-way
//! handshake, sequence and acknowledgement numbers, in-order delivery into a
//! bounded buffer and FIN in both directions. Segments that arrive out of
//! order are answered with a duplicate acknowledgement and dropped. There is
//! no retransmission or congestion control.

use super::InFamily;
use crate::{
    address::{AddressKind, Inet4Address},
    conduit::{Graph, Heading, NodeId, Receiver, Transporter},
    message::{Message, HEADROOM},
    wire::tcp::{flags, TcpHeader},
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, Weak},
};
use tracing::debug;

/// What a stream reports to its socket in [`Message::control`].
pub(crate) mod signal {
    pub const DATA: u8 = 0x01;
    pub const CONNECTED: u8 = 0x02;
    /// The peer will send no more.
    pub const CLOSED: u8 = 0x04;
    pub const RESET: u8 = 0x08;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum StreamState {
    /// An active opener that has not sent its SYN.
    Closed,
    /// A passive opener waiting for a SYN.
    Listen,
    SynSent,
    SynReceived,
    Established,
}

/// The addresses and ports of a connection.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub local: Arc<Inet4Address>,
    pub local_port: u16,
    pub remote: Arc<Inet4Address>,
    pub remote_port: u16,
}

impl Endpoint {
    pub fn from_message(message: &Message) -> Option<Self> {
        Some(Self {
            local: message.local.clone()?,
            local_port: message.local_port,
            remote: message.remote.clone()?,
            remote_port: message.remote_port,
        })
    }
}

struct Stream {
    state: StreamState,
    endpoint: Endpoint,
    send_next: u32,
    receive_next: u32,
    buffer: VecDeque<u8>,
    fin_sent: bool,
    fin_received: bool,
}

pub(crate) struct StreamReceiver {
    family: Weak<InFamily>,
    capacity: usize,
    inner: Mutex<Stream>,
}

impl StreamReceiver {
    /// A connection that will send the first SYN.
    pub fn active(family: Weak<InFamily>, capacity: usize, endpoint: Endpoint) -> Self {
        Self::new(family, capacity, endpoint, StreamState::Closed)
    }

    /// A connection that waits for the peer's SYN.
    pub fn passive(family: Weak<InFamily>, capacity: usize, endpoint: Endpoint) -> Self {
        Self::new(family, capacity, endpoint, StreamState::Listen)
    }

    fn new(
        family: Weak<InFamily>,
        capacity: usize,
        endpoint: Endpoint,
        state: StreamState,
    ) -> Self {
        let initial = SmallRng::from_entropy().gen();
        Self {
            family,
            capacity,
            inner: Mutex::new(Stream {
                state,
                endpoint,
                send_next: initial,
                receive_next: 0,
                buffer: VecDeque::new(),
                fin_sent: false,
                fin_received: false,
            }),
        }
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().unwrap().state
    }

    /// Handles one segment. Returns the segment to answer with, if any, and
    /// the signals for the socket.
    fn receive(&self, header: &TcpHeader, data: &[u8]) -> (Option<Message>, u8) {
        let mut stream = self.inner.lock().unwrap();
        if header.has(flags::RST) {
            debug!(port = stream.endpoint.local_port, "connection reset");
            stream.state = StreamState::Closed;
            return (None, signal::RESET);
        }
        let mut signals = 0;
        match stream.state {
            StreamState::Listen if header.has(flags::SYN) && !header.has(flags::ACK) => {
                stream.receive_next = header.sequence.wrapping_add(1);
                stream.state = StreamState::SynReceived;
                let reply = self.segment(&mut stream, flags::SYN | flags::ACK);
                return (Some(reply), 0);
            }
            StreamState::SynSent
                if header.has(flags::SYN)
                    && header.has(flags::ACK)
                    && header.acknowledgement == stream.send_next =>
            {
                stream.receive_next = header.sequence.wrapping_add(1);
                stream.state = StreamState::Established;
                let reply = self.segment(&mut stream, flags::ACK);
                return (Some(reply), signal::CONNECTED);
            }
            StreamState::SynReceived
                if header.has(flags::ACK) && header.acknowledgement == stream.send_next =>
            {
                stream.state = StreamState::Established;
                signals |= signal::CONNECTED;
            }
            StreamState::Established => {}
            state => {
                debug!(?state, flags = header.flags, "segment does not fit the connection state");
                return (None, 0);
            }
        }

        let fin = header.has(flags::FIN);
        if data.is_empty() && !fin {
            return (None, signals);
        }
        if header.sequence != stream.receive_next || stream.fin_received {
            debug!(
                expected = stream.receive_next,
                got = header.sequence,
                "out of order segment"
            );
            let reply = self.segment(&mut stream, flags::ACK);
            return (Some(reply), signals);
        }
        let room = self.capacity - stream.buffer.len();
        let taken = data.len().min(room);
        stream.buffer.extend(&data[..taken]);
        stream.receive_next = stream.receive_next.wrapping_add(taken as u32);
        if taken > 0 {
            signals |= signal::DATA;
        }
        if taken < data.len() {
            debug!(dropped = data.len() - taken, "receive buffer full");
        } else if fin {
            stream.receive_next = stream.receive_next.wrapping_add(1);
            stream.fin_received = true;
            signals |= signal::CLOSED;
        }
        let reply = self.segment(&mut stream, flags::ACK);
        (Some(reply), signals)
    }

    /// A segment carrying no data.
    fn segment(&self, stream: &mut Stream, flags: u8) -> Message {
        let mut message = Message::output(&[], HEADROOM);
        self.prepend(stream, flags, &mut message);
        message
    }

    /// Writes the header for the data at the cursor of `message` and
    /// advances the send sequence past it.
    fn prepend(&self, stream: &mut Stream, flags: u8, message: &mut Message) {
        let endpoint = &stream.endpoint;
        let mut header = TcpHeader::new(
            endpoint.local_port,
            endpoint.remote_port,
            stream.send_next,
            flags,
        );
        if flags & flags::ACK != 0 {
            header.acknowledgement = stream.receive_next;
        }
        header.window = (self.capacity - stream.buffer.len()).min(u16::MAX as usize) as u16;
        let header = header.build();

        let local = match (endpoint.local.kind(), self.family.upgrade()) {
            (AddressKind::Unspecified, Some(family)) => family.select_source(&endpoint.remote),
            _ => endpoint.local.clone(),
        };
        message.local = Some(local);
        message.remote = Some(endpoint.remote.clone());
        message.local_port = endpoint.local_port;
        message.remote_port = endpoint.remote_port;

        let mut advance = message.len() as u32;
        if flags & (flags::SYN | flags::FIN) != 0 {
            advance += 1;
        }
        stream.send_next = stream.send_next.wrapping_add(advance);

        message.move_position(-(header.len() as isize));
        message.fix(header.len()).copy_from_slice(&header);
    }
}

impl Receiver for StreamReceiver {
    fn input(&self, graph: &Graph, node: NodeId, message: &mut Message) -> bool {
        let header = match TcpHeader::from_bytes(message.payload()) {
            Ok(header) => header,
            Err(error) => {
                debug!(%error, "dropping TCP segment");
                return false;
            }
        };
        let header_len = (message.payload()[12] >> 4) as usize * 4;
        let (reply, signals) = self.receive(&header, &message.payload()[header_len..]);
        if let Some(mut reply) = reply {
            graph.forward(node, Heading::A, &mut Transporter::new(&mut reply));
        }
        if signals == 0 {
            return false;
        }
        message.move_position(header_len as isize);
        message.control = signals;
        true
    }

    /// Sends the data at the cursor. `message.control` may ask for SYN on
    /// the first segment or FIN.
    fn output(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        let mut stream = self.inner.lock().unwrap();
        match stream.state {
            StreamState::Closed if message.control & flags::SYN != 0 => {
                stream.state = StreamState::SynSent;
                self.prepend(&mut stream, flags::SYN, message);
                true
            }
            StreamState::Established if !stream.fin_sent => {
                let mut bits = flags::ACK;
                if !message.is_empty() {
                    bits |= flags::PSH;
                }
                if message.control & flags::FIN != 0 {
                    bits |= flags::FIN;
                    stream.fin_sent = true;
                }
                self.prepend(&mut stream, bits, message);
                true
            }
            state => {
                debug!(?state, "cannot send on this connection");
                false
            }
        }
    }

    fn error(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        let mut stream = self.inner.lock().unwrap();
        if stream.state == StreamState::SynSent {
            stream.state = StreamState::Closed;
        }
        message.control = signal::RESET;
        true
    }

    fn read(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        let mut stream = self.inner.lock().unwrap();
        if !stream.buffer.is_empty() {
            let taken = message.fill(stream.buffer.make_contiguous());
            stream.buffer.drain(..taken);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{address::State, wire::Ipv4Address};

    fn endpoints() -> (Endpoint, Endpoint) {
        let a = Inet4Address::detached(
            Ipv4Address::new([10, 0, 0, 1]),
            1,
            AddressKind::Local,
            State::Preferred,
        );
        let b = Inet4Address::detached(
            Ipv4Address::new([10, 0, 0, 2]),
            1,
            AddressKind::Local,
            State::Preferred,
        );
        let client = Endpoint {
            local: a.clone(),
            local_port: 40000,
            remote: b.clone(),
            remote_port: 80,
        };
        let server = Endpoint {
            local: b,
            local_port: 80,
            remote: a,
            remote_port: 40000,
        };
        (client, server)
    }

    /// Splits a sent segment into its header and data.
    fn parse(message: &Message) -> (TcpHeader, Vec<u8>) {
        let header = TcpHeader::from_bytes(message.payload()).unwrap();
        let header_len = (message.payload()[12] >> 4) as usize * 4;
        (header, message.payload()[header_len..].to_vec())
    }

    fn open(capacity: usize) -> (StreamReceiver, StreamReceiver) {
        let graph = Graph::new();
        let (client_end, server_end) = endpoints();
        let client = StreamReceiver::active(Weak::new(), capacity, client_end);
        let server = StreamReceiver::passive(Weak::new(), capacity, server_end);

        let mut syn = Message::output(&[], HEADROOM);
        syn.control = flags::SYN;
        assert!(client.output(&graph, 0, &mut syn));
        assert_eq!(client.state(), StreamState::SynSent);

        let (header, _) = parse(&syn);
        let (syn_ack, signals) = server.receive(&header, &[]);
        assert_eq!(signals, 0);
        assert_eq!(server.state(), StreamState::SynReceived);

        let (header, _) = parse(&syn_ack.unwrap());
        assert!(header.has(flags::SYN | flags::ACK));
        let (ack, signals) = client.receive(&header, &[]);
        assert_eq!(signals, signal::CONNECTED);
        assert_eq!(client.state(), StreamState::Established);

        let (header, _) = parse(&ack.unwrap());
        let (_, signals) = server.receive(&header, &[]);
        assert_eq!(signals, signal::CONNECTED);
        assert_eq!(server.state(), StreamState::Established);
        (client, server)
    }

    #[test]
    fn handshake_then_data_then_fin() {
        let graph = Graph::new();
        let (client, server) = open(1024);

        let mut data = Message::output(b"hello", HEADROOM);
        data.control = flags::FIN;
        assert!(client.output(&graph, 0, &mut data));
        let (header, payload) = parse(&data);
        assert_eq!(payload, b"hello");
        assert!(header.has(flags::FIN));

        let (ack, signals) = server.receive(&header, &payload);
        assert_eq!(signals, signal::DATA | signal::CLOSED);
        let (ack, _) = parse(&ack.unwrap());
        assert_eq!(ack.acknowledgement, header.sequence.wrapping_add(6));

        let mut read = Message::read(3);
        server.read(&graph, 0, &mut read);
        assert_eq!(read.payload(), b"hel");
        let mut read = Message::read(8);
        server.read(&graph, 0, &mut read);
        assert_eq!(read.payload(), b"lo");

        let mut more = Message::output(b"late", HEADROOM);
        assert!(!client.output(&graph, 0, &mut more));
    }

    #[test]
    fn out_of_order_data_is_not_buffered() {
        let (client, server) = open(1024);
        let mut header = TcpHeader::new(40000, 80, 0, flags::ACK | flags::PSH);
        header.sequence = client.inner.lock().unwrap().send_next.wrapping_add(100);
        let (reply, signals) = server.receive(&header, b"skipped");
        assert_eq!(signals, 0);
        assert!(reply.is_some());
        assert!(server.inner.lock().unwrap().buffer.is_empty());
    }

    #[test]
    fn reset_closes() {
        let (client, _server) = open(16);
        let header = TcpHeader::new(80, 40000, 0, flags::RST);
        let (reply, signals) = client.receive(&header, &[]);
        assert!(reply.is_none());
        assert_eq!(signals, signal::RESET);
        assert_eq!(client.state(), StreamState::Closed);
    }
}
