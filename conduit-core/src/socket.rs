//! Sockets over the internet family.
//!
//! A [`Socket`] owns one adapter in the conduit graph. Binding walks down
//! from the transport protocol along the socket's local and remote endpoint,
//! creating the muxes and the connection protocol it needs, and links the
//! adapter under the connection. Data goes down by forwarding a message out
//! of the adapter and comes up by running a read request through it.

mod listen;
mod receiver;
mod visitors;

use crate::{
    address::{AddressKind, Inet4Address, ResolveError},
    conduit::{GraphError, Heading, NodeId, Transporter},
    family::inet4::{Endpoint, InFamily},
    logging::socket_event,
    message::{Command, Message, ScopeId, HEADROOM},
    wire::{ipv4, tcp::flags, udp, Ipv4Address},
};
use listen::AcceptFactory;
use receiver::SocketReceiver;
use std::{sync::Arc, time::Duration};
use thiserror::Error as ThisError;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, warn};
use visitors::{ListenInstaller, SocketBinder, SocketDisconnector};

/// The largest data a stream puts in one segment.
const SEGMENT_DATA: usize = 1460;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    /// A TCP connection.
    Stream,
    /// UDP datagrams.
    Dgram,
    /// IP datagrams of one protocol number, without a transport header.
    Raw,
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    #[error("The address and port are already bound")]
    AddressInUse,
    #[error("The address is not assigned to this host")]
    AddressNotAvailable,
    #[error("The socket is already bound")]
    AlreadyBound,
    #[error("The socket is not bound")]
    NotBound,
    #[error("The socket is not connected")]
    NotConnected,
    #[error("The socket is not listening")]
    NotListening,
    #[error("The operation is not supported by this socket type")]
    Unsupported,
    #[error("Timed out")]
    TimedOut,
    #[error("The peer refused the connection")]
    ConnectionRefused,
    #[error("The peer reset the connection")]
    ConnectionReset,
    #[error("There is no route to the destination")]
    NoRoute,
    #[error("No ephemeral port is free")]
    NoPorts,
    #[error("The datagram is too long")]
    MessageTooLong,
    #[error("The socket was shut down for sending")]
    Shutdown,
    #[error("The socket is closed")]
    Closed,
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// What a listening socket keeps to accept connections and to stop
/// listening again.
struct Listener {
    factory: Arc<AcceptFactory>,
    mux: NodeId,
    connections: mpsc::Receiver<Socket>,
}

pub struct Socket {
    family: Arc<InFamily>,
    kind: SocketType,
    protocol: u8,
    local: Arc<Inet4Address>,
    local_port: u16,
    remote: Arc<Inet4Address>,
    remote_port: u16,
    receiver: Arc<SocketReceiver>,
    adapter: NodeId,
    /// The connection protocol the adapter is linked under.
    connection: Option<NodeId>,
    listener: Option<Listener>,
    scope: Option<ScopeId>,
    timeout: Option<Duration>,
    input_shut: bool,
    output_shut: bool,
    closed: bool,
}

impl Socket {
    pub(crate) fn new(
        family: Arc<InFamily>,
        kind: SocketType,
        protocol: u8,
    ) -> Result<Self, SocketError> {
        let protocol = match kind {
            SocketType::Stream => ipv4::protocol::TCP,
            SocketType::Dgram => ipv4::protocol::UDP,
            SocketType::Raw => match protocol {
                0 | ipv4::protocol::ICMP | ipv4::protocol::UDP | ipv4::protocol::TCP => {
                    Err(SocketError::Unsupported)?
                }
                number => number,
            },
        };
        let receiver = Arc::new(SocketReceiver::default());
        let adapter = family.graph().add_adapter(receiver.clone());
        let any = family.any();
        Ok(Self {
            family,
            kind,
            protocol,
            local: any.clone(),
            local_port: 0,
            remote: any,
            remote_port: 0,
            receiver,
            adapter,
            connection: None,
            listener: None,
            scope: None,
            timeout: None,
            input_shut: false,
            output_shut: false,
            closed: false,
        })
    }

    /// Wraps the connection a listening socket accepted.
    pub(crate) fn accepted(
        family: Arc<InFamily>,
        endpoint: Endpoint,
        stream: NodeId,
    ) -> Result<Self, SocketError> {
        let mut socket = Self::new(family, SocketType::Stream, 0)?;
        socket
            .family
            .graph()
            .connect_ba(stream, None, socket.adapter)?;
        socket.local = endpoint.local;
        socket.local_port = endpoint.local_port;
        socket.remote = endpoint.remote;
        socket.remote_port = endpoint.remote_port;
        socket.connection = Some(stream);
        socket.event("accepted");
        Ok(socket)
    }

    pub fn kind(&self) -> SocketType {
        self.kind
    }

    pub fn local_addr(&self) -> (Ipv4Address, u16) {
        (self.local.value(), self.local_port)
    }

    /// The connected peer, if any.
    pub fn peer_addr(&self) -> Option<(Ipv4Address, u16)> {
        (self.remote.kind() != AddressKind::Unspecified)
            .then(|| (self.remote.value(), self.remote_port))
    }

    /// Restricts the socket to one interface. Addresses given afterwards
    /// are looked up on that interface only.
    pub fn set_interface(&mut self, scope: Option<ScopeId>) {
        self.scope = scope;
    }

    /// Bounds every blocking operation. `None` waits forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Binds to a local address and port. `0.0.0.0` accepts packets for any
    /// local address and port 0 picks a free ephemeral port.
    pub fn bind(&mut self, address: Ipv4Address, port: u16) -> Result<(), SocketError> {
        self.check_open()?;
        if self.connection.is_some() || self.listener.is_some() {
            Err(SocketError::AlreadyBound)?
        }
        let local = if address.is_unspecified() {
            self.family.any()
        } else {
            let local = match self.scope {
                Some(scope) => self.family.lookup(scope, address),
                None => self.family.local(address),
            };
            local
                .filter(|local| local.is_local())
                .ok_or(SocketError::AddressNotAvailable)?
        };
        let port = match (port, self.ports()) {
            (0, Some(ports)) => self
                .family
                .ephemeral_port(ports)
                .ok_or(SocketError::NoPorts)?,
            (port, _) => port,
        };
        self.local = local;
        self.local_port = port;
        self.attach()?;
        self.event("bind");
        Ok(())
    }

    /// Sets the peer. A stream socket opens the connection and waits for
    /// the handshake to finish. A datagram socket only filters what it
    /// receives and gains a default destination.
    pub async fn connect(&mut self, address: Ipv4Address, port: u16) -> Result<(), SocketError> {
        self.check_open()?;
        if self.listener.is_some() {
            Err(SocketError::Unsupported)?
        }
        if port == 0 && self.kind != SocketType::Raw {
            Err(SocketError::AddressNotAvailable)?
        }
        let remote = self.family.host(address, self.scope);
        if self.kind == SocketType::Stream && self.status_connected() {
            Err(SocketError::AlreadyBound)?
        }

        let previous = (
            self.local.clone(),
            self.local_port,
            self.remote.clone(),
            self.remote_port,
        );
        let was_bound = self.connection.is_some();
        self.detach();
        if let Err(error) = self.attach_to(remote, port) {
            (self.local, self.local_port, self.remote, self.remote_port) = previous;
            if was_bound {
                if let Err(error) = self.attach() {
                    warn!(%error, "could not restore the previous binding");
                }
            }
            Err(error)?
        }
        self.event("connect");

        if self.kind != SocketType::Stream {
            return Ok(());
        }
        let deadline = self.deadline();
        self.ready_hop(&self.remote.clone()).await?;
        let mut events = self.receiver.subscribe();
        let mut syn = Message::output(&[], HEADROOM);
        syn.control = flags::SYN;
        self.send(&mut syn);
        loop {
            let status = self.receiver.status();
            if status.connected {
                return Ok(());
            }
            if status.reset {
                Err(SocketError::ConnectionRefused)?
            }
            changed(&mut events, deadline).await?;
        }
    }

    /// Makes a bound stream socket accept connections, at most `backlog` of
    /// them waiting for [`Socket::accept`] at a time.
    pub fn listen(&mut self, backlog: usize) -> Result<(), SocketError> {
        self.check_open()?;
        if self.kind != SocketType::Stream {
            Err(SocketError::Unsupported)?
        }
        if self.listener.is_some() {
            return Ok(());
        }
        if self.connection.is_none() || self.peer_addr().is_some() {
            Err(SocketError::NotBound)?
        }
        let (backlog, connections) = mpsc::channel(backlog.max(1));
        let factory = AcceptFactory::new(&self.family, backlog);
        let mut installer = ListenInstaller::new(factory.clone());
        let graph = self.family.graph();
        graph.accept(self.adapter, Heading::A, &mut installer);
        let mux = installer.installed().ok_or(SocketError::Unsupported)?;
        // The listener's own connection would shadow the accept factory.
        SocketDisconnector::run(graph, self.adapter);
        self.connection = None;
        self.listener = Some(Listener {
            factory,
            mux,
            connections,
        });
        self.event("listen");
        Ok(())
    }

    /// Waits for a connection that finished its handshake.
    pub async fn accept(&mut self) -> Result<Socket, SocketError> {
        let deadline = self.deadline();
        let listener = self.listener.as_mut().ok_or(SocketError::NotListening)?;
        loop {
            let next = listener.connections.recv();
            let socket = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, next)
                    .await
                    .map_err(|_| SocketError::TimedOut)?,
                None => next.await,
            }
            .ok_or(SocketError::Closed)?;
            match socket.established(deadline).await {
                Ok(()) => return Ok(socket),
                Err(SocketError::ConnectionReset) => {
                    debug!(peer = ?socket.peer_addr(), "connection reset before it was accepted");
                }
                Err(error) => Err(error)?,
            }
        }
    }

    async fn established(&self, deadline: Option<Instant>) -> Result<(), SocketError> {
        let mut events = self.receiver.subscribe();
        loop {
            let status = self.receiver.status();
            if status.connected {
                return Ok(());
            }
            if status.reset {
                Err(SocketError::ConnectionReset)?
            }
            changed(&mut events, deadline).await?;
        }
    }

    /// Reads into `buffer`. A stream returns 0 once the peer has finished
    /// sending. A datagram socket returns one datagram, truncated to fit.
    pub async fn read(&mut self, buffer: &mut [u8]) -> Result<usize, SocketError> {
        match self.kind {
            SocketType::Stream => self.read_stream(buffer).await,
            _ => self.recv_from(buffer).await.map(|(len, _, _)| len),
        }
    }

    async fn read_stream(&mut self, buffer: &mut [u8]) -> Result<usize, SocketError> {
        self.check_open()?;
        if self.connection.is_none() || !self.status_connected() {
            Err(SocketError::NotConnected)?
        }
        if self.input_shut || buffer.is_empty() {
            return Ok(0);
        }
        let deadline = self.deadline();
        let mut events = self.receiver.subscribe();
        loop {
            let request = self.fetch(buffer.len());
            if request.produced {
                buffer[..request.len()].copy_from_slice(request.payload());
                return Ok(request.len());
            }
            let status = self.receiver.status();
            if status.reset {
                Err(SocketError::ConnectionReset)?
            }
            if status.closed {
                return Ok(0);
            }
            changed(&mut events, deadline).await?;
        }
    }

    /// Receives one datagram and reports who sent it.
    pub async fn recv_from(
        &mut self,
        buffer: &mut [u8],
    ) -> Result<(usize, Ipv4Address, u16), SocketError> {
        self.check_open()?;
        if self.kind == SocketType::Stream {
            Err(SocketError::Unsupported)?
        }
        if self.connection.is_none() {
            Err(SocketError::NotBound)?
        }
        let deadline = self.deadline();
        let mut events = self.receiver.subscribe();
        loop {
            if self.input_shut {
                return Ok((0, Ipv4Address::UNSPECIFIED, 0));
            }
            let request = self.fetch(buffer.len());
            if request.command == Command::Error {
                debug!(code = request.error_code, "destination unreachable");
                Err(SocketError::ConnectionRefused)?
            }
            if request.produced {
                buffer[..request.len()].copy_from_slice(request.payload());
                return Ok((request.len(), request.remote_value(), request.remote_port));
            }
            changed(&mut events, deadline).await?;
        }
    }

    /// Writes `data`. A stream splits it into segments; a datagram socket
    /// sends it as one datagram to its peer.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, SocketError> {
        if self.kind != SocketType::Stream {
            let (address, port) = self.peer_addr().ok_or(SocketError::NotConnected)?;
            return self.send_to(data, address, port).await;
        }
        self.check_open()?;
        if self.output_shut {
            Err(SocketError::Shutdown)?
        }
        let status = self.receiver.status();
        if status.reset {
            Err(SocketError::ConnectionReset)?
        }
        if self.connection.is_none() || !status.connected {
            Err(SocketError::NotConnected)?
        }
        self.ready_hop(&self.remote.clone()).await?;
        for chunk in data.chunks(SEGMENT_DATA) {
            let mut segment = Message::output(chunk, HEADROOM);
            self.send(&mut segment);
        }
        Ok(data.len())
    }

    /// Sends one datagram to `address` and `port`, binding to an ephemeral
    /// port first if the socket is unbound.
    pub async fn send_to(
        &mut self,
        data: &[u8],
        address: Ipv4Address,
        port: u16,
    ) -> Result<usize, SocketError> {
        self.check_open()?;
        if self.kind == SocketType::Stream {
            Err(SocketError::Unsupported)?
        }
        if self.output_shut {
            Err(SocketError::Shutdown)?
        }
        let transport = match self.kind {
            SocketType::Dgram => udp::HEADER_OCTETS,
            _ => 0,
        };
        if data.len() + transport + ipv4::BASE_OCTETS as usize > u16::MAX as usize {
            Err(SocketError::MessageTooLong)?
        }
        if self.connection.is_none() {
            self.bind(Ipv4Address::UNSPECIFIED, 0)?;
        }
        let remote = self.family.host(address, self.scope);
        self.ready_hop(&remote).await?;

        let mut message = Message::output(data, HEADROOM);
        message.local = Some(match self.local.kind() {
            AddressKind::Unspecified => self.family.select_source(&remote),
            _ => self.local.clone(),
        });
        message.remote = Some(remote);
        message.local_port = self.local_port;
        message.remote_port = port;
        self.send(&mut message);
        Ok(data.len())
    }

    /// Stops reading. Later reads return nothing.
    pub fn shutdown_input(&mut self) {
        self.input_shut = true;
        self.event("shutdown input");
    }

    /// Stops writing. A stream tells its peer with a FIN.
    pub fn shutdown_output(&mut self) {
        if self.output_shut {
            return;
        }
        self.output_shut = true;
        if self.kind == SocketType::Stream && self.status_connected() && self.connection.is_some()
        {
            let mut fin = Message::output(&[], HEADROOM);
            fin.control = flags::FIN;
            self.send(&mut fin);
        }
        self.event("shutdown output");
    }

    /// Releases everything the socket holds in the graph. Closing twice does
    /// nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stop_listening();
        self.shutdown_output();
        self.detach();
        self.family.graph().remove(self.adapter);
        self.closed = true;
        self.event("close");
    }

    fn stop_listening(&mut self) {
        let Some(mut listener) = self.listener.take() else {
            return;
        };
        let graph = self.family.graph();
        listener.factory.close();
        if let Err(error) = graph.set_factory(listener.mux, listener.factory.previous()) {
            debug!(%error, "listening mux is gone");
        }
        listener.connections.close();
        while let Ok(pending) = listener.connections.try_recv() {
            drop(pending);
        }
        for (_, child) in graph.children(listener.mux) {
            graph.prune(child);
        }
        graph.prune(listener.mux);
    }

    fn check_open(&self) -> Result<(), SocketError> {
        if self.closed {
            Err(SocketError::Closed)?
        }
        Ok(())
    }

    fn status_connected(&self) -> bool {
        self.receiver.status().connected
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| Instant::now() + timeout)
    }

    /// The protocol node bindings start from.
    fn entry(&self) -> NodeId {
        let nodes = self.family.nodes();
        match self.kind {
            SocketType::Stream => nodes.tcp,
            SocketType::Dgram => nodes.udp,
            SocketType::Raw => nodes.ip,
        }
    }

    /// The port mux of a transport socket.
    fn ports(&self) -> Option<NodeId> {
        let nodes = self.family.nodes();
        match self.kind {
            SocketType::Stream => Some(nodes.tcp_ports),
            SocketType::Dgram => Some(nodes.udp_ports),
            SocketType::Raw => None,
        }
    }

    /// A message carrying the socket's endpoint, used to find or build the
    /// socket's place in the graph.
    fn template(&self) -> Message {
        let mut template = Message::output(&[], 0);
        template.local = Some(self.local.clone());
        template.remote = Some(self.remote.clone());
        template.local_port = self.local_port;
        template.remote_port = self.remote_port;
        template.packet_type = self.protocol as u16;
        template
    }

    fn attach(&mut self) -> Result<(), SocketError> {
        let template = self.template();
        let mut binder = SocketBinder::new(&template, self.adapter);
        self.family
            .graph()
            .accept(self.entry(), Heading::B, &mut binder);
        self.connection = Some(binder.outcome()?);
        Ok(())
    }

    /// Picks the local endpoint a connection to `remote` uses and binds to
    /// the full four-tuple.
    fn attach_to(&mut self, remote: Arc<Inet4Address>, port: u16) -> Result<(), SocketError> {
        if self.local_port == 0 {
            if let Some(ports) = self.ports() {
                self.local_port = self
                    .family
                    .ephemeral_port(ports)
                    .ok_or(SocketError::NoPorts)?;
            }
        }
        if self.kind == SocketType::Stream && self.local.kind() == AddressKind::Unspecified {
            self.local = self.family.select_source(&remote);
        }
        self.remote = remote;
        self.remote_port = port;
        self.attach()
    }

    fn detach(&mut self) {
        if self.connection.take().is_some() {
            SocketDisconnector::run(self.family.graph(), self.adapter);
        }
    }

    /// Waits until the neighbor packets to `remote` go through knows its
    /// link address.
    async fn ready_hop(&self, remote: &Arc<Inet4Address>) -> Result<(), SocketError> {
        let hop = self.family.next_hop(remote).ok_or(SocketError::NoRoute)?;
        let limit = self
            .timeout
            .unwrap_or_else(|| self.family.config().resolution_time());
        self.family.resolve(&hop, limit).await?;
        Ok(())
    }

    fn send(&self, message: &mut Message) {
        let graph = self.family.graph();
        if !graph.forward(self.adapter, Heading::A, &mut Transporter::new(message)) {
            debug!(adapter = self.adapter, "outgoing message was dropped");
        }
    }

    /// Asks the connection for up to `capacity` buffered bytes.
    fn fetch(&self, capacity: usize) -> Message {
        let mut request = Message::read(capacity);
        self.family
            .graph()
            .accept(self.adapter, Heading::A, &mut Transporter::new(&mut request));
        request
    }

    fn event(&self, action: &str) {
        socket_event(
            action,
            self.local.value(),
            self.local_port,
            self.remote.value(),
            self.remote_port,
        );
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Waits for the next event on a socket, giving up at `deadline`.
async fn changed(
    events: &mut watch::Receiver<u64>,
    deadline: Option<Instant>,
) -> Result<(), SocketError> {
    let next = events.changed();
    let result = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, next)
            .await
            .map_err(|_| SocketError::TimedOut)?,
        None => next.await,
    };
    result.map_err(|_| SocketError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::StackConfig,
        family::{arp::ArpFamily, Family, Link},
        conduit::Graph,
        wire::{arp::hardware, Mac},
    };

    fn family() -> Arc<InFamily> {
        let graph = Arc::new(Graph::new());
        let arp = Arc::new(ArpFamily::new(graph.clone()).unwrap());
        let family = InFamily::new(graph.clone(), arp, StackConfig::default()).unwrap();
        let type_mux = graph.add_mux(crate::conduit::Accessor::Type);
        family
            .attach_interface(&Link {
                scope: 1,
                type_mux,
                mac: Mac::new([0; 6]),
                hardware: hardware::LOOPBACK,
            })
            .unwrap();
        family
    }

    #[tokio::test]
    async fn binding_twice_conflicts_until_closed() {
        let family = family();
        let mut first = Socket::new(family.clone(), SocketType::Dgram, 0).unwrap();
        first.bind(Ipv4Address::UNSPECIFIED, 53).unwrap();
        let mut second = Socket::new(family.clone(), SocketType::Dgram, 0).unwrap();
        assert_eq!(
            second.bind(Ipv4Address::UNSPECIFIED, 53),
            Err(SocketError::AddressInUse)
        );
        first.close();
        second.bind(Ipv4Address::UNSPECIFIED, 53).unwrap();
    }

    #[tokio::test]
    async fn closing_removes_the_connection_chain() {
        let family = family();
        let graph = family.graph().clone();
        let before = graph.len();
        let mut socket = Socket::new(family.clone(), SocketType::Dgram, 0).unwrap();
        socket.bind(Ipv4Address::LOCALHOST, 0).unwrap();
        assert!(graph.len() > before + 1);
        drop(socket);
        assert_eq!(graph.len(), before);
    }

    #[tokio::test]
    async fn ephemeral_ports_come_from_the_range() {
        let family = family();
        let mut socket = Socket::new(family.clone(), SocketType::Dgram, 0).unwrap();
        socket.bind(Ipv4Address::UNSPECIFIED, 0).unwrap();
        let (_, port) = socket.local_addr();
        assert!(family.config().ephemeral_ports.contains(&port));
    }

    #[tokio::test]
    async fn foreign_addresses_cannot_be_bound() {
        let family = family();
        let mut socket = Socket::new(family, SocketType::Dgram, 0).unwrap();
        assert_eq!(
            socket.bind(Ipv4Address::new([192, 0, 2, 1]), 9),
            Err(SocketError::AddressNotAvailable)
        );
    }

    #[tokio::test]
    async fn raw_sockets_reject_transport_numbers() {
        let family = family();
        assert!(matches!(
            Socket::new(family.clone(), SocketType::Raw, ipv4::protocol::UDP),
            Err(SocketError::Unsupported)
        ));
        let mut raw = Socket::new(family, SocketType::Raw, 253).unwrap();
        raw.bind(Ipv4Address::UNSPECIFIED, 0).unwrap();
    }

    #[tokio::test]
    async fn listening_needs_a_bound_stream() {
        let family = family();
        let mut datagrams = Socket::new(family.clone(), SocketType::Dgram, 0).unwrap();
        assert_eq!(datagrams.listen(1), Err(SocketError::Unsupported));
        let mut stream = Socket::new(family.clone(), SocketType::Stream, 0).unwrap();
        assert_eq!(stream.listen(1), Err(SocketError::NotBound));
        stream.bind(Ipv4Address::UNSPECIFIED, 8080).unwrap();
        stream.listen(1).unwrap();

        let mut other = Socket::new(family, SocketType::Stream, 0).unwrap();
        assert_eq!(
            other.bind(Ipv4Address::UNSPECIFIED, 8080),
            Err(SocketError::AddressInUse)
        );
        stream.close();
        other.bind(Ipv4Address::UNSPECIFIED, 8080).unwrap();
    }
}
