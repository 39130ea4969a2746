//! The internet family: IPv4 with ICMP, UDP and TCP above it.
//!
//! ```text
//!                           ┌─ icmp ── icmp mux ─┬─ echo requests ─ responders
//!                           │                    ├─ echo replies ── observers
//! scope mux ══ ip ── type ──┤                    └─ unreachable
//!                     mux   ├─ udp ── ports ─ local addr ─ remote port ─ remote addr ─ datagram
//!                           ├─ tcp ── ports ─ local addr ─ remote port ─ remote addr ─ stream
//!                           └─ raw datagram receivers, created on bind
//! ```
//!
//! The family also owns the address table. Every address a packet or socket
//! refers to is a shared [`Inet4Address`] looked up by scope and value.

mod datagram;
mod icmp;
mod ip;
mod stream;
mod tcp;
mod udp;

pub(crate) use datagram::DatagramReceiver;
pub(crate) use stream::{signal, Endpoint, StreamReceiver};

use super::{arp::ArpFamily, Family, FamilyId, Link};
use crate::{
    address::{AddressKind, Inet4Address, ResolveError, State},
    conduit::{
        Accessor, ConduitFactory, Graph, GraphError, Heading, Key, MuxFactory, NodeId,
        ProtocolFactory, Transporter,
    },
    config::{ConfigError, StackConfig},
    message::{Message, ScopeId, HEADROOM},
    wire::{
        arp::hardware,
        dix::ethertype,
        icmp::{kind, IcmpHeader},
        ipv4::protocol,
        Ipv4Address, Mac,
    },
    FxDashMap,
};
use dashmap::mapref::entry::Entry;
use icmp::{EchoObserver, EchoResponder, IcmpReceiver, UnreachReceiver};
use ip::InReceiver;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use tcp::TcpReceiver;
use tracing::{debug, info, warn};
use udp::{PortUnreachable, UdpReceiver};

/// The payload of the echo request sent by [`InFamily::is_reachable`].
pub const ECHO_PAYLOAD: &[u8] = b"0123456789";

/// The fixed nodes of the family's subgraph.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Nodes {
    pub scope_mux: NodeId,
    pub ip: NodeId,
    pub protocols: NodeId,
    pub icmp: NodeId,
    pub icmp_mux: NodeId,
    pub echo_requests: NodeId,
    pub echo_replies: NodeId,
    pub unreachable: NodeId,
    pub udp: NodeId,
    pub udp_ports: NodeId,
    pub port_unreachable: NodeId,
    pub tcp: NodeId,
    pub tcp_ports: NodeId,
}

impl Nodes {
    fn create(graph: &Graph, family: &Weak<InFamily>, config: &StackConfig) -> Self {
        let datagram_capacity = config.datagram_capacity;
        let raw = ProtocolFactory::new(move |message| {
            let receiver = DatagramReceiver::new(datagram_capacity, Some(message.packet_type as u8));
            Some(Arc::new(receiver))
        });
        let datagrams = ProtocolFactory::new(move |_| {
            Some(Arc::new(DatagramReceiver::new(datagram_capacity, None)))
        });
        let stream_capacity = config.stream_capacity;
        let stream_family = family.clone();
        let streams = ProtocolFactory::new(move |message| {
            let endpoint = Endpoint::from_message(message)?;
            let receiver = StreamReceiver::active(stream_family.clone(), stream_capacity, endpoint);
            Some(Arc::new(receiver))
        });

        Self {
            scope_mux: graph.add_mux(Accessor::Scope),
            ip: graph.add_protocol(Arc::new(InReceiver::new(family.clone()))),
            protocols: graph.add_mux_with(Accessor::Type, Arc::new(raw)),
            icmp: graph.add_protocol(Arc::new(IcmpReceiver)),
            icmp_mux: graph.add_mux(Accessor::IcmpType),
            echo_requests: graph.add_mux(Accessor::LocalAddress),
            echo_replies: graph.add_mux(Accessor::RemoteAddress),
            unreachable: graph.add_protocol(Arc::new(UnreachReceiver::new(family.clone()))),
            udp: graph.add_protocol(Arc::new(UdpReceiver)),
            udp_ports: graph.add_mux_with(Accessor::LocalPort, connection_chain(datagrams)),
            port_unreachable: graph.add_protocol(Arc::new(PortUnreachable::new(family.clone()))),
            tcp: graph.add_protocol(Arc::new(TcpReceiver)),
            tcp_ports: graph.add_mux_with(Accessor::LocalPort, connection_chain(streams)),
        }
    }

    fn wire(&self, graph: &Graph) -> Result<(), GraphError> {
        let number = |n: u8| Some(Key::Number(n as u32));
        graph.connect_aa(self.scope_mux, self.ip)?;
        graph.connect_ba(self.ip, None, self.protocols)?;

        graph.connect_ba(self.protocols, number(protocol::ICMP), self.icmp)?;
        graph.connect_ba(self.icmp, None, self.icmp_mux)?;
        graph.connect_ba(self.icmp_mux, number(kind::ECHO_REQUEST), self.echo_requests)?;
        graph.connect_ba(self.icmp_mux, number(kind::ECHO_REPLY), self.echo_replies)?;
        graph.connect_ba(self.icmp_mux, number(kind::UNREACHABLE), self.unreachable)?;

        graph.connect_ba(self.protocols, number(protocol::UDP), self.udp)?;
        graph.connect_ba(self.udp, None, self.udp_ports)?;
        graph.connect_ba(self.udp_ports, Some(Key::Number(0)), self.port_unreachable)?;

        graph.connect_ba(self.protocols, number(protocol::TCP), self.tcp)?;
        graph.connect_ba(self.tcp, None, self.tcp_ports)?;
        Ok(())
    }

    /// The protocol node a transport protocol number is handled by.
    pub fn transport(&self, number: u8) -> Option<NodeId> {
        match number {
            protocol::UDP => Some(self.udp),
            protocol::TCP => Some(self.tcp),
            _ => None,
        }
    }
}

/// The factory of a port mux: local address, then remote port, then remote
/// address, then the connection's protocol.
fn connection_chain(terminal: ProtocolFactory) -> Arc<dyn ConduitFactory> {
    let remote_addresses = MuxFactory::new(Accessor::RemoteAddress, Some(Arc::new(terminal)));
    let remote_ports = MuxFactory::new(Accessor::RemotePort, Some(Arc::new(remote_addresses)));
    Arc::new(MuxFactory::new(Accessor::LocalAddress, Some(Arc::new(remote_ports))))
}

pub struct InFamily {
    graph: Arc<Graph>,
    arp: Arc<ArpFamily>,
    config: StackConfig,
    table: FxDashMap<(ScopeId, Ipv4Address), Arc<Inet4Address>>,
    routers: Mutex<Vec<Arc<Inet4Address>>>,
    /// The link type of every scope the family is attached to.
    scopes: FxDashMap<ScopeId, u16>,
    any: Arc<Inet4Address>,
    loopback: Mutex<Option<ScopeId>>,
    identification: AtomicU16,
    next_port: Mutex<u16>,
    nodes: Nodes,
    this: Weak<InFamily>,
}

impl InFamily {
    pub fn new(
        graph: Arc<Graph>,
        arp: Arc<ArpFamily>,
        config: StackConfig,
    ) -> Result<Arc<Self>, GraphError> {
        let mut rng = SmallRng::from_entropy();
        let family = Arc::new_cyclic(|this: &Weak<Self>| {
            let nodes = Nodes::create(&graph, this, &config);
            let any = Inet4Address::new(
                Ipv4Address::UNSPECIFIED,
                0,
                0,
                AddressKind::Unspecified,
                State::Preferred,
                this.clone(),
                config.clone(),
            );
            let first_port = *config.ephemeral_ports.start();
            Self {
                graph,
                arp,
                config,
                table: Default::default(),
                routers: Mutex::new(vec![]),
                scopes: Default::default(),
                any,
                loopback: Mutex::new(None),
                identification: AtomicU16::new(rng.gen()),
                next_port: Mutex::new(first_port),
                nodes,
                this: this.clone(),
            }
        });
        family.nodes.wire(&family.graph)?;
        Ok(family)
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub(crate) fn nodes(&self) -> &Nodes {
        &self.nodes
    }

    /// The unspecified address `0.0.0.0`.
    pub fn any(&self) -> Arc<Inet4Address> {
        self.any.clone()
    }

    /// Finds the address for `value` on `scope`, falling back to an entry
    /// with no scope.
    pub fn lookup(&self, scope: ScopeId, value: Ipv4Address) -> Option<Arc<Inet4Address>> {
        if value.is_unspecified() {
            return Some(self.any());
        }
        self.table
            .get(&(scope, value))
            .or_else(|| self.table.get(&(0, value)))
            .map(|entry| entry.value().clone())
    }

    /// A local address with this value on any scope.
    pub fn local(&self, value: Ipv4Address) -> Option<Arc<Inet4Address>> {
        self.table
            .iter()
            .find(|entry| entry.key().1 == value && entry.value().is_local())
            .map(|entry| entry.value().clone())
    }

    /// Every address in the table.
    pub fn addresses(&self) -> Vec<Arc<Inet4Address>> {
        self.table.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Finds or creates the address for `value` on `scope`. A new address is
    /// a neighbor in the Init state.
    pub fn get_host_by_address(&self, value: Ipv4Address, scope: ScopeId) -> Arc<Inet4Address> {
        if value.is_unspecified() {
            return self.any();
        }
        if let Some(existing) = self.table.get(&(scope, value)) {
            return existing.value().clone();
        }
        let mut created = false;
        let entry = self.table.entry((scope, value)).or_insert_with(|| {
            created = true;
            let kind = if value.is_broadcast() {
                AddressKind::Broadcast
            } else {
                AddressKind::Remote
            };
            let state = match kind {
                AddressKind::Broadcast => State::Preferred,
                _ => State::Init,
            };
            let address = self.create(value, 32, scope, kind, state);
            if kind == AddressKind::Remote && self.arp.resolves(scope) {
                if let Err(error) = self.arp.attach(&address) {
                    warn!(%value, scope, %error, "could not attach a neighbor to ARP");
                }
            }
            debug!(%value, scope, "new neighbor");
            address
        });
        let address = entry.value().clone();
        drop(entry);
        if created && address.kind() == AddressKind::Remote {
            self.forget_idle_neighbors();
        }
        address
    }

    /// Once the table holds more neighbors than configured, drops those that
    /// are neither resolving nor referred to outside the table and their
    /// ARP adapter.
    fn forget_idle_neighbors(&self) {
        let neighbors = self
            .table
            .iter()
            .filter(|entry| entry.value().kind() == AddressKind::Remote)
            .count();
        if neighbors <= self.config.neighbor_capacity {
            return;
        }
        let idle: Vec<_> = self
            .table
            .iter()
            .filter(|entry| is_idle_neighbor(entry.value()))
            .map(|entry| *entry.key())
            .collect();
        let mut forgotten = 0;
        for key in idle {
            let removed = self
                .table
                .remove_if(&key, |_, address| is_idle_neighbor(address));
            if let Some((_, address)) = removed {
                address.stop();
                self.arp.detach(&address);
                forgotten += 1;
            }
        }
        debug!(neighbors, forgotten, "forgot idle neighbors");
    }

    /// The address a socket means by `value`. `hint` names the interface
    /// when the caller chose one.
    pub fn host(&self, value: Ipv4Address, hint: Option<ScopeId>) -> Arc<Inet4Address> {
        if value.is_unspecified() {
            return self.any();
        }
        if let Some(scope) = hint {
            return self.get_host_by_address(value, scope);
        }
        if let Some(local) = self.local(value) {
            return local;
        }
        if value.is_loopback() {
            if let Some(scope) = self.loopback_scope() {
                return self.get_host_by_address(value, scope);
            }
        }
        if value.is_broadcast() {
            let scope = self
                .scopes
                .iter()
                .map(|entry| *entry.key())
                .filter(|scope| Some(*scope) != self.loopback_scope())
                .min();
            if let Some(scope) = scope {
                return self.get_host_by_address(value, scope);
            }
        }
        let scope = self.route(value).unwrap_or(0);
        self.get_host_by_address(value, scope)
    }

    fn create(
        &self,
        value: Ipv4Address,
        prefix: u8,
        scope: ScopeId,
        kind: AddressKind,
        state: State,
    ) -> Arc<Inet4Address> {
        Inet4Address::new(
            value,
            prefix,
            scope,
            kind,
            state,
            self.this.clone(),
            self.config.clone(),
        )
    }

    /// Assigns `value` to the interface `scope`. On an Ethernet interface
    /// the address runs duplicate address detection before it is usable.
    pub fn add_address(
        &self,
        value: Ipv4Address,
        prefix: u8,
        scope: ScopeId,
    ) -> Result<Arc<Inet4Address>, ConfigError> {
        self.install_local(value, prefix, scope, false)
    }

    /// Assigns `value` to the interface `scope`, usable at once.
    pub fn add_preferred_address(
        &self,
        value: Ipv4Address,
        prefix: u8,
        scope: ScopeId,
    ) -> Result<Arc<Inet4Address>, ConfigError> {
        self.install_local(value, prefix, scope, true)
    }

    fn install_local(
        &self,
        value: Ipv4Address,
        prefix: u8,
        scope: ScopeId,
        preferred: bool,
    ) -> Result<Arc<Inet4Address>, ConfigError> {
        if prefix > 32 {
            Err(ConfigError::Prefix(prefix))?
        }
        if value.is_unspecified() || value.is_broadcast() || value.is_multicast() {
            Err(ConfigError::Unassignable(value))?
        }
        if !self.scopes.contains_key(&scope) {
            Err(ConfigError::UnknownScope(scope))?
        }
        let address = self.create(value, prefix, scope, AddressKind::Local, State::Init);
        if let Some(mac) = self.link_mac(scope) {
            address.set_mac(mac);
        }
        // A neighbor entry for the same value gives way to the local address.
        let replaced = match self.table.entry((scope, value)) {
            Entry::Occupied(entry) if entry.get().is_local() => {
                Err(ConfigError::AddressExists(value, scope))?
            }
            Entry::Occupied(mut entry) => Some(entry.insert(address.clone())),
            Entry::Vacant(entry) => {
                entry.insert(address.clone());
                None
            }
        };
        if let Some(replaced) = replaced {
            replaced.stop();
            self.arp.detach(&replaced);
        }

        if self.arp.resolves(scope) {
            if let Err(error) = self.arp.attach(&address) {
                self.table
                    .remove_if(&(scope, value), |_, held| Arc::ptr_eq(held, &address));
                warn!(%value, scope, %error, "could not link the address to ARP");
                Err(error)?
            }
        }
        if preferred || !self.arp.resolves(scope) {
            address.prefer();
        } else {
            address.start_dad();
        }

        let responder = self.graph.add_adapter(Arc::new(EchoResponder::new(self.this.clone())));
        let key = Key::Address(value);
        if self.graph.attach_created(self.nodes.echo_requests, key, responder) != Some(responder) {
            debug!(%value, "echo responder already installed");
        }
        info!(%value, prefix, scope, "address added");
        Ok(address)
    }

    /// Records a neighbor, optionally with a known link address.
    pub fn add_neighbor(
        &self,
        value: Ipv4Address,
        scope: ScopeId,
        mac: Option<Mac>,
    ) -> Result<Arc<Inet4Address>, ConfigError> {
        if !self.scopes.contains_key(&scope) {
            Err(ConfigError::UnknownScope(scope))?
        }
        let address = self.get_host_by_address(value, scope);
        if let Some(mac) = mac {
            address.learn(mac);
        }
        Ok(address)
    }

    /// Withdraws `value` from `scope`, cancelling its timers.
    pub fn remove_address(&self, value: Ipv4Address, scope: ScopeId) -> Result<(), ConfigError> {
        let (_, address) = self
            .table
            .remove(&(scope, value))
            .ok_or(ConfigError::UnknownAddress(value, scope))?;
        address.stop();
        self.arp.detach(&address);
        if address.is_local() && self.local(value).is_none() {
            if let Some(responder) = self
                .graph
                .remove_b(self.nodes.echo_requests, Some(Key::Address(value)))
            {
                self.graph.remove(responder);
            }
        }
        info!(%value, scope, "address removed");
        Ok(())
    }

    pub fn add_router(&self, value: Ipv4Address, scope: ScopeId) -> Result<(), ConfigError> {
        if !self.scopes.contains_key(&scope) {
            Err(ConfigError::UnknownScope(scope))?
        }
        let router = self.get_host_by_address(value, scope);
        let mut routers = self.routers.lock().unwrap();
        if !routers.iter().any(|r| Arc::ptr_eq(r, &router)) {
            routers.push(router);
            info!(%value, scope, "router added");
        }
        Ok(())
    }

    /// Returns whether the router was known.
    pub fn remove_router(&self, value: Ipv4Address, scope: ScopeId) -> bool {
        let mut routers = self.routers.lock().unwrap();
        let before = routers.len();
        routers.retain(|r| !(r.value() == value && r.scope() == scope));
        before != routers.len()
    }

    pub fn routers(&self) -> Vec<Arc<Inet4Address>> {
        self.routers.lock().unwrap().clone()
    }

    pub fn loopback_scope(&self) -> Option<ScopeId> {
        *self.loopback.lock().unwrap()
    }

    /// The first usable local address on `scope`.
    pub fn source_on(&self, scope: ScopeId) -> Option<Arc<Inet4Address>> {
        self.table
            .iter()
            .filter(|entry| entry.key().0 == scope)
            .map(|entry| entry.value().clone())
            .filter(|address| address.is_local() && address.state() == State::Preferred)
            .min_by_key(|address| address.value().to_u32())
    }

    /// The source address for packets to `remote`, or `0.0.0.0` when there
    /// is no usable local address toward it.
    pub fn select_source(&self, remote: &Arc<Inet4Address>) -> Arc<Inet4Address> {
        if remote.value().is_loopback() {
            if let Some(localhost) = self
                .loopback_scope()
                .and_then(|scope| self.lookup(scope, Ipv4Address::LOCALHOST))
            {
                return localhost;
            }
        }
        if remote.is_local() {
            return remote.clone();
        }
        self.next_hop(remote)
            .and_then(|hop| self.source_on(hop.scope()))
            .unwrap_or_else(|| self.any())
    }

    /// The interface on which `value` is directly reachable, or through
    /// which the first router reaches it.
    pub fn route(&self, value: Ipv4Address) -> Option<ScopeId> {
        self.table
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|address| address.is_local() && address.contains(value))
            .max_by_key(|address| address.prefix())
            .map(|address| address.scope())
            .or_else(|| self.routers().first().map(|router| router.scope()))
    }

    /// The neighbor a packet for `remote` is handed to.
    pub fn next_hop(&self, remote: &Arc<Inet4Address>) -> Option<Arc<Inet4Address>> {
        if remote.value().is_loopback() || remote.is_local() {
            let scope = self.loopback_scope()?;
            return self.lookup(scope, Ipv4Address::LOCALHOST);
        }
        match remote.kind() {
            AddressKind::Broadcast => return Some(remote.clone()),
            AddressKind::Unspecified => return None,
            _ => {}
        }
        let on_link = self.table.iter().any(|entry| {
            let local = entry.value();
            local.is_local()
                && (remote.scope() == 0 || local.scope() == remote.scope())
                && local.contains(remote.value())
        });
        if on_link {
            if remote.scope() != 0 {
                return Some(remote.clone());
            }
            let scope = self.route(remote.value())?;
            return Some(self.get_host_by_address(remote.value(), scope));
        }
        if let Some(router) = self.routers().first() {
            return Some(router.clone());
        }
        self.scopes
            .contains_key(&remote.scope())
            .then(|| remote.clone())
    }

    /// The link address of the interface `scope`, if it has one.
    pub fn link_mac(&self, scope: ScopeId) -> Option<Mac> {
        self.arp.mac(scope)
    }

    /// Waits for the link address of `hop` when its interface needs one.
    pub async fn resolve(
        &self,
        hop: &Arc<Inet4Address>,
        timeout: Duration,
    ) -> Result<(), ResolveError> {
        if hop.kind() != AddressKind::Remote || !self.arp.resolves(hop.scope()) {
            return Ok(());
        }
        hop.resolve(timeout).await.map(|_| ())
    }

    /// A port in the ephemeral range with no child under `ports`.
    pub fn ephemeral_port(&self, ports: NodeId) -> Option<u16> {
        let range = self.config.ephemeral_ports.clone();
        let (start, end) = (*range.start() as u32, *range.end() as u32);
        let span = end - start + 1;
        let mut next = self.next_port.lock().unwrap();
        for offset in 0..span {
            let port = start + (*next as u32 - start + offset) % span;
            if self.graph.child(ports, Key::Number(port)).is_none() {
                *next = if port == end { start as u16 } else { port as u16 + 1 };
                return Some(port as u16);
            }
        }
        None
    }

    pub fn next_identification(&self) -> u16 {
        self.identification.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends an ICMP echo request to `value` and waits for the reply.
    pub async fn is_reachable(&self, value: Ipv4Address, timeout: Duration) -> bool {
        let remote = self.host(value, None);
        let observer = Arc::new(EchoObserver::default());
        let adapter = self.graph.add_adapter(observer.clone());
        let key = Key::Address(remote.value());
        if self.graph.attach_created(self.nodes.echo_replies, key, adapter) != Some(adapter) {
            debug!(%value, "a reachability probe is already running");
            return false;
        }

        let reachable = async {
            let hop = self.next_hop(&remote)?;
            self.resolve(&hop, timeout).await.ok()?;
            let mut request = vec![0u8; IcmpHeader::SIZE];
            IcmpHeader::echo(kind::ECHO_REQUEST, 0, 0).write(&mut request);
            request.extend_from_slice(ECHO_PAYLOAD);
            let mut message = Message::output(&request, HEADROOM);
            message.local = Some(self.select_source(&remote));
            message.remote = Some(remote.clone());
            let replied = observer.replied();
            self.graph
                .forward(adapter, Heading::A, &mut Transporter::new(&mut message));
            replied.await;
            Some(())
        };
        let reachable = matches!(tokio::time::timeout(timeout, reachable).await, Ok(Some(())));

        self.graph.remove_b(self.nodes.echo_replies, Some(key));
        self.graph.remove(adapter);
        debug!(%value, reachable, "reachability probe finished");
        reachable
    }
}

impl Family for InFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Inet
    }

    fn ethertype(&self) -> u16 {
        ethertype::IPV4
    }

    fn graph(&self) -> &Graph {
        &self.graph
    }

    fn scope_mux(&self) -> NodeId {
        self.nodes.scope_mux
    }

    fn interface_added(&self, link: &Link) -> Result<(), ConfigError> {
        self.scopes.insert(link.scope, link.hardware);
        let broadcast = self.create(
            Ipv4Address::BROADCAST,
            32,
            link.scope,
            AddressKind::Broadcast,
            State::Preferred,
        );
        self.table
            .insert((link.scope, Ipv4Address::BROADCAST), broadcast);
        if link.hardware == hardware::LOOPBACK {
            *self.loopback.lock().unwrap() = Some(link.scope);
            self.add_preferred_address(Ipv4Address::LOCALHOST, 8, link.scope)?;
        }
        Ok(())
    }

    fn interface_removed(&self, scope: ScopeId) {
        let values: Vec<Ipv4Address> = self
            .table
            .iter()
            .filter(|entry| entry.key().0 == scope)
            .map(|entry| entry.key().1)
            .collect();
        for value in values {
            // Raced with another removal, nothing left to do.
            let _ = self.remove_address(value, scope);
        }
        self.routers.lock().unwrap().retain(|r| r.scope() != scope);
        self.scopes.remove(&scope);
        let mut loopback = self.loopback.lock().unwrap();
        if *loopback == Some(scope) {
            *loopback = None;
        }
    }
}

fn is_idle_neighbor(address: &Arc<Inet4Address>) -> bool {
    let holders = 1 + address.arp_node().is_some() as usize;
    address.kind() == AddressKind::Remote
        && matches!(address.state(), State::Init | State::Reachable)
        && Arc::strong_count(address) <= holders
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        family: Arc<InFamily>,
    }

    impl Fixture {
        /// A family attached to a loopback interface on scope 1 and an
        /// Ethernet-less scope 2.
        fn new() -> Self {
            let graph = Arc::new(Graph::new());
            let arp = Arc::new(ArpFamily::new(graph.clone()).unwrap());
            let family = InFamily::new(graph.clone(), arp, StackConfig::default()).unwrap();
            for (scope, hardware) in [(1, hardware::LOOPBACK), (2, 0)] {
                let type_mux = graph.add_mux(Accessor::Type);
                let link = Link {
                    scope,
                    type_mux,
                    mac: Mac::ZERO,
                    hardware,
                };
                family.attach_interface(&link).unwrap();
            }
            Self { family }
        }
    }

    const HOST: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
    const PEER: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
    const FAR: Ipv4Address = Ipv4Address::new([192, 0, 2, 1]);

    #[tokio::test]
    async fn loopback_is_registered_preferred() {
        let Fixture { family } = Fixture::new();
        let localhost = family.lookup(1, Ipv4Address::LOCALHOST).unwrap();
        assert_eq!(localhost.state(), State::Preferred);
        assert_eq!(family.source_on(1).unwrap().value(), Ipv4Address::LOCALHOST);
        let broadcast = family.lookup(2, Ipv4Address::BROADCAST).unwrap();
        assert_eq!(broadcast.kind(), AddressKind::Broadcast);
    }

    #[tokio::test]
    async fn lookup_falls_back_to_scope_zero() {
        let Fixture { family } = Fixture::new();
        let unscoped = family.get_host_by_address(FAR, 0);
        assert!(Arc::ptr_eq(&family.lookup(2, FAR).unwrap(), &unscoped));
        assert!(Arc::ptr_eq(&family.lookup(5, Ipv4Address::UNSPECIFIED).unwrap(), &family.any()));
        assert!(family.lookup(2, PEER).is_none());
    }

    #[tokio::test]
    async fn unreferenced_neighbors_are_forgotten_past_capacity() {
        let graph = Arc::new(Graph::new());
        let arp = Arc::new(ArpFamily::new(graph.clone()).unwrap());
        let config = StackConfig::default().neighbor_capacity(2);
        let family = InFamily::new(graph.clone(), arp, config).unwrap();
        let link = Link {
            scope: 2,
            type_mux: graph.add_mux(Accessor::Type),
            mac: Mac::ZERO,
            hardware: 0,
        };
        family.attach_interface(&link).unwrap();

        let held = family.get_host_by_address(PEER, 2);
        family.get_host_by_address(FAR, 2);
        assert!(family.lookup(2, FAR).is_some());
        let newest = family.get_host_by_address(HOST, 2);

        assert!(Arc::ptr_eq(&family.lookup(2, PEER).unwrap(), &held));
        assert!(family.lookup(2, FAR).is_none());
        assert!(Arc::ptr_eq(&family.lookup(2, HOST).unwrap(), &newest));
    }

    #[tokio::test]
    async fn an_address_arp_cannot_take_is_not_kept() {
        let Fixture { family } = Fixture::new();
        let link = Link {
            scope: 3,
            type_mux: family.graph.add_mux(Accessor::Type),
            mac: Mac::new([2, 0, 0, 0, 0, 3]),
            hardware: hardware::ETHERNET,
        };
        family.attach_interface(&link).unwrap();
        family.arp.attach_interface(&link).unwrap();
        let squatter = Inet4Address::detached(HOST, 3, AddressKind::Remote, State::Init);
        family.arp.attach(&squatter).unwrap();

        assert!(matches!(
            family.add_address(HOST, 24, 3),
            Err(ConfigError::Graph(GraphError::Occupied(_)))
        ));
        assert!(family.lookup(3, HOST).is_none());
        assert_eq!(
            family.graph.child(family.nodes.echo_requests, Key::Address(HOST)),
            None
        );

        family.arp.detach(&squatter);
        let address = family.add_preferred_address(HOST, 24, 3).unwrap();
        assert!(Arc::ptr_eq(&family.lookup(3, HOST).unwrap(), &address));
    }

    #[tokio::test]
    async fn addresses_are_added_once() {
        let Fixture { family } = Fixture::new();
        let host = family.add_address(HOST, 24, 2).unwrap();
        // No ARP on this link, so no detection either.
        assert_eq!(host.state(), State::Preferred);
        assert_eq!(
            family.add_address(HOST, 24, 2).unwrap_err(),
            ConfigError::AddressExists(HOST, 2)
        );
        assert_eq!(
            family.add_address(HOST, 24, 9).unwrap_err(),
            ConfigError::UnknownScope(9)
        );
        assert_eq!(
            family.add_address(Ipv4Address::BROADCAST, 24, 2).unwrap_err(),
            ConfigError::Unassignable(Ipv4Address::BROADCAST)
        );
        family.remove_address(HOST, 2).unwrap();
        assert_eq!(
            family.remove_address(HOST, 2),
            Err(ConfigError::UnknownAddress(HOST, 2))
        );
    }

    #[tokio::test]
    async fn routing_prefers_the_link_then_the_router() {
        let Fixture { family } = Fixture::new();
        family.add_address(HOST, 24, 2).unwrap();
        let peer = family.host(PEER, None);
        assert_eq!(peer.scope(), 2);
        assert!(Arc::ptr_eq(&family.next_hop(&peer).unwrap(), &peer));
        assert_eq!(family.select_source(&peer).value(), HOST);

        let far = family.host(FAR, None);
        assert!(family.next_hop(&far).is_none());
        family.add_router(PEER, 2).unwrap();
        assert_eq!(family.next_hop(&far).unwrap().value(), PEER);
        assert!(family.remove_router(PEER, 2));
        assert!(!family.remove_router(PEER, 2));
    }

    #[tokio::test]
    async fn loopback_and_own_addresses_route_to_localhost() {
        let Fixture { family } = Fixture::new();
        let own = family.add_address(HOST, 24, 2).unwrap();
        let hop = family.next_hop(&own).unwrap();
        assert_eq!(hop.value(), Ipv4Address::LOCALHOST);
        let other = family.host(Ipv4Address::new([127, 0, 0, 9]), None);
        assert_eq!(family.select_source(&other).value(), Ipv4Address::LOCALHOST);
    }

    #[tokio::test]
    async fn ephemeral_ports_skip_taken_ones() {
        let graph = Arc::new(Graph::new());
        let arp = Arc::new(ArpFamily::new(graph.clone()).unwrap());
        let config = StackConfig::default().ephemeral_ports(5000..=5002);
        let family = InFamily::new(graph.clone(), arp, config).unwrap();
        let ports = family.nodes().udp_ports;
        let taken = graph.add_mux(Accessor::LocalAddress);
        graph
            .connect_ba(ports, Some(Key::Number(5000)), taken)
            .unwrap();
        assert_eq!(family.ephemeral_port(ports), Some(5001));
        assert_eq!(family.ephemeral_port(ports), Some(5002));
        assert_eq!(family.ephemeral_port(ports), Some(5001));
    }

    #[tokio::test]
    async fn removing_an_interface_clears_its_addresses() {
        let Fixture { family } = Fixture::new();
        family.add_address(HOST, 24, 2).unwrap();
        family.add_router(PEER, 2).unwrap();
        family.interface_removed(2);
        assert!(family.lookup(2, HOST).is_none());
        assert!(family.routers().is_empty());
        assert_eq!(
            family.add_address(HOST, 24, 2).unwrap_err(),
            ConfigError::UnknownScope(2)
        );
    }
}
