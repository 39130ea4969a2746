use super::{ResolveError, State};
use crate::{
    conduit::{Graph, Heading, NodeId, Receiver, Transporter},
    config::StackConfig,
    family::inet4::InFamily,
    logging::transition_event,
    message::{Message, ScopeId, HEADROOM},
    wire::{
        arp::{ArpHeader, Operation},
        dix::ethertype,
        Ipv4Address, Mac,
    },
};
use std::{
    fmt,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// Assigned to one of our interfaces.
    Local,
    /// A peer.
    Remote,
    Broadcast,
    /// `0.0.0.0`, the source of a host that has no address yet.
    Unspecified,
}

struct Inner {
    state: State,
    timeout_count: u32,
    mac: Option<Mac>,
    /// Bumped whenever the pending alarm is cancelled or replaced, so that
    /// an alarm which already fired can tell it is stale.
    generation: u64,
    alarm: Option<JoinHandle<()>>,
    /// The adapter that connects this address to the ARP demultiplexer.
    arp_node: Option<NodeId>,
}

/// What a transition asks for once the address lock is released.
enum Effect {
    Send(ArpHeader, Mac),
    Learn(Ipv4Address, Mac),
}

/// Collected before taking the address lock, since finding a source address
/// looks at other addresses.
struct Context {
    source: Option<Ipv4Address>,
    link_mac: Option<Mac>,
}

/// An IPv4 address on one scope and its resolution state.
///
/// State transitions happen under a per-address lock, whether they are
/// driven by a timer or by an arriving packet. Anything that sends a packet
/// is performed after the lock is released.
pub struct Inet4Address {
    value: Ipv4Address,
    scope: ScopeId,
    kind: AddressKind,
    prefix: u8,
    inner: Mutex<Inner>,
    states: watch::Sender<State>,
    family: Weak<InFamily>,
    this: Weak<Inet4Address>,
    config: StackConfig,
}

impl Inet4Address {
    pub(crate) fn new(
        value: Ipv4Address,
        prefix: u8,
        scope: ScopeId,
        kind: AddressKind,
        state: State,
        family: Weak<InFamily>,
        config: StackConfig,
    ) -> Arc<Self> {
        let (states, _) = watch::channel(state);
        Arc::new_cyclic(|this| Self {
            value,
            scope,
            kind,
            prefix,
            inner: Mutex::new(Inner {
                state,
                timeout_count: 0,
                mac: None,
                generation: 0,
                alarm: None,
                arp_node: None,
            }),
            states,
            family,
            this: this.clone(),
            config,
        })
    }

    /// An address that is not attached to any family. It can change state
    /// but cannot send ARP traffic.
    pub fn detached(
        value: Ipv4Address,
        scope: ScopeId,
        kind: AddressKind,
        state: State,
    ) -> Arc<Self> {
        Self::new(value, 32, scope, kind, state, Weak::new(), StackConfig::default())
    }

    pub fn value(&self) -> Ipv4Address {
        self.value
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_local(&self) -> bool {
        self.kind == AddressKind::Local
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    pub fn mac(&self) -> Option<Mac> {
        self.inner.lock().unwrap().mac
    }

    pub fn timeout_count(&self) -> u32 {
        self.inner.lock().unwrap().timeout_count
    }

    /// Watches the state of this address.
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.states.subscribe()
    }

    /// Whether `other` is on this address's subnet.
    pub fn contains(&self, other: Ipv4Address) -> bool {
        self.value.same_subnet(other, self.prefix)
    }

    pub(crate) fn set_mac(&self, mac: Mac) {
        self.inner.lock().unwrap().mac = Some(mac);
    }

    pub(crate) fn arp_node(&self) -> Option<NodeId> {
        self.inner.lock().unwrap().arp_node
    }

    pub(crate) fn set_arp_node(&self, node: Option<NodeId>) {
        self.inner.lock().unwrap().arp_node = node;
    }

    /// Starts resolving a neighbor: Init moves to Incomplete and the first
    /// request goes out at once. Does nothing in any other state.
    pub fn start(&self) {
        let context = self.context();
        let effects = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != State::Init {
                return;
            }
            self.set(&mut inner, State::Incomplete);
            inner.timeout_count = 0;
            self.on_expiry(&mut inner, &context)
        };
        self.perform(effects);
    }

    /// Starts duplicate address detection on a local address.
    pub(crate) fn start_dad(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.set(&mut inner, State::Tentative);
        inner.timeout_count = 0;
        self.arm(&mut inner, self.config.probe_wait);
    }

    /// Makes a local address usable without detection or announcements.
    pub(crate) fn prefer(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.cancel(&mut inner);
        self.set(&mut inner, State::Preferred);
        inner.timeout_count = self.config.announce_num;
    }

    /// Records the link address of an unresolved neighbor.
    pub fn learn(&self, mac: Mac) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, State::Init | State::Incomplete) {
            inner.mac = Some(mac);
            inner.timeout_count = 0;
            self.cancel(&mut inner);
            self.set(&mut inner, State::Reachable);
        }
    }

    /// Cancels any pending timer. Calling it again, or after the timer
    /// fired, does nothing.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.cancel(&mut inner);
    }

    /// Waits until the link address is known, starting resolution if the
    /// address is idle.
    pub async fn resolve(&self, timeout: Duration) -> Result<Mac, ResolveError> {
        if self.kind == AddressKind::Broadcast {
            return Ok(Mac::BROADCAST);
        }
        let mut states = self.states.subscribe();
        if let Some(mac) = self.usable_mac() {
            return Ok(mac);
        }
        self.start();
        let wait = async {
            loop {
                if let Some(mac) = self.usable_mac() {
                    return Ok(mac);
                }
                if self.state() == State::Init {
                    return Err(ResolveError::Unreachable(self.value));
                }
                if states.changed().await.is_err() {
                    return Err(ResolveError::Unreachable(self.value));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ResolveError::TimedOut(self.value))?
    }

    fn usable_mac(&self) -> Option<Mac> {
        let inner = self.inner.lock().unwrap();
        inner.mac.filter(|_| inner.state.is_usable())
    }

    fn context(&self) -> Context {
        match self.family.upgrade() {
            Some(family) => Context {
                source: family.source_on(self.scope).map(|address| address.value()),
                link_mac: family.link_mac(self.scope),
            },
            None => Context {
                source: None,
                link_mac: None,
            },
        }
    }

    fn set(&self, inner: &mut Inner, to: State) {
        if inner.state != to {
            transition_event(self.value, self.scope, inner.state, to);
            inner.state = to;
            self.states.send_replace(to);
        }
    }

    fn cancel(&self, inner: &mut Inner) {
        inner.generation += 1;
        if let Some(alarm) = inner.alarm.take() {
            alarm.abort();
        }
    }

    fn arm(&self, inner: &mut Inner, after: Duration) {
        self.cancel(inner);
        let generation = inner.generation;
        let this = self.this.clone();
        match Handle::try_current() {
            Ok(handle) => {
                inner.alarm = Some(handle.spawn(async move {
                    tokio::time::sleep(after).await;
                    if let Some(address) = this.upgrade() {
                        address.expired(generation);
                    }
                }));
            }
            Err(_) => error!(address = %self.value, "no runtime to arm the address timer on"),
        }
    }

    fn expired(&self, generation: u64) {
        let context = self.context();
        let effects = {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation != generation {
                debug!(address = %self.value, "ignoring a stale timer");
                return;
            }
            // The alarm that fired is the running task; let it finish.
            inner.alarm = None;
            self.on_expiry(&mut inner, &context)
        };
        self.perform(effects);
    }

    fn on_expiry(&self, inner: &mut Inner, context: &Context) -> Vec<Effect> {
        match inner.state {
            State::Incomplete => {
                inner.timeout_count += 1;
                let count = inner.timeout_count;
                match (context.source, context.link_mac) {
                    (Some(source), Some(mac)) if count <= self.config.arp_retries => {
                        self.arm(inner, self.config.arp_backoff * (1u32 << count));
                        vec![Effect::Send(
                            ArpHeader::new_request(mac, source, self.value),
                            Mac::BROADCAST,
                        )]
                    }
                    (Some(_), Some(_)) => {
                        debug!(address = %self.value, count, "giving up on resolution");
                        inner.timeout_count = 0;
                        self.set(inner, State::Init);
                        vec![]
                    }
                    _ => {
                        debug!(address = %self.value, "no source address to resolve from");
                        inner.timeout_count = 0;
                        self.set(inner, State::Init);
                        vec![]
                    }
                }
            }
            State::Tentative => {
                if inner.timeout_count < self.config.probe_num {
                    inner.timeout_count += 1;
                    self.arm(inner, self.config.probe_interval);
                    context
                        .link_mac
                        .map(|mac| {
                            Effect::Send(ArpHeader::new_probe(mac, self.value), Mac::BROADCAST)
                        })
                        .into_iter()
                        .collect()
                } else {
                    inner.timeout_count = 0;
                    self.set(inner, State::Preferred);
                    self.arm(inner, self.config.announce_wait);
                    vec![]
                }
            }
            State::Preferred => {
                if inner.timeout_count >= self.config.announce_num {
                    return vec![];
                }
                inner.timeout_count += 1;
                if inner.timeout_count < self.config.announce_num {
                    self.arm(inner, self.config.announce_interval);
                }
                context
                    .link_mac
                    .map(|mac| {
                        Effect::Send(
                            ArpHeader::new_announcement(mac, self.value),
                            Mac::BROADCAST,
                        )
                    })
                    .into_iter()
                    .collect()
            }
            _ => vec![],
        }
    }

    fn on_arp(&self, inner: &mut Inner, header: &ArpHeader, context: &Context) -> Vec<Effect> {
        match inner.state {
            // Only a neighbor that asked resolves. An idle one keeps the
            // link address for later.
            State::Init if header.sender_ip == self.value => {
                inner.mac = Some(header.sender_mac);
                vec![]
            }
            State::Incomplete if header.sender_ip == self.value => {
                inner.mac = Some(header.sender_mac);
                inner.timeout_count = 0;
                self.cancel(inner);
                self.set(inner, State::Reachable);
                vec![]
            }
            State::Reachable if header.sender_ip == self.value => {
                inner.mac = Some(header.sender_mac);
                vec![]
            }
            State::Preferred
                if header.operation == Operation::Request && header.target_ip == self.value =>
            {
                let Some(own) = inner.mac.or(context.link_mac) else {
                    return vec![];
                };
                if header.sender_mac == own {
                    return vec![];
                }
                let reply =
                    ArpHeader::new_reply(own, self.value, header.sender_mac, header.sender_ip);
                let mut effects = vec![Effect::Send(reply, header.sender_mac)];
                if !header.sender_ip.is_unspecified() {
                    effects.push(Effect::Learn(header.sender_ip, header.sender_mac));
                }
                effects
            }
            State::Tentative => {
                let claims = header.sender_ip == self.value
                    || (header.sender_ip.is_unspecified() && header.target_ip == self.value);
                if claims && Some(header.sender_mac) != inner.mac.or(context.link_mac) {
                    warn!(
                        address = %self.value,
                        other = %header.sender_mac,
                        "another host is using a tentative address"
                    );
                }
                vec![]
            }
            _ => vec![],
        }
    }

    fn perform(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(header, destination) => self.send_arp(header, destination),
                Effect::Learn(ip, mac) => {
                    let neighbor = self
                        .family
                        .upgrade()
                        .and_then(|family| family.lookup(self.scope, ip));
                    if let Some(neighbor) = neighbor.filter(|n| n.kind == AddressKind::Remote) {
                        neighbor.learn(mac);
                    }
                }
            }
        }
    }

    fn send_arp(&self, header: ArpHeader, destination: Mac) {
        let Some(family) = self.family.upgrade() else {
            return;
        };
        let Some(node) = self.arp_node() else {
            debug!(address = %self.value, "no ARP adapter, not sending");
            return;
        };
        let mut message = Message::output(&header.build(), HEADROOM);
        message.scope = self.scope;
        message.link_destination = Some(destination);
        message.packet_type = ethertype::ARP;
        family
            .graph()
            .forward(node, Heading::A, &mut Transporter::new(&mut message));
    }
}

impl Receiver for Inet4Address {
    /// An ARP packet about this address.
    fn input(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        let Ok(header) = ArpHeader::from_bytes(message.payload().iter().cloned()) else {
            return false;
        };
        let context = self.context();
        let effects = {
            let mut inner = self.inner.lock().unwrap();
            self.on_arp(&mut inner, &header, &context)
        };
        self.perform(effects);
        false
    }
}

impl Drop for Inet4Address {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.get_mut() {
            if let Some(alarm) = inner.alarm.take() {
                alarm.abort();
            }
        }
    }
}

impl fmt::Debug for Inet4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inet4Address")
            .field("value", &self.value)
            .field("scope", &self.scope)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
    const PEER_MAC: Mac = Mac::new([2, 0, 0, 0, 0, 2]);

    #[tokio::test]
    async fn start_without_a_source_falls_back_to_init() {
        let address = Address::neighbor();
        address.start();
        assert_eq!(address.state(), State::Init);
        assert_eq!(address.timeout_count(), 0);
    }

    #[test]
    fn learning_resolves_once() {
        let address = Address::neighbor();
        address.learn(PEER_MAC);
        assert_eq!(address.state(), State::Reachable);
        assert_eq!(address.mac(), Some(PEER_MAC));
        address.learn(Mac::BROADCAST);
        assert_eq!(address.mac(), Some(PEER_MAC));
    }

    #[test]
    fn stop_is_idempotent() {
        let address = Address::neighbor();
        address.stop();
        address.stop();
        assert_eq!(address.state(), State::Init);
    }

    #[tokio::test]
    async fn arp_reply_resolves_an_incomplete_neighbor() {
        let address = Address::neighbor();
        address.inner.lock().unwrap().state = State::Incomplete;
        let reply = ArpHeader::new_reply(
            PEER_MAC,
            PEER,
            Mac::new([2, 0, 0, 0, 0, 1]),
            [10, 0, 0, 1].into(),
        );
        let mut message = Message::input(&reply.build(), 1);
        let graph = Graph::new();
        assert!(!address.input(&graph, 0, &mut message));
        assert_eq!(address.state(), State::Reachable);
        assert_eq!(address.resolve(Duration::from_secs(1)).await, Ok(PEER_MAC));
    }

    #[test]
    fn unsolicited_replies_leave_an_idle_neighbor_idle() {
        let address = Address::neighbor();
        let reply = ArpHeader::new_reply(
            PEER_MAC,
            PEER,
            Mac::new([2, 0, 0, 0, 0, 1]),
            [10, 0, 0, 1].into(),
        );
        let mut message = Message::input(&reply.build(), 1);
        assert!(!address.input(&Graph::new(), 0, &mut message));
        assert_eq!(address.state(), State::Init);
        assert_eq!(address.mac(), Some(PEER_MAC));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_detection_ends_preferred() {
        let address = Inet4Address::detached(
            Ipv4Address::new([169, 254, 0, 1]),
            1,
            AddressKind::Local,
            State::Init,
        );
        address.start_dad();
        assert_eq!(address.state(), State::Tentative);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(address.state(), State::Tentative);
        assert_eq!(address.timeout_count(), 3);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(address.state(), State::Preferred);
    }

    #[tokio::test]
    async fn broadcast_needs_no_resolution() {
        let address = Inet4Address::detached(
            Ipv4Address::BROADCAST,
            1,
            AddressKind::Broadcast,
            State::Preferred,
        );
        assert_eq!(
            address.resolve(Duration::from_secs(1)).await,
            Ok(Mac::BROADCAST)
        );
    }

    struct Address;

    impl Address {
        fn neighbor() -> Arc<Inet4Address> {
            Inet4Address::detached(PEER, 1, AddressKind::Remote, State::Init)
        }
    }
}
