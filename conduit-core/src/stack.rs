//! The registry tying one network stack together.

use crate::{
    conduit::{Graph, GraphError},
    config::{ConfigError, StackConfig},
    device::{Device, Loopback},
    family::{arp::ArpFamily, inet4::InFamily, Family, FamilyId},
    interface::{Interface, InterfaceError},
    message::ScopeId,
    socket::{Socket, SocketError, SocketType},
    wire::{arp::hardware, Mac},
};
use std::sync::{Arc, Mutex};
use thiserror::Error as ThisError;
use tracing::{info, warn};

/// Interface slots. Slot 0 stands for "no particular interface" and is
/// never handed out.
pub const MAX_INTERFACES: usize = 8;

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Interface(#[from] InterfaceError),
}

/// One host: the conduit graph, the families linked into it and the
/// interfaces feeding it. A loopback interface is added on construction.
pub struct Stack {
    graph: Arc<Graph>,
    arp: Arc<ArpFamily>,
    inet: Arc<InFamily>,
    families: Vec<Arc<dyn Family>>,
    interfaces: Mutex<Vec<Option<Interface>>>,
    config: StackConfig,
}

impl Stack {
    /// Must be called from within a tokio runtime, which runs the
    /// interface pumps and address timers.
    pub fn new(config: StackConfig) -> Result<Self, StackError> {
        config.validate()?;
        let graph = Arc::new(Graph::new());
        let arp = Arc::new(ArpFamily::new(graph.clone())?);
        let inet = InFamily::new(graph.clone(), arp.clone(), config.clone())?;
        let families: Vec<Arc<dyn Family>> = vec![inet.clone(), arp.clone()];
        let stack = Self {
            graph,
            arp,
            inet,
            families,
            interfaces: Mutex::new((0..MAX_INTERFACES).map(|_| None).collect()),
            config,
        };
        stack.add_interface(Arc::new(Loopback::new()), hardware::LOOPBACK)?;
        Ok(stack)
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// The internet family, where addresses and routers are configured.
    pub fn inet(&self) -> &Arc<InFamily> {
        &self.inet
    }

    pub fn arp(&self) -> &Arc<ArpFamily> {
        &self.arp
    }

    pub fn loopback_scope(&self) -> Option<ScopeId> {
        self.inet.loopback_scope()
    }

    /// The scopes of every interface, in slot order.
    pub fn interfaces(&self) -> Vec<ScopeId> {
        let interfaces = self.interfaces.lock().unwrap();
        interfaces
            .iter()
            .flatten()
            .map(|interface| interface.scope())
            .collect()
    }

    pub fn interface_mac(&self, scope: ScopeId) -> Option<Mac> {
        let interfaces = self.interfaces.lock().unwrap();
        interfaces.get(scope)?.as_ref().map(|interface| interface.mac())
    }

    /// Adds an interface over `device` and links every family that runs on
    /// `hardware` into it. Returns the new interface's scope.
    pub fn add_interface(
        &self,
        device: Arc<dyn Device>,
        hardware: u16,
    ) -> Result<ScopeId, InterfaceError> {
        let mut interfaces = self.interfaces.lock().unwrap();
        let scope = (1..MAX_INTERFACES)
            .find(|slot| interfaces[*slot].is_none())
            .ok_or(InterfaceError::TableFull)?;
        let interface = Interface::new(&self.graph, scope, device, hardware)?;
        let link = interface.link();

        let mut attached: Vec<&Arc<dyn Family>> = vec![];
        for family in self.families.iter().filter(|family| family.wants(hardware)) {
            if let Err(error) = family.attach_interface(&link) {
                warn!(scope, %error, "could not link a family to the interface");
                for family in attached.drain(..) {
                    family.detach_interface(&link);
                }
                interface.stop(&self.graph);
                Err(error)?
            }
            attached.push(family);
        }
        interface.start(self.graph.clone())?;
        interfaces[scope] = Some(interface);
        info!(scope, hardware, "interface added");
        Ok(scope)
    }

    /// Unlinks the families from the interface and stops its pump. The
    /// interface's addresses and routers go with it.
    pub fn remove_interface(&self, scope: ScopeId) -> Result<(), InterfaceError> {
        let interface = {
            let mut interfaces = self.interfaces.lock().unwrap();
            interfaces
                .get_mut(scope)
                .filter(|_| scope != 0)
                .and_then(Option::take)
                .ok_or(InterfaceError::UnknownScope(scope))?
        };
        let link = interface.link();
        for family in self.families.iter().filter(|f| f.wants(interface.hardware())) {
            family.detach_interface(&link);
        }
        interface.stop(&self.graph);
        Ok(())
    }

    /// Opens a socket. `protocol` is only read for raw sockets.
    pub fn socket(
        &self,
        family: FamilyId,
        kind: SocketType,
        protocol: u8,
    ) -> Result<Socket, SocketError> {
        match family {
            FamilyId::Inet => Socket::new(self.inet.clone(), kind, protocol),
            FamilyId::Arp => Err(SocketError::Unsupported),
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let interfaces = std::mem::take(&mut *self.interfaces.lock().unwrap());
        for interface in interfaces.into_iter().flatten() {
            interface.stop(&self.graph);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conduit::{Accessor, Key},
        device::Segment,
    };

    #[tokio::test]
    async fn loopback_takes_the_first_slot() {
        let stack = Stack::new(StackConfig::default()).unwrap();
        assert_eq!(stack.interfaces(), vec![1]);
        assert_eq!(stack.loopback_scope(), Some(1));
    }

    #[tokio::test]
    async fn slots_run_out_and_are_reused() {
        let stack = Stack::new(StackConfig::default()).unwrap();
        let segment = Segment::new();
        for n in 2..MAX_INTERFACES {
            let port = Arc::new(segment.port(Mac::new([2, 0, 0, 0, 0, n as u8])));
            assert_eq!(stack.add_interface(port, hardware::ETHERNET), Ok(n));
        }
        let port = Arc::new(segment.port(Mac::new([2, 0, 0, 0, 0, 0xee])));
        assert_eq!(
            stack.add_interface(port.clone(), hardware::ETHERNET),
            Err(InterfaceError::TableFull)
        );

        stack.remove_interface(3).unwrap();
        assert_eq!(stack.add_interface(port, hardware::ETHERNET), Ok(3));
        assert_eq!(stack.remove_interface(0), Err(InterfaceError::UnknownScope(0)));
    }

    #[tokio::test]
    async fn a_failed_link_undoes_the_families_already_linked() {
        let stack = Stack::new(StackConfig::default()).unwrap();
        let graph = stack.graph();
        let blocker = graph.add_mux(Accessor::Type);
        let scope = Key::Number(2);
        graph
            .connect_ba(stack.arp().scope_mux(), Some(scope), blocker)
            .unwrap();

        let port = Arc::new(Segment::new().port(Mac::new([2, 0, 0, 0, 0, 2])));
        assert!(stack.add_interface(port.clone(), hardware::ETHERNET).is_err());
        assert_eq!(stack.interfaces(), vec![1]);
        assert_eq!(graph.child(stack.inet().scope_mux(), scope), None);

        graph.remove_b(stack.arp().scope_mux(), Some(scope));
        assert_eq!(stack.add_interface(port, hardware::ETHERNET), Ok(2));
        assert_eq!(stack.interfaces(), vec![1, 2]);
    }

    #[tokio::test]
    async fn arp_sockets_do_not_exist() {
        let stack = Stack::new(StackConfig::default()).unwrap();
        assert!(matches!(
            stack.socket(FamilyId::Arp, SocketType::Dgram, 0),
            Err(SocketError::Unsupported)
        ));
    }

    #[tokio::test]
    async fn invalid_configuration_is_refused() {
        let config = StackConfig::default().default_ttl(0);
        assert!(matches!(
            Stack::new(config),
            Err(StackError::Config(ConfigError::ZeroTtl))
        ));
    }
}
