use crate::{
    address::Inet4Address,
    conduit::{Graph, NodeId, Receiver},
    message::{Command, Message},
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};
use tracing::debug;

/// A received datagram waiting for a socket to read it.
#[derive(Debug, Clone)]
struct Datagram {
    from: Arc<Inet4Address>,
    port: u16,
    data: Vec<u8>,
}

#[derive(Default)]
struct Queue {
    datagrams: VecDeque<Datagram>,
    bytes: usize,
    /// The code of an ICMP error not yet reported to the socket.
    error: Option<u8>,
}

/// The per-socket end of a UDP or raw IP binding. Buffers what arrives until
/// the socket reads it.
pub(crate) struct DatagramReceiver {
    queue: Mutex<Queue>,
    capacity: usize,
    /// The IP protocol number of a raw binding.
    raw: Option<u8>,
}

impl DatagramReceiver {
    pub fn new(capacity: usize, raw: Option<u8>) -> Self {
        Self {
            queue: Default::default(),
            capacity,
            raw,
        }
    }
}

impl Receiver for DatagramReceiver {
    fn input(&self, _graph: &Graph, node: NodeId, message: &mut Message) -> bool {
        let Some(from) = message.remote.clone() else {
            return false;
        };
        let mut queue = self.queue.lock().unwrap();
        if queue.bytes + message.len() > self.capacity {
            debug!(node, len = message.len(), "receive queue full, dropping datagram");
            return false;
        }
        queue.bytes += message.len();
        queue.datagrams.push_back(Datagram {
            from,
            port: message.remote_port,
            data: message.payload().to_vec(),
        });
        true
    }

    fn output(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        if let Some(number) = self.raw {
            message.packet_type = number as u16;
        }
        true
    }

    fn error(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        self.queue.lock().unwrap().error = Some(message.error_code);
        true
    }

    fn read(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if let Some(datagram) = queue.datagrams.pop_front() {
            queue.bytes -= datagram.data.len();
            message.fill(&datagram.data);
            message.remote = Some(datagram.from);
            message.remote_port = datagram.port;
        } else if let Some(code) = queue.error.take() {
            message.command = Command::Error;
            message.error_code = code;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::{AddressKind, State},
        wire::Ipv4Address,
    };

    fn arriving(payload: &[u8]) -> Message {
        let mut message = Message::input(payload, 1);
        message.remote = Some(Inet4Address::detached(
            Ipv4Address::new([10, 0, 0, 2]),
            1,
            AddressKind::Remote,
            State::Init,
        ));
        message.remote_port = 4000;
        message
    }

    #[test]
    fn datagrams_beyond_capacity_are_dropped() {
        let graph = Graph::new();
        let receiver = DatagramReceiver::new(5, None);
        assert!(receiver.input(&graph, 0, &mut arriving(b"abc")));
        assert!(!receiver.input(&graph, 0, &mut arriving(b"def")));

        let mut read = Message::read(16);
        assert!(!receiver.read(&graph, 0, &mut read));
        assert!(read.produced);
        assert_eq!(read.payload(), b"abc");
        assert_eq!(read.remote_port, 4000);
        assert!(receiver.input(&graph, 0, &mut arriving(b"defgh")));
    }

    #[test]
    fn errors_are_reported_once() {
        let graph = Graph::new();
        let receiver = DatagramReceiver::new(64, None);
        let mut error = Message::output(&[], 0);
        error.command = Command::Error;
        error.error_code = 3;
        assert!(receiver.error(&graph, 0, &mut error));

        let mut read = Message::read(16);
        receiver.read(&graph, 0, &mut read);
        assert_eq!(read.command, Command::Error);
        assert_eq!(read.error_code, 3);

        let mut read = Message::read(16);
        receiver.read(&graph, 0, &mut read);
        assert_eq!(read.command, Command::Read);
        assert!(!read.produced);
    }
}
