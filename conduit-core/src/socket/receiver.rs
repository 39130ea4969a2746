use crate::{
    conduit::{Graph, NodeId, Receiver},
    family::inet4::signal,
    message::Message,
};
use std::sync::Mutex;
use tokio::sync::watch;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Status {
    pub connected: bool,
    /// The peer sent FIN.
    pub closed: bool,
    pub reset: bool,
}

/// The adapter between a socket and the top of its protocol chain. It holds
/// no data, it only wakes the socket when something arrives.
pub(crate) struct SocketReceiver {
    events: watch::Sender<u64>,
    status: Mutex<Status>,
}

impl Default for SocketReceiver {
    fn default() -> Self {
        let (events, _) = watch::channel(0);
        Self {
            events,
            status: Default::default(),
        }
    }
}

impl SocketReceiver {
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.events.subscribe()
    }

    pub fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }

    fn record(&self, control: u8) {
        {
            let mut status = self.status.lock().unwrap();
            if control & signal::CONNECTED != 0 {
                status.connected = true;
            }
            if control & signal::CLOSED != 0 {
                status.closed = true;
            }
            if control & signal::RESET != 0 {
                status.reset = true;
            }
        }
        self.events.send_modify(|count| *count = count.wrapping_add(1));
    }
}

impl Receiver for SocketReceiver {
    fn input(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        self.record(message.control);
        true
    }

    fn error(&self, _graph: &Graph, _node: NodeId, message: &mut Message) -> bool {
        self.record(message.control);
        true
    }

    fn read(&self, _graph: &Graph, _node: NodeId, _message: &mut Message) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_are_recorded_and_wake_waiters() {
        let receiver = SocketReceiver::default();
        let mut events = receiver.subscribe();
        let graph = Graph::new();
        let mut message = Message::input(&[], 1);
        message.control = signal::CONNECTED | signal::DATA;
        assert!(receiver.input(&graph, 0, &mut message));
        assert!(receiver.status().connected);
        assert!(!receiver.status().closed);
        assert_eq!(*events.borrow_and_update(), 1);

        message.control = signal::RESET;
        receiver.error(&graph, 0, &mut message);
        assert!(receiver.status().reset);
        assert_eq!(*events.borrow_and_update(), 2);
    }
}
