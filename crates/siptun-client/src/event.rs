//! Cross-thread event queue drained by the pump

use siptun_proto::LinkDirection;
use tokio::sync::mpsc;
use tracing::trace;

/// Notification produced off the pump thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Outcome of one UDP mirror probe
    ProbeResult { generation: u64, reachable: bool },
    /// A link of the link set `generation` connected or dropped
    LinkChanged {
        generation: u64,
        direction: LinkDirection,
        connected: bool,
    },
}

/// Producer side; cheap to clone, never blocks
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    pub fn post(&self, event: Event) {
        if self.tx.send(event).is_err() {
            trace!("Event dropped, manager is gone: {:?}", event);
        }
    }
}

/// FIFO queue owned by the manager
#[derive(Debug)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Next pending event, if any
    pub fn pop(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
