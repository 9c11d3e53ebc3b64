//! Hand-off buffer between receive loops and the simulation thread.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;

/// What happened on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// The server accepted a new peer
    Connected,
    /// One raw application frame, still to be decoded
    Received(Bytes),
    /// The peer was lost or hung up
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub peer_id: u32,
    pub origin: SocketAddr,
    /// Position in the queue's push order, stamped by [`PacketQueue::push`]
    pub arrival_order: u64,
    pub event: NetEvent,
}

impl QueueItem {
    pub fn new(peer_id: u32, origin: SocketAddr, event: NetEvent) -> Self {
        Self {
            peer_id,
            origin,
            arrival_order: 0,
            event,
        }
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match &self.event {
            NetEvent::Received(bytes) => Some(bytes),
            _ => None,
        }
    }
}

struct QueueState {
    items: VecDeque<QueueItem>,
    next_order: u64,
    closed: bool,
}

/// Unbounded multi-producer FIFO. `push` never blocks and `try_pop` never waits.
///
/// Items from one producer come out in the order that producer pushed them; there is
/// no ordering between producers beyond the shared arrival stamp.
pub struct PacketQueue {
    state: Mutex<QueueState>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                next_order: 0,
                closed: false,
            }),
        }
    }

    /// Appends `item`; returns false (and drops it) once the queue is closed.
    pub fn push(&self, mut item: QueueItem) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        item.arrival_order = state.next_order;
        state.next_order += 1;
        state.items.push_back(item);
        true
    }

    pub fn try_pop(&self) -> Option<QueueItem> {
        self.state.lock().items.pop_front()
    }

    /// Takes every queued item at once.
    pub fn drain(&self) -> Vec<QueueItem> {
        self.state.lock().items.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Stops accepting items. Already queued items can still be popped.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}
