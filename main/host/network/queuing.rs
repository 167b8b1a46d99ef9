//! Queuing discipline for selecting the next socket to send a packet from.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use crate::host::descriptor::socket::inet::InetSocket;
use crate::host::network::interface::FifoPacketPriority;

/// A queue of sockets with data ready to send. Sockets are dequeued in the
/// order they became sendable (a packet fifo, close to the default Linux
/// qdisc): the queue stamps each inserted socket with a monotonically
/// increasing priority and pops the minimum.
pub struct NetworkQueue {
    queue: BinaryHeap<Reverse<PrioritizedSocket>>,
    /// Canonical handles of the queued sockets, to keep membership checks
    /// cheap and to prevent duplicate entries.
    members: HashSet<usize>,
    next_priority: FifoPacketPriority,
}

struct PrioritizedSocket {
    priority: FifoPacketPriority,
    socket: InetSocket,
}

impl PartialEq for PrioritizedSocket {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for PrioritizedSocket {}

impl PartialOrd for PrioritizedSocket {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioritizedSocket {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority.cmp(&other.priority)
    }
}

impl NetworkQueue {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            members: HashSet::new(),
            next_priority: 0,
        }
    }

    pub fn contains(&self, socket: &InetSocket) -> bool {
        self.members.contains(&socket.canonical_handle())
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Add a socket. Does nothing if the socket is already queued.
    pub fn push(&mut self, socket: InetSocket) {
        if !self.members.insert(socket.canonical_handle()) {
            return;
        }

        let priority = self.next_priority;
        self.next_priority += 1;

        self.queue.push(Reverse(PrioritizedSocket { priority, socket }));
    }

    /// Remove and return the socket that has been sendable the longest.
    pub fn pop(&mut self) -> Option<InetSocket> {
        let Reverse(PrioritizedSocket { socket, .. }) = self.queue.pop()?;
        self.members.remove(&socket.canonical_handle());
        Some(socket)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.members.clear();
    }
}
