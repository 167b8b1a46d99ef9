use std::collections::VecDeque;

use crate::network::packet::{PacketRc, PacketStatus};

/// Packets queued per host by default. Arrivals beyond this are tail-dropped.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A router assists with moving packets between hosts across the simulated
/// network: packets inbound to a host are queued here until the host's
/// downlink relay forwards them to the network interface. The queue is a
/// bounded FIFO with tail drop.
#[derive(Debug)]
pub struct Router {
    inbound_packets: VecDeque<PacketRc>,
    capacity: usize,
}

impl Router {
    pub fn new() -> Router {
        Router {
            inbound_packets: VecDeque::new(),
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Queue an inbound packet. Returns true if the router changed from
    /// empty to non-empty (the signal to wake the downlink relay).
    pub fn push(&mut self, packet: PacketRc) -> bool {
        let was_empty = self.inbound_packets.is_empty();

        if self.inbound_packets.len() >= self.capacity {
            packet.add_status(PacketStatus::ROUTER_DROPPED);
            log::warn!(
                "Router queue full ({} packets); dropping packet to {}",
                self.capacity,
                packet.dst_address(),
            );
            return false;
        }

        packet.add_status(PacketStatus::ROUTER_ENQUEUED);
        self.inbound_packets.push_back(packet);

        was_empty
    }

    pub fn peek(&self) -> Option<&PacketRc> {
        self.inbound_packets.front()
    }

    pub fn pop(&mut self) -> Option<PacketRc> {
        let packet = self.inbound_packets.pop_front();
        if let Some(packet) = &packet {
            packet.add_status(PacketStatus::ROUTER_DEQUEUED);
        }
        packet
    }

    pub fn is_empty(&self) -> bool {
        self.inbound_packets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn packet() -> PacketRc {
        PacketRc::new_udp(
            "10.0.0.1:1".parse().unwrap(),
            "10.0.0.2:2".parse().unwrap(),
            Bytes::from_static(b"x"),
            0,
        )
    }

    #[test]
    fn test_fifo_order() {
        let mut router = Router::new();

        let first = packet();
        let second = packet();

        assert!(router.push(first.clone()));
        assert!(!router.push(second.clone()));

        assert!(router.pop().unwrap().status().contains(PacketStatus::ROUTER_DEQUEUED));
        assert!(first.status().contains(PacketStatus::ROUTER_DEQUEUED));
        assert!(!second.status().contains(PacketStatus::ROUTER_DEQUEUED));

        router.pop().unwrap();
        assert!(router.is_empty());
    }

    #[test]
    fn test_tail_drop_when_full() {
        let mut router = Router::new();
        router.capacity = 2;

        router.push(packet());
        router.push(packet());

        let dropped = packet();
        router.push(dropped.clone());

        assert!(dropped.status().contains(PacketStatus::ROUTER_DROPPED));
        assert!(!dropped.status().contains(PacketStatus::ROUTER_ENQUEUED));

        // the queue still holds only the first two
        router.pop().unwrap();
        router.pop().unwrap();
        assert!(router.pop().is_none());
    }
}
