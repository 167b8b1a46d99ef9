use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::host::network::interface::FifoPacketPriority;

/// The layer-4 protocol of a packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A UDP header: just the address pair (ports included).
#[derive(Copy, Clone, Debug)]
pub struct UdpHeader {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

/// The transport header of a packet.
#[derive(Clone, Debug)]
pub enum PacketHeader {
    Tcp(tcp::TcpHeader),
    Udp(UdpHeader),
}

bitflags::bitflags! {
    /// Delivery-status trace marks. Accumulated as the packet moves through
    /// the stack; used for post-hoc assertions and tracing, never for
    /// behaviour.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PacketStatus: u32 {
        const SND_CREATED = 1 << 0;
        const SND_SOCKET_BUFFERED = 1 << 1;
        const SND_INTERFACE_SENT = 1 << 2;
        const SND_INET_SENT = 1 << 3;
        const SND_INET_DROPPED = 1 << 4;
        const ROUTER_ENQUEUED = 1 << 5;
        const ROUTER_DEQUEUED = 1 << 6;
        const ROUTER_DROPPED = 1 << 7;
        const RELAY_CACHED = 1 << 8;
        const RELAY_FORWARDED = 1 << 9;
        const RCV_INTERFACE_RECEIVED = 1 << 10;
        const RCV_INTERFACE_DROPPED = 1 << 11;
        const RCV_SOCKET_BUFFERED = 1 << 12;
        const RCV_SOCKET_DELIVERED = 1 << 13;
        const RCV_SOCKET_DROPPED = 1 << 14;
        const DESTROYED = 1 << 15;
    }
}

#[derive(Debug)]
struct PacketInner {
    header: PacketHeader,
    payload: tcp::Payload,
    priority: FifoPacketPriority,
    /// Trace marks; interior-mutable so that every clone of the packet
    /// contributes to the same trace.
    status: AtomicU32,
}

/// A reference-counted packet. The header and payload are immutable once the
/// packet is sealed at creation; only the delivery-status trace accumulates.
#[derive(Clone, Debug)]
pub struct PacketRc {
    inner: Arc<PacketInner>,
}

impl PacketRc {
    pub fn new_tcp(
        header: tcp::TcpHeader,
        payload: tcp::Payload,
        priority: FifoPacketPriority,
    ) -> Self {
        Self {
            inner: Arc::new(PacketInner {
                header: PacketHeader::Tcp(header),
                payload,
                priority,
                status: AtomicU32::new(PacketStatus::SND_CREATED.bits()),
            }),
        }
    }

    pub fn new_udp(
        src: SocketAddrV4,
        dst: SocketAddrV4,
        payload: Bytes,
        priority: FifoPacketPriority,
    ) -> Self {
        Self {
            inner: Arc::new(PacketInner {
                header: PacketHeader::Udp(UdpHeader { src, dst }),
                payload: tcp::Payload(vec![payload]),
                priority,
                status: AtomicU32::new(PacketStatus::SND_CREATED.bits()),
            }),
        }
    }

    pub fn header(&self) -> &PacketHeader {
        &self.inner.header
    }

    pub fn tcp_header(&self) -> Option<&tcp::TcpHeader> {
        match &self.inner.header {
            PacketHeader::Tcp(header) => Some(header),
            PacketHeader::Udp(_) => None,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self.inner.header {
            PacketHeader::Tcp(_) => Protocol::Tcp,
            PacketHeader::Udp(_) => Protocol::Udp,
        }
    }

    pub fn src_address(&self) -> SocketAddrV4 {
        match &self.inner.header {
            PacketHeader::Tcp(header) => header.src(),
            PacketHeader::Udp(header) => header.src,
        }
    }

    pub fn dst_address(&self) -> SocketAddrV4 {
        match &self.inner.header {
            PacketHeader::Tcp(header) => header.dst(),
            PacketHeader::Udp(header) => header.dst,
        }
    }

    pub fn payload(&self) -> &tcp::Payload {
        &self.inner.payload
    }

    pub fn payload_size(&self) -> usize {
        self.inner.payload.len() as usize
    }

    /// Total on-the-wire size used for rate limiting: payload plus the IP
    /// header plus the transport header.
    pub fn total_size(&self) -> usize {
        let header_overhead = match self.protocol() {
            Protocol::Tcp => 40,
            Protocol::Udp => 28,
        };
        self.payload_size() + header_overhead
    }

    pub fn priority(&self) -> FifoPacketPriority {
        self.inner.priority
    }

    pub fn add_status(&self, status: PacketStatus) {
        self.inner.status.fetch_or(status.bits(), Ordering::Relaxed);
    }

    pub fn status(&self) -> PacketStatus {
        PacketStatus::from_bits_truncate(self.inner.status.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_packet() -> PacketRc {
        PacketRc::new_udp(
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.0.2:2000".parse().unwrap(),
            Bytes::from_static(b"ping"),
            7,
        )
    }

    #[test]
    fn test_addresses_and_sizes() {
        let packet = test_packet();
        assert_eq!(packet.protocol(), Protocol::Udp);
        assert_eq!(packet.src_address().port(), 1000);
        assert_eq!(packet.dst_address().port(), 2000);
        assert_eq!(packet.payload_size(), 4);
        assert_eq!(packet.total_size(), 4 + 28);
        assert_eq!(packet.priority(), 7);
    }

    #[test]
    fn test_status_accumulates_across_clones() {
        let packet = test_packet();
        assert_eq!(packet.status(), PacketStatus::SND_CREATED);

        let clone = packet.clone();
        clone.add_status(PacketStatus::ROUTER_ENQUEUED);
        packet.add_status(PacketStatus::ROUTER_DEQUEUED);

        let expected =
            PacketStatus::SND_CREATED | PacketStatus::ROUTER_ENQUEUED | PacketStatus::ROUTER_DEQUEUED;
        assert_eq!(packet.status(), expected);
        assert_eq!(clone.status(), expected);
    }
}
