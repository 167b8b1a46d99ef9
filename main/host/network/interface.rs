use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use atomic_refcell::AtomicRefCell;

use crate::core::worker::Worker;
use crate::host::descriptor::socket::inet::InetSocket;
use crate::host::network::queuing::NetworkQueue;
use crate::host::Host;
use crate::network::packet::{PacketRc, PacketStatus, Protocol};
use crate::network::PacketDevice;
use crate::utility::callback_queue::CallbackQueue;

/// The priority used by the fifo qdisc to choose the next socket to send a
/// packet from.
pub type FifoPacketPriority = u64;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct AssociatedSocketKey {
    protocol: Protocol,
    local: SocketAddrV4,
    remote: SocketAddrV4,
}

impl AssociatedSocketKey {
    fn new(protocol: Protocol, local: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self {
            protocol,
            local,
            remote,
        }
    }
}

/// Represents a network device that can send and receive packets.
pub struct NetworkInterface {
    addr: Ipv4Addr,
    /// The sockets from which we will pull out packets so that we can send
    /// them over the network.
    send_sockets: AtomicRefCell<NetworkQueue>,
    /// The sockets to which we will push incoming packets so they can be
    /// received by the network stack and their payloads read by the managed
    /// process.
    recv_sockets: AtomicRefCell<HashMap<AssociatedSocketKey, InetSocket>>,
}

impl NetworkInterface {
    /// Create a new network interface for the assigned `addr`.
    pub fn new(addr: Ipv4Addr) -> Self {
        log::debug!("Bringing up network interface at '{addr}'");

        Self {
            addr,
            send_sockets: AtomicRefCell::new(NetworkQueue::new()),
            recv_sockets: AtomicRefCell::new(HashMap::new()),
        }
    }

    pub fn associate(
        &self,
        socket: &InetSocket,
        protocol: Protocol,
        port: u16,
        peer: SocketAddrV4,
    ) {
        let local = SocketAddrV4::new(self.addr, port);
        let key = AssociatedSocketKey::new(protocol, local, peer);
        log::trace!("Associating socket key {key:?}");

        if let Entry::Vacant(entry) = self.recv_sockets.borrow_mut().entry(key) {
            entry.insert(socket.clone());
        } else {
            debug_panic!("Socket association entry is unexpectedly occupied");
        }
    }

    pub fn disassociate(&self, protocol: Protocol, port: u16, peer: SocketAddrV4) {
        let local = SocketAddrV4::new(self.addr, port);
        let key = AssociatedSocketKey::new(protocol, local, peer);
        log::trace!("Disassociating socket key {key:?}");

        if self.recv_sockets.borrow_mut().remove(&key).is_none() {
            debug_panic!("Attempted to disassociate a vacant socket key");
        }
    }

    pub fn is_addr_in_use(&self, protocol: Protocol, port: u16, peer: SocketAddrV4) -> bool {
        let local = SocketAddrV4::new(self.addr, port);
        let key = AssociatedSocketKey::new(protocol, local, peer);
        self.recv_sockets.borrow().contains_key(&key)
    }

    /// Add the socket to the list of sockets that have data ready for us to
    /// send out to the network.
    pub fn add_data_source(&self, socket: &InetSocket) {
        debug_assert!(socket.borrow().has_data_to_send());
        self.send_sockets.borrow_mut().push(socket.clone());
    }

    /// Disassociate all bound sockets and remove sockets from the sending
    /// queue. Used during host shutdown.
    pub fn remove_all_sockets(&self) {
        self.recv_sockets.borrow_mut().clear();
        self.send_sockets.borrow_mut().clear();
    }

    /// A segment arrived for which no socket is associated. For TCP we answer
    /// with a RST so the peer learns the port is closed; everything else is
    /// dropped silently.
    fn handle_unreachable_packet(&self, host: &Host, packet: PacketRc) {
        packet.add_status(PacketStatus::RCV_INTERFACE_DROPPED);

        let Some(tcp_header) = packet.tcp_header() else {
            return;
        };

        if tcp_header.flags.contains(tcp::TcpFlags::RST) {
            // never respond to a reset with a reset
            return;
        }

        let seg_len = packet.payload_size() as u32
            + u32::from(tcp_header.flags.contains(tcp::TcpFlags::SYN))
            + u32::from(tcp_header.flags.contains(tcp::TcpFlags::FIN));

        let rst = tcp::TcpHeader {
            ip: tcp::Ipv4Header {
                src: tcp_header.ip.dst,
                dst: tcp_header.ip.src,
            },
            flags: tcp::TcpFlags::RST | tcp::TcpFlags::ACK,
            src_port: tcp_header.dst_port,
            dst_port: tcp_header.src_port,
            seq: if tcp_header.flags.contains(tcp::TcpFlags::ACK) {
                tcp_header.ack
            } else {
                0
            },
            ack: tcp_header.seq.wrapping_add(seg_len),
            window_size: 0,
            selective_acks: None,
            window_scale: None,
            timestamp: None,
            timestamp_echo: tcp_header.timestamp,
        };

        let priority = host.get_next_packet_priority();
        let reply = PacketRc::new_tcp(rst, tcp::Payload::default(), priority);

        log::debug!(
            "No socket at {}; answering segment from {} with RST",
            packet.dst_address(),
            packet.src_address()
        );

        host.deliver_packet(reply);
    }
}

impl PacketDevice for NetworkInterface {
    fn get_address(&self) -> Ipv4Addr {
        self.addr
    }

    // Pops a packet from the interface to send over the simulated network.
    fn pop(&self, _host: &Host) -> Option<PacketRc> {
        loop {
            // choose the next socket that will send a packet
            let socket = self.send_sockets.borrow_mut().pop()?;

            let Some(packet) =
                CallbackQueue::queue_and_run(|cb_queue| socket.borrow_mut().pull_out_packet(cb_queue))
            else {
                // the socket changed state since it was added to our queue, so
                // we tolerate the case that it no longer has a sendable packet
                continue;
            };

            // if the socket has more packets, keep tracking it for future
            // sends
            if socket.borrow().has_data_to_send() {
                self.add_data_source(&socket);
            }

            packet.add_status(PacketStatus::SND_INTERFACE_SENT);

            return Some(packet);
        }
    }

    // Pushes a packet from the simulated network into the interface.
    fn push(&self, host: &Host, packet: PacketRc) {
        // the packet is successfully received by this interface
        packet.add_status(PacketStatus::RCV_INTERFACE_RECEIVED);

        // find the socket that should process the packet
        let protocol = packet.protocol();
        let local = SocketAddrV4::new(self.addr, packet.dst_address().port());
        let peer = packet.src_address();
        let key = AssociatedSocketKey::new(protocol, local, peer);

        let maybe_socket = {
            let associated = self.recv_sockets.borrow();
            associated
                .get(&key)
                .or_else(|| {
                    // fall back to the wildcard association
                    let wildcard = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
                    let key = AssociatedSocketKey::new(protocol, local, wildcard);
                    associated.get(&key)
                })
                // Pushing a packet to the socket may cause the socket to be
                // disassociated, so we can't hold the borrow of
                // `recv_sockets` during `push_in_packet`; clone instead.
                .cloned()
        };

        if let Some(socket) = maybe_socket {
            let recv_time = Worker::current_time().unwrap();
            CallbackQueue::queue_and_run(|cb_queue| {
                socket
                    .borrow_mut()
                    .push_in_packet(packet, cb_queue, recv_time);
            });
        } else {
            self.handle_unreachable_packet(host, packet);
        }
    }
}
