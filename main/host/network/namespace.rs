use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Weak};

use rand::Rng;

use crate::host::descriptor::socket::inet::InetSocket;
use crate::host::network::interface::NetworkInterface;
use crate::network::packet::Protocol;

/// The ephemeral port range (the Linux default).
const EPHEMERAL_PORT_LOW: u16 = 32768;
const EPHEMERAL_PORT_HIGH: u16 = 60999;

/// A host's network namespace: its loopback and internet-facing interfaces,
/// and the port-association bookkeeping shared between them.
pub struct NetworkNamespace {
    pub default_ip: Ipv4Addr,
    pub localhost: Arc<NetworkInterface>,
    pub internet: Arc<NetworkInterface>,
}

impl NetworkNamespace {
    pub fn new(default_ip: Ipv4Addr) -> Self {
        assert!(!default_ip.is_loopback());

        Self {
            default_ip,
            localhost: Arc::new(NetworkInterface::new(Ipv4Addr::LOCALHOST)),
            internet: Arc::new(NetworkInterface::new(default_ip)),
        }
    }

    /// The interface with the given address, if any.
    pub fn interface(&self, addr: Ipv4Addr) -> Option<&Arc<NetworkInterface>> {
        if addr.is_loopback() {
            Some(&self.localhost)
        } else if addr == self.default_ip {
            Some(&self.internet)
        } else {
            None
        }
    }

    pub fn is_interface_available(
        &self,
        protocol: Protocol,
        local: SocketAddrV4,
        peer: SocketAddrV4,
    ) -> bool {
        if local.ip().is_unspecified() {
            // must be available on all interfaces
            !self.localhost.is_addr_in_use(protocol, local.port(), peer)
                && !self.internet.is_addr_in_use(protocol, local.port(), peer)
        } else {
            match self.interface(*local.ip()) {
                Some(interface) => !interface.is_addr_in_use(protocol, local.port(), peer),
                None => false,
            }
        }
    }

    /// Draw an unused ephemeral port for the given association, or None if
    /// every ephemeral port is somehow taken.
    pub fn get_random_free_port(
        &self,
        protocol: Protocol,
        local_ip: Ipv4Addr,
        peer: SocketAddrV4,
        mut rng: impl Rng,
    ) -> Option<u16> {
        let range = EPHEMERAL_PORT_HIGH - EPHEMERAL_PORT_LOW + 1;
        let start = EPHEMERAL_PORT_LOW + (rng.gen::<u16>() % range);

        for i in 0..range {
            let port = EPHEMERAL_PORT_LOW + ((start - EPHEMERAL_PORT_LOW + i) % range);
            if self.is_interface_available(protocol, SocketAddrV4::new(local_ip, port), peer) {
                return Some(port);
            }
        }

        None
    }

    /// Associate the socket for incoming packets at `local` from `peer`.
    /// Returns a handle that disassociates the socket when dropped.
    pub fn associate(
        &self,
        socket: &InetSocket,
        protocol: Protocol,
        local: SocketAddrV4,
        peer: SocketAddrV4,
    ) -> AssociationHandle {
        if local.ip().is_unspecified() {
            // bind to every interface
            self.localhost
                .associate(socket, protocol, local.port(), peer);
            self.internet.associate(socket, protocol, local.port(), peer);

            AssociationHandle {
                interfaces: vec![
                    Arc::downgrade(&self.localhost),
                    Arc::downgrade(&self.internet),
                ],
                protocol,
                port: local.port(),
                peer,
            }
        } else {
            let interface = self.interface(*local.ip()).unwrap();
            interface.associate(socket, protocol, local.port(), peer);

            AssociationHandle {
                interfaces: vec![Arc::downgrade(interface)],
                protocol,
                port: local.port(),
                peer,
            }
        }
    }

    /// Remove all socket associations. Used during host shutdown.
    pub fn shutdown(&self) {
        self.localhost.remove_all_sockets();
        self.internet.remove_all_sockets();
    }
}

/// While this handle is held, the socket stays associated (and reachable by
/// incoming packets). Dropping the handle disassociates it.
pub struct AssociationHandle {
    interfaces: Vec<Weak<NetworkInterface>>,
    protocol: Protocol,
    port: u16,
    peer: SocketAddrV4,
}

impl AssociationHandle {
    pub fn local_port(&self) -> u16 {
        self.port
    }
}

impl Drop for AssociationHandle {
    fn drop(&mut self) {
        for interface in &self.interfaces {
            if let Some(interface) = interface.upgrade() {
                interface.disassociate(self.protocol, self.port, self.peer);
            }
        }
    }
}
