use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;
use sim_support::emulated_time::EmulatedTime;
use sim_support::syscall_types::ForeignPtr;

use crate::host::descriptor::listener::{StateListenHandle, StateListenerFilter};
use crate::host::descriptor::socket::{RecvmsgArgs, RecvmsgReturn, SendmsgArgs, ShutdownFlags};
use crate::host::descriptor::{FileMode, FileSignals, FileState, FileStatus, OpenFile};
use crate::host::memory_manager::MemoryManager;
use crate::host::network::namespace::{AssociationHandle, NetworkNamespace};
use crate::host::syscall::io::IoVec;
use crate::host::syscall::types::{SyscallError, SyscallResult};
use crate::network::packet::{PacketRc, Protocol};
use crate::utility::callback_queue::CallbackQueue;

pub mod tcp;
pub mod udp;

pub use self::tcp::TcpSocket;
pub use self::udp::UdpSocket;

#[derive(Clone)]
pub enum InetSocket {
    Tcp(Arc<AtomicRefCell<TcpSocket>>),
    Udp(Arc<AtomicRefCell<UdpSocket>>),
}

impl InetSocket {
    pub fn borrow(&self) -> InetSocketRef {
        match self {
            Self::Tcp(f) => InetSocketRef::Tcp(f.borrow()),
            Self::Udp(f) => InetSocketRef::Udp(f.borrow()),
        }
    }

    pub fn borrow_mut(&self) -> InetSocketRefMut {
        match self {
            Self::Tcp(f) => InetSocketRefMut::Tcp(f.borrow_mut()),
            Self::Udp(f) => InetSocketRefMut::Udp(f.borrow_mut()),
        }
    }

    pub fn canonical_handle(&self) -> usize {
        match self {
            Self::Tcp(f) => Arc::as_ptr(f) as usize,
            Self::Udp(f) => Arc::as_ptr(f) as usize,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Tcp(_) => Protocol::Tcp,
            Self::Udp(_) => Protocol::Udp,
        }
    }

    pub fn bind(
        &self,
        addr: Option<SocketAddrV4>,
        net_ns: &NetworkNamespace,
        rng: impl rand::Rng,
    ) -> Result<(), SyscallError> {
        match self {
            Self::Tcp(socket) => TcpSocket::bind(socket, addr, net_ns, rng),
            Self::Udp(socket) => UdpSocket::bind(socket, addr, net_ns, rng),
        }
    }

    pub fn listen(
        &self,
        backlog: i32,
        net_ns: &NetworkNamespace,
        rng: impl rand::Rng,
        cb_queue: &mut CallbackQueue,
    ) -> Result<(), SyscallError> {
        match self {
            Self::Tcp(socket) => TcpSocket::listen(socket, backlog, net_ns, rng, cb_queue),
            Self::Udp(_) => Err(Errno::EOPNOTSUPP.into()),
        }
    }

    pub fn connect(
        &self,
        addr: SocketAddrV4,
        net_ns: &NetworkNamespace,
        rng: impl rand::Rng,
        cb_queue: &mut CallbackQueue,
    ) -> Result<(), SyscallError> {
        match self {
            Self::Tcp(socket) => TcpSocket::connect(socket, addr, net_ns, rng, cb_queue),
            Self::Udp(socket) => UdpSocket::connect(socket, addr, net_ns, rng, cb_queue),
        }
    }

    pub fn sendmsg(
        &self,
        args: SendmsgArgs,
        mem: &mut MemoryManager,
        net_ns: &NetworkNamespace,
        rng: impl rand::Rng,
        cb_queue: &mut CallbackQueue,
    ) -> Result<libc::ssize_t, SyscallError> {
        match self {
            Self::Tcp(socket) => TcpSocket::sendmsg(socket, args, mem, cb_queue),
            Self::Udp(socket) => UdpSocket::sendmsg(socket, args, mem, net_ns, rng, cb_queue),
        }
    }

    pub fn recvmsg(
        &self,
        args: RecvmsgArgs,
        mem: &mut MemoryManager,
        cb_queue: &mut CallbackQueue,
    ) -> Result<RecvmsgReturn, SyscallError> {
        match self {
            Self::Tcp(socket) => TcpSocket::recvmsg(socket, args, mem, cb_queue),
            Self::Udp(socket) => UdpSocket::recvmsg(socket, args, mem, cb_queue),
        }
    }
}

impl std::fmt::Debug for InetSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(_) => write!(f, "Tcp")?,
            Self::Udp(_) => write!(f, "Udp")?,
        }

        let socket = self.borrow();
        write!(
            f,
            "(state: {:?}, status: {:?})",
            socket.state(),
            socket.status()
        )
    }
}

pub enum InetSocketRef<'a> {
    Tcp(atomic_refcell::AtomicRef<'a, TcpSocket>),
    Udp(atomic_refcell::AtomicRef<'a, UdpSocket>),
}

pub enum InetSocketRefMut<'a> {
    Tcp(atomic_refcell::AtomicRefMut<'a, TcpSocket>),
    Udp(atomic_refcell::AtomicRefMut<'a, UdpSocket>),
}

// file functions
impl InetSocketRef<'_> {
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn state(&self) -> FileState
    );
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn mode(&self) -> FileMode
    );
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn status(&self) -> FileStatus
    );
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn has_open_file(&self) -> bool
    );
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn supports_sa_restart(&self) -> bool
    );
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn getsockname(&self) -> Result<Option<SocketAddrV4>, SyscallError>
    );
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn getpeername(&self) -> Result<Option<SocketAddrV4>, SyscallError>
    );
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn has_data_to_send(&self) -> bool
    );
}

// file functions
impl InetSocketRefMut<'_> {
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn state(&self) -> FileState
    );
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn mode(&self) -> FileMode
    );
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn status(&self) -> FileStatus
    );
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn has_open_file(&self) -> bool
    );
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn supports_sa_restart(&self) -> bool
    );
    enum_passthrough!(self, (val), Tcp, Udp;
        pub fn set_has_open_file(&mut self, val: bool)
    );
    enum_passthrough!(self, (status), Tcp, Udp;
        pub fn set_status(&mut self, status: FileStatus)
    );
    enum_passthrough!(self, (cb_queue), Tcp, Udp;
        pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError>
    );
    enum_passthrough!(self, (request, arg_ptr, memory_manager), Tcp, Udp;
        pub fn ioctl(&mut self, request: u64, arg_ptr: ForeignPtr<()>, memory_manager: &mut MemoryManager) -> SyscallResult
    );
    enum_passthrough!(self, (monitoring_state, monitoring_signals, filter, notify_fn), Tcp, Udp;
        pub fn add_listener(
            &mut self,
            monitoring_state: FileState,
            monitoring_signals: FileSignals,
            filter: StateListenerFilter,
            notify_fn: impl Fn(FileState, FileState, FileSignals, &mut CallbackQueue) + Send + Sync + 'static,
        ) -> StateListenHandle
    );
    enum_passthrough!(self, (iovs, offset, flags, mem, cb_queue), Tcp, Udp;
        pub fn readv(&mut self, iovs: &[IoVec], offset: Option<libc::off_t>, flags: libc::c_int,
                     mem: &mut MemoryManager, cb_queue: &mut CallbackQueue) -> Result<libc::ssize_t, SyscallError>
    );
    enum_passthrough!(self, (iovs, offset, flags, mem, cb_queue), Tcp, Udp;
        pub fn writev(&mut self, iovs: &[IoVec], offset: Option<libc::off_t>, flags: libc::c_int,
                      mem: &mut MemoryManager, cb_queue: &mut CallbackQueue) -> Result<libc::ssize_t, SyscallError>
    );
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn getsockname(&self) -> Result<Option<SocketAddrV4>, SyscallError>
    );
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn getpeername(&self) -> Result<Option<SocketAddrV4>, SyscallError>
    );
    enum_passthrough!(self, (how, cb_queue), Tcp, Udp;
        pub fn shutdown(&mut self, how: ShutdownFlags, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError>
    );
    enum_passthrough!(self, (level, optname, optval_ptr, optlen, mem), Tcp, Udp;
        pub fn getsockopt(&mut self, level: libc::c_int, optname: libc::c_int, optval_ptr: ForeignPtr<()>,
                          optlen: libc::socklen_t, mem: &mut MemoryManager)
        -> Result<libc::socklen_t, SyscallError>
    );
    enum_passthrough!(self, (level, optname, optval_ptr, optlen, mem), Tcp, Udp;
        pub fn setsockopt(&mut self, level: libc::c_int, optname: libc::c_int, optval_ptr: ForeignPtr<()>,
                          optlen: libc::socklen_t, mem: &MemoryManager)
        -> Result<(), SyscallError>
    );
    enum_passthrough!(self, (packet, cb_queue, recv_time), Tcp, Udp;
        pub fn push_in_packet(&mut self, packet: PacketRc, cb_queue: &mut CallbackQueue, recv_time: EmulatedTime)
    );
    enum_passthrough!(self, (cb_queue), Tcp, Udp;
        pub fn pull_out_packet(&mut self, cb_queue: &mut CallbackQueue) -> Option<PacketRc>
    );
    enum_passthrough!(self, (), Tcp, Udp;
        pub fn has_data_to_send(&self) -> bool
    );

    pub fn accept(
        &mut self,
        net_ns: &NetworkNamespace,
        cb_queue: &mut CallbackQueue,
    ) -> Result<OpenFile, SyscallError> {
        match self {
            Self::Tcp(socket) => socket.accept(net_ns, cb_queue),
            Self::Udp(_) => Err(Errno::EOPNOTSUPP.into()),
        }
    }
}

/// Associate the socket with a network interface. If the local address is
/// unspecified, the socket will be associated with every available interface.
/// If the local address has a port of 0, a non-zero port will be chosen. The
/// final local address is returned along with the association handle.
pub(crate) fn associate_socket(
    socket: InetSocket,
    local_addr: SocketAddrV4,
    peer_addr: SocketAddrV4,
    net_ns: &NetworkNamespace,
    rng: impl rand::Rng,
) -> Result<(SocketAddrV4, AssociationHandle), SyscallError> {
    log::trace!("Trying to associate socket with addresses (local={local_addr}, peer={peer_addr})");

    if !local_addr.ip().is_unspecified() && net_ns.interface(*local_addr.ip()).is_none() {
        log::debug!(
            "No network interface exists for the provided local address {}",
            local_addr.ip(),
        );
        return Err(Errno::EINVAL.into());
    };

    let protocol = socket.protocol();

    // get a free ephemeral port if they didn't specify one
    let local_addr = if local_addr.port() != 0 {
        local_addr
    } else {
        let Some(new_port) =
            net_ns.get_random_free_port(protocol, *local_addr.ip(), peer_addr, rng)
        else {
            log::debug!("Association required an ephemeral port but none are available");
            return Err(Errno::EADDRINUSE.into());
        };

        log::trace!("Associating with generated ephemeral port {new_port}");

        SocketAddrV4::new(*local_addr.ip(), new_port)
    };

    // make sure the port is available at this address for this protocol
    if !net_ns.is_interface_available(protocol, local_addr, peer_addr) {
        log::debug!(
            "The provided addresses (local={local_addr}, peer={peer_addr}) are not available"
        );
        return Err(Errno::EADDRINUSE.into());
    }

    let handle = net_ns.associate(&socket, protocol, local_addr, peer_addr);

    Ok((local_addr, handle))
}

/// Pick the local interface address to use when communicating with a peer:
/// loopback peers bind to loopback, everything else to the default address.
pub(crate) fn default_local_ip_for_peer(net_ns: &NetworkNamespace, peer: Ipv4Addr) -> Ipv4Addr {
    if peer.is_loopback() {
        Ipv4Addr::LOCALHOST
    } else {
        net_ns.default_ip
    }
}
