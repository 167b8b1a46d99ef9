use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use bytes::{Bytes, BytesMut};
use nix::errno::Errno;
use sim_support::emulated_time::EmulatedTime;
use sim_support::syscall_types::ForeignPtr;

use crate::core::worker::Worker;
use crate::host::descriptor::listener::{StateEventSource, StateListenHandle, StateListenerFilter};
use crate::host::descriptor::socket::inet::{self, InetSocket};
use crate::host::descriptor::socket::{RecvmsgArgs, RecvmsgReturn, SendmsgArgs, ShutdownFlags};
use crate::host::descriptor::{FileMode, FileSignals, FileState, FileStatus};
use crate::host::memory_manager::MemoryManager;
use crate::host::network::namespace::{AssociationHandle, NetworkNamespace};
use crate::host::syscall::io::{IoVec, IoVecReader, IoVecWriter};
use crate::host::syscall::types::{SyscallError, SyscallResult};
use crate::network::packet::{PacketRc, PacketStatus};
use crate::utility::callback_queue::CallbackQueue;

/// Maximum size of a datagram we are allowed to send out over the network:
/// 65,535 (2^16 - 1) - 20 (ip header) - 8 (udp header).
const CONFIG_DATAGRAM_MAX_SIZE: usize = 65507;

/// A queued datagram with its source and destination.
struct Message {
    data: Bytes,
    src: SocketAddrV4,
    dst: SocketAddrV4,
}

/// A bounded buffer of whole datagrams.
struct MessageBuffer {
    messages: VecDeque<Message>,
    bytes_used: usize,
    max_bytes: usize,
}

impl MessageBuffer {
    fn new(max_bytes: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            bytes_used: 0,
            max_bytes,
        }
    }

    fn has_space_for(&self, len: usize) -> bool {
        self.bytes_used + len <= self.max_bytes
    }

    fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn push(&mut self, message: Message) {
        self.bytes_used += message.data.len();
        self.messages.push_back(message);
    }

    fn pop(&mut self) -> Option<Message> {
        let message = self.messages.pop_front()?;
        self.bytes_used -= message.data.len();
        Some(message)
    }
}

pub struct UdpSocket {
    event_source: StateEventSource,
    status: FileStatus,
    state: FileState,
    shutdown_status: ShutdownFlags,
    send_buffer: MessageBuffer,
    recv_buffer: MessageBuffer,
    peer_addr: Option<SocketAddrV4>,
    bound_addr: Option<SocketAddrV4>,
    association: Option<AssociationHandle>,
    // should only be used by `OpenFile` to make sure there is only ever one
    // `OpenFile` instance for this file
    has_open_file: bool,
}

impl UdpSocket {
    pub fn new(
        status: FileStatus,
        send_buf_size: usize,
        recv_buf_size: usize,
    ) -> Arc<AtomicRefCell<Self>> {
        let mut socket = Self {
            event_source: StateEventSource::new(),
            status,
            state: FileState::ACTIVE,
            shutdown_status: ShutdownFlags::empty(),
            send_buffer: MessageBuffer::new(send_buf_size),
            recv_buffer: MessageBuffer::new(recv_buf_size),
            peer_addr: None,
            bound_addr: None,
            association: None,
            has_open_file: false,
        };

        CallbackQueue::queue_and_run(|cb_queue| {
            socket.refresh_readable_writable(FileSignals::empty(), cb_queue)
        });

        Arc::new(AtomicRefCell::new(socket))
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn set_status(&mut self, status: FileStatus) {
        self.status = status;
    }

    pub fn mode(&self) -> FileMode {
        FileMode::READ | FileMode::WRITE
    }

    pub fn has_open_file(&self) -> bool {
        self.has_open_file
    }

    pub fn set_has_open_file(&mut self, val: bool) {
        self.has_open_file = val;
    }

    pub fn supports_sa_restart(&self) -> bool {
        true
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn getsockname(&self) -> Result<Option<SocketAddrV4>, SyscallError> {
        Ok(Some(
            self.bound_addr
                .unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
        ))
    }

    pub fn getpeername(&self) -> Result<Option<SocketAddrV4>, SyscallError> {
        Ok(Some(self.peer_addr.ok_or(Errno::ENOTCONN)?))
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError> {
        // drop the association handle to disassociate the socket
        self.association = None;

        self.update_state(
            FileState::all(),
            FileState::CLOSED,
            FileSignals::empty(),
            cb_queue,
        );
        Ok(())
    }

    pub fn bind(
        socket: &Arc<AtomicRefCell<Self>>,
        addr: Option<SocketAddrV4>,
        net_ns: &NetworkNamespace,
        rng: impl rand::Rng,
    ) -> Result<(), SyscallError> {
        let addr = addr.ok_or(Errno::EINVAL)?;

        {
            let socket_ref = socket.borrow();

            // if the socket is already bound
            if socket_ref.bound_addr.is_some() {
                return Err(Errno::EINVAL.into());
            }

            // since we're not bound, we must not have a peer or association
            assert!(socket_ref.peer_addr.is_none());
            assert!(socket_ref.association.is_none());
        }

        // receive packets from any peer
        let unspecified_peer = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

        let (addr, handle) = inet::associate_socket(
            InetSocket::Udp(Arc::clone(socket)),
            addr,
            unspecified_peer,
            net_ns,
            rng,
        )?;

        let mut socket_ref = socket.borrow_mut();
        socket_ref.bound_addr = Some(addr);
        socket_ref.association = Some(handle);

        Ok(())
    }

    /// Bind to an ephemeral port if not bound yet. Used for implicit binds on
    /// `connect` and `sendto`.
    fn implicit_bind(
        socket: &Arc<AtomicRefCell<Self>>,
        peer_ip: Ipv4Addr,
        net_ns: &NetworkNamespace,
        rng: impl rand::Rng,
    ) -> Result<(), SyscallError> {
        if socket.borrow().bound_addr.is_some() {
            return Ok(());
        }

        let local_ip = inet::default_local_ip_for_peer(net_ns, peer_ip);
        let unspecified_peer = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

        let (local_addr, handle) = inet::associate_socket(
            InetSocket::Udp(Arc::clone(socket)),
            SocketAddrV4::new(local_ip, 0),
            unspecified_peer,
            net_ns,
            rng,
        )?;

        let mut socket_ref = socket.borrow_mut();
        socket_ref.bound_addr = Some(local_addr);
        socket_ref.association = Some(handle);

        Ok(())
    }

    pub fn connect(
        socket: &Arc<AtomicRefCell<Self>>,
        addr: SocketAddrV4,
        net_ns: &NetworkNamespace,
        rng: impl rand::Rng,
        _cb_queue: &mut CallbackQueue,
    ) -> Result<(), SyscallError> {
        // connect(2): for SOCK_DGRAM, addr is the default destination and the
        // only address datagrams are received from
        Self::implicit_bind(socket, *addr.ip(), net_ns, rng)?;
        socket.borrow_mut().peer_addr = Some(addr);
        Ok(())
    }

    pub fn sendmsg(
        socket: &Arc<AtomicRefCell<Self>>,
        args: SendmsgArgs,
        mem: &mut MemoryManager,
        net_ns: &NetworkNamespace,
        rng: impl rand::Rng,
        cb_queue: &mut CallbackQueue,
    ) -> Result<libc::ssize_t, SyscallError> {
        let dst_addr = {
            let socket_ref = socket.borrow();

            // if writing has been shut down, return EPIPE
            if socket_ref.shutdown_status.contains(ShutdownFlags::WRITE) {
                return Err(Errno::EPIPE.into());
            }

            match args.addr.or(socket_ref.peer_addr) {
                Some(x) => x,
                None => return Err(Errno::EDESTADDRREQ.into()),
            }
        };

        let len: usize = args.iovs.iter().map(|x| x.len).sum();

        // TODO: use IP fragmentation instead of refusing oversized datagrams
        if len > CONFIG_DATAGRAM_MAX_SIZE {
            return Err(Errno::EMSGSIZE.into());
        }

        Self::implicit_bind(socket, *dst_addr.ip(), net_ns, rng)?;

        let mut socket_ref = socket.borrow_mut();

        if !socket_ref.send_buffer.has_space_for(len) {
            return Err(Errno::EWOULDBLOCK.into());
        }

        // copy the payload out of the process
        let mut reader = IoVecReader::new(args.iovs, mem);
        let mut message = BytesMut::zeroed(len);
        std::io::Read::read_exact(&mut reader, &mut message)
            .map_err(|_| Errno::EFAULT)?;

        let src_addr = socket_ref.bound_addr.unwrap();
        let src_addr = if src_addr.ip().is_unspecified() {
            SocketAddrV4::new(
                inet::default_local_ip_for_peer(net_ns, *dst_addr.ip()),
                src_addr.port(),
            )
        } else {
            src_addr
        };

        socket_ref.send_buffer.push(Message {
            data: message.freeze(),
            src: src_addr,
            dst: dst_addr,
        });

        socket_ref.refresh_readable_writable(FileSignals::empty(), cb_queue);

        // tell the interface there's a datagram ready to go out
        drop(socket_ref);
        Worker::with_active_host(|host| {
            host.notify_socket_has_packets(*src_addr.ip(), &InetSocket::Udp(Arc::clone(socket)));
        })
        .unwrap();

        Ok(len.try_into().unwrap())
    }

    pub fn recvmsg(
        socket: &Arc<AtomicRefCell<Self>>,
        args: RecvmsgArgs,
        mem: &mut MemoryManager,
        cb_queue: &mut CallbackQueue,
    ) -> Result<RecvmsgReturn, SyscallError> {
        let mut socket_ref = socket.borrow_mut();

        let Some(message) = socket_ref.recv_buffer.pop() else {
            if socket_ref.shutdown_status.contains(ShutdownFlags::READ) {
                // reads after shutdown return end-of-stream
                return Ok(RecvmsgReturn {
                    return_val: 0,
                    addr: None,
                });
            }
            return Err(Errno::EWOULDBLOCK.into());
        };

        let len: usize = args.iovs.iter().map(|x| x.len).sum();
        let copy_len = std::cmp::min(len, message.data.len());

        let mut writer = IoVecWriter::new(args.iovs, mem);
        std::io::Write::write_all(&mut writer, &message.data[..copy_len])
            .map_err(|_| Errno::EFAULT)?;

        let truncated = message.data.len() > copy_len;
        if truncated {
            log::trace!("Datagram was truncated from {} to {copy_len} bytes", message.data.len());
        }

        // MSG_TRUNC returns the real datagram size rather than the copied size
        let return_val = if args.flags & libc::MSG_TRUNC != 0 {
            message.data.len()
        } else {
            copy_len
        };

        socket_ref.refresh_readable_writable(FileSignals::empty(), cb_queue);

        Ok(RecvmsgReturn {
            return_val: return_val.try_into().unwrap(),
            addr: Some(message.src),
        })
    }

    pub fn readv(
        &mut self,
        _iovs: &[IoVec],
        _offset: Option<libc::off_t>,
        _flags: libc::c_int,
        _mem: &mut MemoryManager,
        _cb_queue: &mut CallbackQueue,
    ) -> Result<libc::ssize_t, SyscallError> {
        // the read() syscall handler should have called recvmsg() instead
        panic!("Called UdpSocket::readv() on a UDP socket");
    }

    pub fn writev(
        &mut self,
        _iovs: &[IoVec],
        _offset: Option<libc::off_t>,
        _flags: libc::c_int,
        _mem: &mut MemoryManager,
        _cb_queue: &mut CallbackQueue,
    ) -> Result<libc::ssize_t, SyscallError> {
        // the write() syscall handler should have called sendmsg() instead
        panic!("Called UdpSocket::writev() on a UDP socket");
    }

    pub fn shutdown(
        &mut self,
        how: ShutdownFlags,
        cb_queue: &mut CallbackQueue,
    ) -> Result<(), SyscallError> {
        self.shutdown_status.insert(how);
        self.refresh_readable_writable(FileSignals::empty(), cb_queue);
        Ok(())
    }

    pub fn getsockopt(
        &mut self,
        level: libc::c_int,
        optname: libc::c_int,
        optval_ptr: ForeignPtr<()>,
        optlen: libc::socklen_t,
        mem: &mut MemoryManager,
    ) -> Result<libc::socklen_t, SyscallError> {
        match (level, optname) {
            (libc::SOL_SOCKET, libc::SO_ERROR) => {
                if optlen < 4 {
                    return Err(Errno::EINVAL.into());
                }
                mem.write_vals(optval_ptr.cast::<libc::c_int>(), &[0])?;
                Ok(4)
            }
            (libc::SOL_SOCKET, libc::SO_SNDBUF) => {
                let size: libc::c_int = self.send_buffer.max_bytes.try_into().unwrap();
                mem.write_vals(optval_ptr.cast::<libc::c_int>(), &[size])?;
                Ok(4)
            }
            (libc::SOL_SOCKET, libc::SO_RCVBUF) => {
                let size: libc::c_int = self.recv_buffer.max_bytes.try_into().unwrap();
                mem.write_vals(optval_ptr.cast::<libc::c_int>(), &[size])?;
                Ok(4)
            }
            _ => {
                log::warn!("getsockopt level {level} optname {optname} unsupported on UDP sockets");
                Err(Errno::ENOPROTOOPT.into())
            }
        }
    }

    pub fn setsockopt(
        &mut self,
        level: libc::c_int,
        optname: libc::c_int,
        _optval_ptr: ForeignPtr<()>,
        _optlen: libc::socklen_t,
        _mem: &MemoryManager,
    ) -> Result<(), SyscallError> {
        match (level, optname) {
            (libc::SOL_SOCKET, libc::SO_SNDBUF | libc::SO_RCVBUF | libc::SO_REUSEADDR) => {
                // accepted and ignored; buffer sizes come from configuration
                Ok(())
            }
            _ => {
                log::warn!("setsockopt level {level} optname {optname} unsupported on UDP sockets");
                Err(Errno::ENOPROTOOPT.into())
            }
        }
    }

    pub fn ioctl(
        &mut self,
        request: u64,
        arg_ptr: ForeignPtr<()>,
        mem: &mut MemoryManager,
    ) -> SyscallResult {
        match request {
            r if r == libc::FIONREAD as u64 => {
                let len: libc::c_int = self
                    .recv_buffer
                    .messages
                    .front()
                    .map(|x| x.data.len())
                    .unwrap_or(0)
                    .try_into()
                    .unwrap();
                mem.write_vals(arg_ptr.cast::<libc::c_int>(), &[len])?;
                Ok(0.into())
            }
            request => {
                log::warn!("We do not yet handle ioctl request {request} on UDP sockets");
                Err(Errno::EINVAL.into())
            }
        }
    }

    /// A datagram arrived from the network.
    pub fn push_in_packet(
        &mut self,
        packet: PacketRc,
        cb_queue: &mut CallbackQueue,
        _recv_time: EmulatedTime,
    ) {
        if let Some(peer_addr) = self.peer_addr {
            if peer_addr != packet.src_address() {
                // connect(2): a connected datagram socket only receives from
                // its peer
                packet.add_status(PacketStatus::RCV_SOCKET_DROPPED);
                return;
            }
        }

        let payload = packet.payload().concat();

        // a bounded receive buffer; overflow drops the newest datagram
        if !self.recv_buffer.has_space_for(payload.len()) {
            packet.add_status(PacketStatus::RCV_SOCKET_DROPPED);
            return;
        }

        self.recv_buffer.push(Message {
            data: payload,
            src: packet.src_address(),
            dst: packet.dst_address(),
        });

        packet.add_status(PacketStatus::RCV_SOCKET_BUFFERED);
        // datagrams are delivered whole; buffered means readable
        packet.add_status(PacketStatus::RCV_SOCKET_DELIVERED);

        self.refresh_readable_writable(FileSignals::READ_BUFFER_GREW, cb_queue);
    }

    /// The interface wants the next outbound datagram.
    pub fn pull_out_packet(&mut self, cb_queue: &mut CallbackQueue) -> Option<PacketRc> {
        let message = self.send_buffer.pop()?;

        let priority = Worker::with_active_host(|host| host.get_next_packet_priority()).unwrap();
        let packet = PacketRc::new_udp(message.src, message.dst, message.data, priority);
        packet.add_status(PacketStatus::SND_SOCKET_BUFFERED);

        self.refresh_readable_writable(FileSignals::empty(), cb_queue);

        Some(packet)
    }

    pub fn has_data_to_send(&self) -> bool {
        !self.send_buffer.is_empty()
    }

    pub fn add_listener(
        &mut self,
        monitoring_state: FileState,
        monitoring_signals: FileSignals,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, FileSignals, &mut CallbackQueue)
            + Send
            + Sync
            + 'static,
    ) -> StateListenHandle {
        self.event_source
            .add_listener(monitoring_state, monitoring_signals, filter, notify_fn)
    }

    fn refresh_readable_writable(&mut self, signals: FileSignals, cb_queue: &mut CallbackQueue) {
        if self.state.contains(FileState::CLOSED) {
            return;
        }

        let mut new_state = FileState::empty();

        new_state.set(
            FileState::READABLE,
            !self.recv_buffer.is_empty() || self.shutdown_status.contains(ShutdownFlags::READ),
        );
        new_state.set(
            FileState::WRITABLE,
            self.send_buffer.has_space_for(1)
                && !self.shutdown_status.contains(ShutdownFlags::WRITE),
        );

        self.update_state(
            FileState::READABLE | FileState::WRITABLE,
            new_state,
            signals,
            cb_queue,
        );
    }

    fn update_state(
        &mut self,
        mask: FileState,
        state: FileState,
        signals: FileSignals,
        cb_queue: &mut CallbackQueue,
    ) {
        let old_state = self.state;

        self.state.remove(mask);
        self.state.insert(state & mask);

        let states_changed = self.state ^ old_state;
        if states_changed.is_empty() && signals.is_empty() {
            return;
        }

        self.event_source
            .notify_listeners(self.state, states_changed, signals, cb_queue);
    }
}
