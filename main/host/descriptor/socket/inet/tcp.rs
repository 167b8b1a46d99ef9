use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, Weak};

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;
use sim_support::emulated_time::EmulatedTime;
use sim_support::simulation_time::SimulationTime;
use sim_support::syscall_types::ForeignPtr;

use crate::core::work::event::EventKind;
use crate::core::work::task::TaskRef;
use crate::core::worker::Worker;
use crate::host::descriptor::listener::{StateEventSource, StateListenHandle, StateListenerFilter};
use crate::host::descriptor::socket::inet::{self, InetSocket};
use crate::host::descriptor::socket::{
    RecvmsgArgs, RecvmsgReturn, SendmsgArgs, ShutdownFlags, Socket,
};
use crate::host::descriptor::{File, FileMode, FileSignals, FileState, FileStatus, OpenFile};
use crate::host::memory_manager::MemoryManager;
use crate::host::network::namespace::{AssociationHandle, NetworkNamespace};
use crate::host::syscall::io::{IoVec, IoVecReader, IoVecWriter};
use crate::host::syscall::types::{SyscallError, SyscallResult};
use crate::network::packet::{PacketRc, PacketStatus};
use crate::utility::callback_queue::CallbackQueue;

/// The clock and timer bridge between the sans-I/O TCP state and the
/// simulation. Timers become scheduled host tasks that call back into the
/// owning socket.
pub struct TcpDeps {
    /// The socket the TCP state belongs to. Timer callbacks run against this
    /// socket's state; for a child connection still owned by a listening
    /// socket, this is the listener.
    socket: Weak<AtomicRefCell<TcpSocket>>,
    registered_by: tcp::TimerRegisteredBy,
}

impl std::fmt::Debug for TcpDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpDeps")
            .field("registered_by", &self.registered_by)
            .finish_non_exhaustive()
    }
}

impl tcp::Dependencies for TcpDeps {
    type Instant = EmulatedTime;
    type Duration = SimulationTime;

    fn register_timer(
        &self,
        time: Self::Instant,
        f: impl FnOnce(&mut tcp::TcpState<Self>, tcp::TimerRegisteredBy) + Send + Sync + 'static,
    ) {
        let weak = Weak::clone(&self.socket);
        let registered_by = self.registered_by;

        // a TaskRef callback is `Fn`, so move the `FnOnce` through a mutex
        type TimerFn = Box<
            dyn FnOnce(&mut tcp::TcpState<TcpDeps>, tcp::TimerRegisteredBy) + Send + Sync,
        >;
        let f: Mutex<Option<TimerFn>> = Mutex::new(Some(Box::new(f)));

        let task = TaskRef::new(move |_host| {
            let Some(socket) = weak.upgrade() else {
                return;
            };
            let Some(f) = f.lock().unwrap().take() else {
                return;
            };

            CallbackQueue::queue_and_run(|cb_queue| {
                let mut socket_ref = socket.borrow_mut();
                f(&mut socket_ref.tcp_state, registered_by);
                socket_ref.after_tcp_activity(cb_queue);
            });
        });

        Worker::with_active_host(|host| {
            host.schedule_task_at(task, time, EventKind::TcpRetransmitTimer);
        })
        .unwrap();
    }

    fn current_time(&self) -> Self::Instant {
        Worker::current_time().unwrap()
    }

    fn fork(&self) -> Self {
        // child connections are owned by the listening socket until accepted,
        // so their timers keep routing to the listener
        Self {
            socket: Weak::clone(&self.socket),
            registered_by: tcp::TimerRegisteredBy::Child,
        }
    }
}

pub struct TcpSocket {
    tcp_state: tcp::TcpState<TcpDeps>,
    /// A weak handle to ourselves, for spawning timers and accepted children.
    weak_self: Weak<AtomicRefCell<TcpSocket>>,
    event_source: StateEventSource,
    status: FileStatus,
    file_state: FileState,
    bound_addr: Option<SocketAddrV4>,
    association: Option<AssociationHandle>,
    /// True between a `connect()` that blocked and its completion, so a
    /// repeated `connect()` call can report the result.
    connecting: bool,
    shutdown_status: ShutdownFlags,
    // should only be used by `OpenFile` to make sure there is only ever one
    // `OpenFile` instance for this file
    has_open_file: bool,
}

impl TcpSocket {
    pub fn new(status: FileStatus, config: tcp::TcpConfig) -> Arc<AtomicRefCell<Self>> {
        Arc::new_cyclic(|weak: &Weak<AtomicRefCell<TcpSocket>>| {
            let deps = TcpDeps {
                socket: Weak::clone(weak),
                registered_by: tcp::TimerRegisteredBy::Parent,
            };

            AtomicRefCell::new(Self {
                tcp_state: tcp::TcpState::new(deps, config),
                weak_self: Weak::clone(weak),
                event_source: StateEventSource::new(),
                status,
                file_state: FileState::ACTIVE,
                bound_addr: None,
                association: None,
                connecting: false,
                shutdown_status: ShutdownFlags::empty(),
                has_open_file: false,
            })
        })
    }

    /// Wrap an accept()ed child state in a new socket object.
    fn new_accepted(
        status: FileStatus,
        accepted: tcp::AcceptedTcpState<TcpDeps>,
    ) -> Arc<AtomicRefCell<Self>> {
        Arc::new_cyclic(|weak: &Weak<AtomicRefCell<TcpSocket>>| {
            let local_addr = accepted.local_addr();

            // re-point the child's timers at the new socket object
            let weak_clone = Weak::clone(weak);
            let tcp_state = accepted.finalize(move |deps| {
                *deps = TcpDeps {
                    socket: weak_clone,
                    registered_by: tcp::TimerRegisteredBy::Parent,
                };
            });

            AtomicRefCell::new(Self {
                tcp_state,
                weak_self: Weak::clone(weak),
                event_source: StateEventSource::new(),
                status,
                file_state: FileState::ACTIVE,
                bound_addr: Some(local_addr),
                association: None,
                connecting: false,
                shutdown_status: ShutdownFlags::empty(),
                has_open_file: false,
            })
        })
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
        self.file_state
    }

    pub fn getsockname(&self) -> Result<Option<SocketAddrV4>, SyscallError> {
        if let Some((local, _)) = self.tcp_state.local_remote_addrs() {
            return Ok(Some(local));
        }
        Ok(Some(
            self.bound_addr
                .unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
        ))
    }

    pub fn getpeername(&self) -> Result<Option<SocketAddrV4>, SyscallError> {
        if !self.tcp_state.poll().contains(tcp::PollState::CONNECTED) {
            return Err(Errno::ENOTCONN.into());
        }
        let (_, remote) = self.tcp_state.local_remote_addrs().ok_or(Errno::ENOTCONN)?;
        Ok(Some(remote))
    }

    /// Sync our file state from the TCP state, notify listeners, and queue
    /// any sendable segments at the interface. Must be called after every
    /// operation that may have changed the TCP state.
    fn after_tcp_activity(&mut self, cb_queue: &mut CallbackQueue) {
        if self.file_state.contains(FileState::CLOSED) {
            // the descriptor is gone; keep draining segments until the state
            // machine finishes, then drop the association
            if self.tcp_state.poll().contains(tcp::PollState::CLOSED) {
                self.association = None;
            }
            self.notify_interface_if_sendable(cb_queue);
            return;
        }

        let poll = self.tcp_state.poll();
        let mut new_state = FileState::empty();

        // spec'd readable semantics: ordered payload available, or a
        // half-close was observed
        new_state.set(
            FileState::READABLE,
            poll.contains(tcp::PollState::READABLE)
                || poll.contains(tcp::PollState::RECV_CLOSED),
        );
        new_state.set(
            FileState::WRITABLE,
            poll.contains(tcp::PollState::WRITABLE)
                // a completed connect is reported through writability
                || (self.connecting && poll.contains(tcp::PollState::CONNECTED)),
        );
        new_state.set(FileState::ERROR, poll.contains(tcp::PollState::ERROR));
        new_state.set(FileState::HUP, poll.contains(tcp::PollState::RECV_CLOSED));
        new_state.set(
            FileState::SOCKET_ALLOWING_CONNECT,
            poll.contains(tcp::PollState::READY_TO_ACCEPT),
        );

        self.update_state(
            FileState::READABLE
                | FileState::WRITABLE
                | FileState::ERROR
                | FileState::HUP
                | FileState::SOCKET_ALLOWING_CONNECT,
            new_state,
            FileSignals::empty(),
            cb_queue,
        );

        self.notify_interface_if_sendable(cb_queue);
    }

    /// Queue a deferred notification to the interface that this socket has
    /// segments to send. Deferred through the callback queue since the caller
    /// still holds a borrow of this socket, and the interface will borrow it
    /// again to pull packets.
    fn notify_interface_if_sendable(&self, cb_queue: &mut CallbackQueue) {
        if !self.tcp_state.wants_to_send() {
            return;
        }

        let Some(strong_self) = self.weak_self.upgrade() else {
            return;
        };

        let local_ip = match self.tcp_state.local_remote_addrs() {
            Some((local, _)) => *local.ip(),
            None => match self.bound_addr {
                Some(addr) => *addr.ip(),
                None => return,
            },
        };

        cb_queue.add(move |_cb_queue| {
            Worker::with_active_host(|host| {
                let socket = InetSocket::Tcp(strong_self);

                if local_ip.is_unspecified() {
                    // a listener bound to every interface sends from each
                    host.notify_socket_has_packets(Ipv4Addr::LOCALHOST, &socket);
                    host.notify_socket_has_packets(host.default_ip(), &socket);
                } else {
                    host.notify_socket_has_packets(local_ip, &socket);
                }
            })
            .unwrap();
        });
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError> {
        // tell the state machine; FIN handshakes and TIME_WAIT continue in
        // the background while the interface association keeps us alive
        let _ = self.tcp_state.close();

        if self.tcp_state.poll().contains(tcp::PollState::CLOSED) {
            self.association = None;
        }

        self.update_state(
            FileState::all(),
            FileState::CLOSED,
            FileSignals::empty(),
            cb_queue,
        );

        self.notify_interface_if_sendable(cb_queue);

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
            if socket_ref.bound_addr.is_some() {
                return Err(Errno::EINVAL.into());
            }
        }

        let unspecified_peer = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        let (addr, handle) = inet::associate_socket(
            InetSocket::Tcp(Arc::clone(socket)),
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

    pub fn listen(
        socket: &Arc<AtomicRefCell<Self>>,
        backlog: i32,
        net_ns: &NetworkNamespace,
        rng: impl rand::Rng,
        cb_queue: &mut CallbackQueue,
    ) -> Result<(), SyscallError> {
        // listen(2) treats negative backlogs as 0
        let backlog: u32 = backlog.try_into().unwrap_or(0);

        let mut socket_ref = socket.borrow_mut();
        let already_bound = socket_ref.bound_addr.is_some();

        let rv = socket_ref.tcp_state.listen(backlog, || {
            if already_bound {
                // bind() already associated us
                return Ok(None);
            }

            // listen without bind: associate with an ephemeral port on every
            // interface
            let local = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
            let unspecified_peer = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
            inet::associate_socket(
                InetSocket::Tcp(Arc::clone(socket)),
                local,
                unspecified_peer,
                net_ns,
                rng,
            )
            .map(Some)
        });

        match rv {
            Ok(Some((addr, handle))) => {
                socket_ref.bound_addr = Some(addr);
                socket_ref.association = Some(handle);
            }
            Ok(None) => {}
            Err(tcp::ListenError::FailedAssociation(e)) => return Err(e),
            Err(tcp::ListenError::InvalidState) => return Err(Errno::EINVAL.into()),
        }

        socket_ref.after_tcp_activity(cb_queue);

        Ok(())
    }

    pub fn connect(
        socket: &Arc<AtomicRefCell<Self>>,
        addr: SocketAddrV4,
        net_ns: &NetworkNamespace,
        rng: impl rand::Rng,
        cb_queue: &mut CallbackQueue,
    ) -> Result<(), SyscallError> {
        let mut socket_ref = socket.borrow_mut();

        // a repeated call while a previous connect is in flight (or finished)
        // reports the outcome
        let poll = socket_ref.tcp_state.poll();
        if socket_ref.connecting {
            if poll.contains(tcp::PollState::ERROR) {
                socket_ref.connecting = false;
                let _ = socket_ref.tcp_state.clear_error();
                return Err(Errno::ECONNREFUSED.into());
            }
            if poll.contains(tcp::PollState::CONNECTED) {
                socket_ref.connecting = false;
                return Ok(());
            }
            return Err(Errno::EALREADY.into());
        }

        let bound_addr = socket_ref.bound_addr;
        let rv = socket_ref.tcp_state.connect(addr, || {
            if let Some(local) = bound_addr {
                // bound but possibly to a wildcard ip; pin it for this peer
                let local = if local.ip().is_unspecified() {
                    SocketAddrV4::new(inet::default_local_ip_for_peer(net_ns, *addr.ip()), local.port())
                } else {
                    local
                };
                return Ok((local, None));
            }

            // implicit bind to an ephemeral port
            let local_ip = inet::default_local_ip_for_peer(net_ns, *addr.ip());
            let unspecified_peer = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
            inet::associate_socket(
                InetSocket::Tcp(Arc::clone(socket)),
                SocketAddrV4::new(local_ip, 0),
                unspecified_peer,
                net_ns,
                rng,
            )
            .map(|(local, handle)| (local, Some(handle)))
        });

        match rv {
            Ok(maybe_handle) => {
                if let Some((local, _)) = socket_ref.tcp_state.local_remote_addrs() {
                    socket_ref.bound_addr = Some(local);
                }
                if let Some(handle) = maybe_handle {
                    socket_ref.association = Some(handle);
                }
            }
            Err(tcp::ConnectError::FailedAssociation(e)) => return Err(e),
            Err(tcp::ConnectError::InProgress) => return Err(Errno::EALREADY.into()),
            Err(tcp::ConnectError::AlreadyConnected) => return Err(Errno::EISCONN.into()),
            Err(tcp::ConnectError::IsListening | tcp::ConnectError::InvalidState) => {
                return Err(Errno::EINVAL.into())
            }
        }

        socket_ref.connecting = true;
        socket_ref.after_tcp_activity(cb_queue);

        // the caller decides whether to block (based on O_NONBLOCK) by
        // checking our state; the handshake proceeds via scheduled events
        Ok(())
    }

    pub fn accept(
        &mut self,
        net_ns: &NetworkNamespace,
        cb_queue: &mut CallbackQueue,
    ) -> Result<OpenFile, SyscallError> {
        let accepted = match self.tcp_state.accept() {
            Ok(x) => x,
            Err(tcp::AcceptError::NothingToAccept) => return Err(Errno::EWOULDBLOCK.into()),
            Err(tcp::AcceptError::InvalidState) => return Err(Errno::EINVAL.into()),
        };

        let local_addr = accepted.local_addr();
        let remote_addr = accepted.remote_addr();

        let child = Self::new_accepted(self.status, accepted);

        // the child gets its own specific association so further segments
        // flow directly to it instead of the listener
        let handle = net_ns.associate(
            &InetSocket::Tcp(Arc::clone(&child)),
            crate::network::packet::Protocol::Tcp,
            local_addr,
            remote_addr,
        );
        child.borrow_mut().association = Some(handle);

        self.after_tcp_activity(cb_queue);
        child.borrow_mut().after_tcp_activity(cb_queue);

        Ok(OpenFile::new(File::Socket(Socket::Inet(InetSocket::Tcp(
            child,
        )))))
    }

    pub fn sendmsg(
        socket: &Arc<AtomicRefCell<Self>>,
        args: SendmsgArgs,
        mem: &mut MemoryManager,
        cb_queue: &mut CallbackQueue,
    ) -> Result<libc::ssize_t, SyscallError> {
        let mut socket_ref = socket.borrow_mut();

        if socket_ref.shutdown_status.contains(ShutdownFlags::WRITE) {
            return Err(Errno::EPIPE.into());
        }

        let poll = socket_ref.tcp_state.poll();
        if poll.contains(tcp::PollState::CONNECTING) {
            return Err(Errno::EWOULDBLOCK.into());
        }
        if !poll.contains(tcp::PollState::CONNECTED) {
            return Err(Errno::ENOTCONN.into());
        }

        let len: usize = args.iovs.iter().map(|x| x.len).sum();
        let reader = IoVecReader::new(args.iovs, mem);

        let rv = match socket_ref.tcp_state.send(reader, len) {
            Ok(n) => Ok(n.try_into().unwrap()),
            Err(tcp::SendError::Full) => Err(Errno::EWOULDBLOCK.into()),
            Err(tcp::SendError::NotConnected) => Err(Errno::ENOTCONN.into()),
            Err(tcp::SendError::StreamClosed) => Err(Errno::EPIPE.into()),
            Err(tcp::SendError::InvalidState) => Err(Errno::EINVAL.into()),
            Err(tcp::SendError::Io(e)) => Err(e.into()),
        };

        socket_ref.after_tcp_activity(cb_queue);

        rv
    }

    pub fn recvmsg(
        socket: &Arc<AtomicRefCell<Self>>,
        args: RecvmsgArgs,
        mem: &mut MemoryManager,
        cb_queue: &mut CallbackQueue,
    ) -> Result<RecvmsgReturn, SyscallError> {
        let mut socket_ref = socket.borrow_mut();

        let poll = socket_ref.tcp_state.poll();
        if poll.contains(tcp::PollState::CONNECTING) {
            return Err(Errno::EWOULDBLOCK.into());
        }

        let len: usize = args.iovs.iter().map(|x| x.len).sum();
        let writer = IoVecWriter::new(args.iovs, mem);

        let rv = match socket_ref.tcp_state.recv(writer, len) {
            Ok(n) => Ok(RecvmsgReturn {
                return_val: n.try_into().unwrap(),
                addr: socket_ref.tcp_state.local_remote_addrs().map(|(_, remote)| remote),
            }),
            // a half-closed stream returns end-of-file
            Err(tcp::RecvError::StreamClosed) => Ok(RecvmsgReturn {
                return_val: 0,
                addr: None,
            }),
            Err(tcp::RecvError::Empty) => Err(Errno::EWOULDBLOCK.into()),
            Err(tcp::RecvError::NotConnected) => Err(Errno::ENOTCONN.into()),
            Err(tcp::RecvError::InvalidState) => Err(Errno::ENOTCONN.into()),
            Err(tcp::RecvError::Io(e)) => Err(e.into()),
        };

        socket_ref.after_tcp_activity(cb_queue);

        rv
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
        panic!("Called TcpSocket::readv() on a TCP socket");
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
        panic!("Called TcpSocket::writev() on a TCP socket");
    }

    pub fn shutdown(
        &mut self,
        how: ShutdownFlags,
        cb_queue: &mut CallbackQueue,
    ) -> Result<(), SyscallError> {
        self.shutdown_status.insert(how);

        let tcp_how = if how.contains(ShutdownFlags::READ | ShutdownFlags::WRITE) {
            tcp::Shutdown::Both
        } else if how.contains(ShutdownFlags::WRITE) {
            tcp::Shutdown::Write
        } else {
            tcp::Shutdown::Read
        };

        let rv = match self.tcp_state.shutdown(tcp_how) {
            Ok(()) => Ok(()),
            Err(tcp::ShutdownError::NotConnected) => Err(Errno::ENOTCONN.into()),
            Err(tcp::ShutdownError::InvalidState) => Err(Errno::ENOTCONN.into()),
        };

        self.after_tcp_activity(cb_queue);

        rv
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

                let error: libc::c_int = match self.tcp_state.clear_error() {
                    Some(tcp::TcpError::ResetSent | tcp::TcpError::ResetReceived) => {
                        if self.connecting {
                            self.connecting = false;
                            libc::ECONNREFUSED
                        } else {
                            libc::ECONNRESET
                        }
                    }
                    Some(tcp::TcpError::TimedOut) => libc::ETIMEDOUT,
                    Some(tcp::TcpError::ClosedWhileConnecting) => libc::ECONNABORTED,
                    None => 0,
                };

                mem.write_vals(optval_ptr.cast::<libc::c_int>(), &[error])?;
                Ok(4)
            }
            _ => {
                log::warn!("getsockopt level {level} optname {optname} unsupported on TCP sockets");
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
            (libc::SOL_SOCKET, libc::SO_SNDBUF | libc::SO_RCVBUF | libc::SO_REUSEADDR)
            | (libc::IPPROTO_TCP, libc::TCP_NODELAY) => {
                // accepted and ignored; the stack is configured globally
                Ok(())
            }
            _ => {
                log::warn!("setsockopt level {level} optname {optname} unsupported on TCP sockets");
                Err(Errno::ENOPROTOOPT.into())
            }
        }
    }

    pub fn ioctl(
        &mut self,
        request: u64,
        _arg_ptr: ForeignPtr<()>,
        _mem: &mut MemoryManager,
    ) -> SyscallResult {
        log::warn!("We do not yet handle ioctl request {request} on TCP sockets");
        Err(Errno::EINVAL.into())
    }

    /// A segment arrived from the network.
    pub fn push_in_packet(
        &mut self,
        packet: PacketRc,
        cb_queue: &mut CallbackQueue,
        _recv_time: EmulatedTime,
    ) {
        let Some(header) = packet.tcp_header() else {
            debug_panic!("A non-TCP packet was routed to a TCP socket");
            return;
        };

        let payload = packet.payload().clone();

        match self.tcp_state.push_packet(header, payload) {
            Ok(added) => {
                packet.add_status(PacketStatus::RCV_SOCKET_BUFFERED);
                if added > 0 {
                    // payload became readable in order
                    packet.add_status(PacketStatus::RCV_SOCKET_DELIVERED);
                }
            }
            Err(_) => packet.add_status(PacketStatus::RCV_SOCKET_DROPPED),
        }

        self.after_tcp_activity(cb_queue);
    }

    /// The interface wants the next outbound segment.
    pub fn pull_out_packet(&mut self, cb_queue: &mut CallbackQueue) -> Option<PacketRc> {
        let rv = self.tcp_state.pop_packet();

        self.after_tcp_activity(cb_queue);

        match rv {
            Ok((header, payload)) => {
                let priority =
                    Worker::with_active_host(|host| host.get_next_packet_priority()).unwrap();
                let packet = PacketRc::new_tcp(header, payload, priority);
                packet.add_status(PacketStatus::SND_SOCKET_BUFFERED);
                Some(packet)
            }
            Err(_) => None,
        }
    }

    pub fn has_data_to_send(&self) -> bool {
        self.tcp_state.wants_to_send()
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

    fn update_state(
        &mut self,
        mask: FileState,
        state: FileState,
        signals: FileSignals,
        cb_queue: &mut CallbackQueue,
    ) {
        let old_state = self.file_state;

        self.file_state.remove(mask);
        self.file_state.insert(state & mask);

        let states_changed = self.file_state ^ old_state;
        if states_changed.is_empty() && signals.is_empty() {
            return;
        }

        self.event_source
            .notify_listeners(self.file_state, states_changed, signals, cb_queue);
    }
}
