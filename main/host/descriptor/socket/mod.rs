use std::net::SocketAddrV4;

use sim_support::emulated_time::EmulatedTime;
use sim_support::syscall_types::ForeignPtr;

use crate::host::descriptor::listener::{StateListenHandle, StateListenerFilter};
use crate::host::descriptor::socket::inet::{InetSocket, InetSocketRef, InetSocketRefMut};
use crate::host::descriptor::{FileMode, FileSignals, FileState, FileStatus, OpenFile};
use crate::host::memory_manager::MemoryManager;
use crate::host::network::namespace::NetworkNamespace;
use crate::host::syscall::io::IoVec;
use crate::host::syscall::types::{SyscallError, SyscallResult};
use crate::network::packet::PacketRc;
use crate::utility::callback_queue::CallbackQueue;

pub mod inet;

bitflags::bitflags! {
    /// Which directions of a socket have been shut down.
    #[derive(Default, Copy, Clone, Debug)]
    pub struct ShutdownFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Arguments for a `sendmsg`-family syscall, already read out of the
/// process's memory.
pub struct SendmsgArgs<'a> {
    /// The destination address, if one was provided.
    pub addr: Option<SocketAddrV4>,
    pub iovs: &'a [IoVec],
    pub flags: libc::c_int,
}

/// Arguments for a `recvmsg`-family syscall.
pub struct RecvmsgArgs<'a> {
    pub iovs: &'a [IoVec],
    pub flags: libc::c_int,
}

/// The result of a `recvmsg`-family syscall.
pub struct RecvmsgReturn {
    pub return_val: libc::ssize_t,
    /// The source address of the received message, if known.
    pub addr: Option<SocketAddrV4>,
}

/// A wrapper for any socket family. Only inet sockets exist in the
/// simulation, but the family split keeps the dispatch structure in one
/// place.
#[derive(Clone, Debug)]
pub enum Socket {
    Inet(InetSocket),
}

impl Socket {
    pub fn borrow(&self) -> SocketRef {
        match self {
            Self::Inet(x) => SocketRef::Inet(x.borrow()),
        }
    }

    pub fn borrow_mut(&self) -> SocketRefMut {
        match self {
            Self::Inet(x) => SocketRefMut::Inet(x.borrow_mut()),
        }
    }

    pub fn canonical_handle(&self) -> usize {
        match self {
            Self::Inet(x) => x.canonical_handle(),
        }
    }

    pub fn bind(
        &self,
        addr: Option<SocketAddrV4>,
        net_ns: &NetworkNamespace,
        rng: impl rand::Rng,
    ) -> Result<(), SyscallError> {
        match self {
            Self::Inet(socket) => socket.bind(addr, net_ns, rng),
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
            Self::Inet(socket) => socket.listen(backlog, net_ns, rng, cb_queue),
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
            Self::Inet(socket) => socket.connect(addr, net_ns, rng, cb_queue),
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
            Self::Inet(socket) => socket.sendmsg(args, mem, net_ns, rng, cb_queue),
        }
    }

    pub fn recvmsg(
        &self,
        args: RecvmsgArgs,
        mem: &mut MemoryManager,
        cb_queue: &mut CallbackQueue,
    ) -> Result<RecvmsgReturn, SyscallError> {
        match self {
            Self::Inet(socket) => socket.recvmsg(args, mem, cb_queue),
        }
    }
}

pub enum SocketRef<'a> {
    Inet(InetSocketRef<'a>),
}

pub enum SocketRefMut<'a> {
    Inet(InetSocketRefMut<'a>),
}

impl SocketRef<'_> {
    enum_passthrough!(self, (), Inet;
        pub fn state(&self) -> FileState
    );
    enum_passthrough!(self, (), Inet;
        pub fn mode(&self) -> FileMode
    );
    enum_passthrough!(self, (), Inet;
        pub fn status(&self) -> FileStatus
    );
    enum_passthrough!(self, (), Inet;
        pub fn has_open_file(&self) -> bool
    );
    enum_passthrough!(self, (), Inet;
        pub fn supports_sa_restart(&self) -> bool
    );
    enum_passthrough!(self, (), Inet;
        pub fn getsockname(&self) -> Result<Option<SocketAddrV4>, SyscallError>
    );
    enum_passthrough!(self, (), Inet;
        pub fn getpeername(&self) -> Result<Option<SocketAddrV4>, SyscallError>
    );
}

impl SocketRefMut<'_> {
    enum_passthrough!(self, (), Inet;
        pub fn state(&self) -> FileState
    );
    enum_passthrough!(self, (), Inet;
        pub fn mode(&self) -> FileMode
    );
    enum_passthrough!(self, (), Inet;
        pub fn status(&self) -> FileStatus
    );
    enum_passthrough!(self, (), Inet;
        pub fn has_open_file(&self) -> bool
    );
    enum_passthrough!(self, (), Inet;
        pub fn supports_sa_restart(&self) -> bool
    );
    enum_passthrough!(self, (val), Inet;
        pub fn set_has_open_file(&mut self, val: bool)
    );
    enum_passthrough!(self, (status), Inet;
        pub fn set_status(&mut self, status: FileStatus)
    );
    enum_passthrough!(self, (cb_queue), Inet;
        pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError>
    );
    enum_passthrough!(self, (request, arg_ptr, memory_manager), Inet;
        pub fn ioctl(&mut self, request: u64, arg_ptr: ForeignPtr<()>, memory_manager: &mut MemoryManager) -> SyscallResult
    );
    enum_passthrough!(self, (monitoring_state, monitoring_signals, filter, notify_fn), Inet;
        pub fn add_listener(
            &mut self,
            monitoring_state: FileState,
            monitoring_signals: FileSignals,
            filter: StateListenerFilter,
            notify_fn: impl Fn(FileState, FileState, FileSignals, &mut CallbackQueue) + Send + Sync + 'static,
        ) -> StateListenHandle
    );
    enum_passthrough!(self, (iovs, offset, flags, mem, cb_queue), Inet;
        pub fn readv(&mut self, iovs: &[IoVec], offset: Option<libc::off_t>, flags: libc::c_int,
                     mem: &mut MemoryManager, cb_queue: &mut CallbackQueue) -> Result<libc::ssize_t, SyscallError>
    );
    enum_passthrough!(self, (iovs, offset, flags, mem, cb_queue), Inet;
        pub fn writev(&mut self, iovs: &[IoVec], offset: Option<libc::off_t>, flags: libc::c_int,
                      mem: &mut MemoryManager, cb_queue: &mut CallbackQueue) -> Result<libc::ssize_t, SyscallError>
    );
    enum_passthrough!(self, (), Inet;
        pub fn getsockname(&self) -> Result<Option<SocketAddrV4>, SyscallError>
    );
    enum_passthrough!(self, (), Inet;
        pub fn getpeername(&self) -> Result<Option<SocketAddrV4>, SyscallError>
    );
    enum_passthrough!(self, (how, cb_queue), Inet;
        pub fn shutdown(&mut self, how: ShutdownFlags, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError>
    );
    enum_passthrough!(self, (level, optname, optval_ptr, optlen, mem), Inet;
        pub fn getsockopt(&mut self, level: libc::c_int, optname: libc::c_int, optval_ptr: ForeignPtr<()>,
                          optlen: libc::socklen_t, mem: &mut MemoryManager)
        -> Result<libc::socklen_t, SyscallError>
    );
    enum_passthrough!(self, (level, optname, optval_ptr, optlen, mem), Inet;
        pub fn setsockopt(&mut self, level: libc::c_int, optname: libc::c_int, optval_ptr: ForeignPtr<()>,
                          optlen: libc::socklen_t, mem: &MemoryManager)
        -> Result<(), SyscallError>
    );
    enum_passthrough!(self, (packet, cb_queue, recv_time), Inet;
        pub fn push_in_packet(&mut self, packet: PacketRc, cb_queue: &mut CallbackQueue, recv_time: EmulatedTime)
    );
    enum_passthrough!(self, (cb_queue), Inet;
        pub fn pull_out_packet(&mut self, cb_queue: &mut CallbackQueue) -> Option<PacketRc>
    );
    enum_passthrough!(self, (), Inet;
        pub fn has_data_to_send(&self) -> bool
    );

    pub fn accept(
        &mut self,
        net_ns: &NetworkNamespace,
        cb_queue: &mut CallbackQueue,
    ) -> Result<OpenFile, SyscallError> {
        match self {
            Self::Inet(socket) => socket.accept(net_ns, cb_queue),
        }
    }
}
