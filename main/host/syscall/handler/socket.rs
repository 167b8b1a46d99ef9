use std::net::{Ipv4Addr, SocketAddrV4};

use nix::errno::Errno;
use sim_support::syscall_types::{ForeignPtr, SysCallArgs};

use crate::host::context::SyscallContext;
use crate::host::descriptor::socket::inet::{InetSocket, TcpSocket, UdpSocket};
use crate::host::descriptor::socket::{RecvmsgArgs, SendmsgArgs, ShutdownFlags, Socket};
use crate::host::descriptor::{
    Descriptor, DescriptorFlags, File, FileState, FileStatus, OpenFile,
};
use crate::host::memory_manager::MemoryManager;
use crate::host::syscall::handler::unistd::rand_fork;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::io::IoVec;
use crate::host::syscall::types::{Failed, SyscallError, SyscallResult};
use crate::utility::callback_queue::CallbackQueue;

const SOCKADDR_IN_LEN: libc::socklen_t = 16;

/// Read a `sockaddr_in` argument from the process. A null pointer yields
/// `None`.
fn read_sockaddr(
    mem: &MemoryManager,
    ptr: ForeignPtr<u8>,
    len: libc::socklen_t,
) -> Result<Option<SocketAddrV4>, Errno> {
    if ptr.is_null() {
        return Ok(None);
    }

    if len < SOCKADDR_IN_LEN {
        return Err(Errno::EINVAL);
    }

    let mut bytes = [0u8; SOCKADDR_IN_LEN as usize];
    mem.read_bytes(ptr, &mut bytes)?;

    let family = u16::from_ne_bytes([bytes[0], bytes[1]]);
    if family != libc::AF_INET as u16 {
        return Err(Errno::EAFNOSUPPORT);
    }

    let port = u16::from_be_bytes([bytes[2], bytes[3]]);
    let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);

    Ok(Some(SocketAddrV4::new(ip, port)))
}

/// Write a `sockaddr_in` result and its length back to the process, honoring
/// the caller-provided buffer length.
fn write_sockaddr(
    mem: &mut MemoryManager,
    addr: SocketAddrV4,
    addr_ptr: ForeignPtr<u8>,
    len_ptr: ForeignPtr<libc::socklen_t>,
) -> Result<(), Errno> {
    if addr_ptr.is_null() || len_ptr.is_null() {
        return Ok(());
    }

    let given_len = mem.read_val(len_ptr)?;

    let mut bytes = [0u8; SOCKADDR_IN_LEN as usize];
    bytes[0..2].copy_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
    bytes[2..4].copy_from_slice(&addr.port().to_be_bytes());
    bytes[4..8].copy_from_slice(&addr.ip().octets());

    let copy_len = std::cmp::min(given_len, SOCKADDR_IN_LEN) as usize;
    mem.write_bytes(addr_ptr, &bytes[..copy_len])?;
    mem.write_vals(len_ptr, &[SOCKADDR_IN_LEN])?;

    Ok(())
}

impl SyscallHandler {
    fn get_socket(ctx: &SyscallContext, fd: i32) -> Result<Socket, SyscallError> {
        match Self::get_descriptor(ctx, fd)?.file() {
            File::Socket(socket) => Ok(socket.clone()),
            _ => Err(Errno::ENOTSOCK.into()),
        }
    }

    pub fn socket(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let domain: i32 = args.get(0).into();
        let raw_type: i32 = args.get(1).into();
        let _protocol: i32 = args.get(2).into();

        if domain != libc::AF_INET {
            return Err(Errno::EAFNOSUPPORT.into());
        }

        let sock_type = raw_type & 0xf;

        let mut file_status = FileStatus::empty();
        if raw_type & libc::SOCK_NONBLOCK != 0 {
            file_status.insert(FileStatus::NONBLOCK);
        }

        let params = ctx.host.params();
        let socket = match sock_type {
            libc::SOCK_STREAM => {
                InetSocket::Tcp(TcpSocket::new(file_status, params.tcp_config))
            }
            libc::SOCK_DGRAM => InetSocket::Udp(UdpSocket::new(
                file_status,
                params.send_buf_size,
                params.recv_buf_size,
            )),
            _ => return Err(Errno::ESOCKTNOSUPPORT.into()),
        };

        let mut descriptor =
            Descriptor::new(OpenFile::new(File::Socket(Socket::Inet(socket))));
        if raw_type & libc::SOCK_CLOEXEC != 0 {
            descriptor.set_flags(DescriptorFlags::FD_CLOEXEC);
        }

        let fd = ctx.process.descriptor_table.add(descriptor, 0);
        Ok((fd as i64).into())
    }

    pub fn bind(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let addr_ptr: ForeignPtr<u8> = args.get(1).into();
        let addr_len: libc::socklen_t = u32::from(args.get(2)) as libc::socklen_t;

        let socket = Self::get_socket(ctx, fd)?;
        let addr = read_sockaddr(&ctx.process.memory, addr_ptr, addr_len)?;

        let rng = ctx.host.with_random_mut(rand_fork);
        socket.bind(addr, ctx.host.net_ns(), rng)?;

        Ok(0.into())
    }

    pub fn listen(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let backlog: i32 = args.get(1).into();

        let socket = Self::get_socket(ctx, fd)?;

        let rng = ctx.host.with_random_mut(rand_fork);
        CallbackQueue::queue_and_run(|cb_queue| {
            socket.listen(backlog, ctx.host.net_ns(), rng, cb_queue)
        })?;

        Ok(0.into())
    }

    pub fn connect(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let addr_ptr: ForeignPtr<u8> = args.get(1).into();
        let addr_len: libc::socklen_t = u32::from(args.get(2)) as libc::socklen_t;

        let socket = Self::get_socket(ctx, fd)?;
        let addr =
            read_sockaddr(&ctx.process.memory, addr_ptr, addr_len)?.ok_or(Errno::EFAULT)?;

        let rng = ctx.host.with_random_mut(rand_fork);
        let result = CallbackQueue::queue_and_run(|cb_queue| {
            socket.connect(addr, ctx.host.net_ns(), rng, cb_queue)
        });

        let file = Self::get_descriptor(ctx, fd)?.file().clone();
        let nonblock = file.borrow().status().contains(FileStatus::NONBLOCK);

        match result {
            Ok(()) => {
                let state = file.borrow().state();

                if state.contains(FileState::WRITABLE) {
                    // connected (or a UDP default destination was set)
                    return Ok(0.into());
                }

                // a TCP handshake is in flight
                if nonblock {
                    return Err(Errno::EINPROGRESS.into());
                }

                Err(SyscallError::new_blocked_on_file(
                    file,
                    FileState::WRITABLE | FileState::ERROR,
                    /* restartable= */ false,
                ))
            }
            Err(SyscallError::Failed(Failed {
                errno: Errno::EALREADY,
                ..
            })) if !nonblock => {
                // a spurious wakeup while the handshake is still in flight
                Err(SyscallError::new_blocked_on_file(
                    file,
                    FileState::WRITABLE | FileState::ERROR,
                    /* restartable= */ false,
                ))
            }
            Err(e) => Err(e),
        }
    }

    pub fn accept(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        Self::accept_helper(ctx, args, 0)
    }

    pub fn accept4(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let flags: i32 = args.get(3).into();
        Self::accept_helper(ctx, args, flags)
    }

    fn accept_helper(ctx: &mut SyscallContext, args: &SysCallArgs, flags: i32) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let addr_ptr: ForeignPtr<u8> = args.get(1).into();
        let len_ptr: ForeignPtr<libc::socklen_t> = args.get(2).into();

        let socket = Self::get_socket(ctx, fd)?;

        let result = CallbackQueue::queue_and_run(|cb_queue| {
            socket.borrow_mut().accept(ctx.host.net_ns(), cb_queue)
        });

        let open_file = match result {
            Ok(open_file) => open_file,
            Err(e) => {
                let file = File::Socket(socket);
                return Err(Self::maybe_block(
                    &file,
                    FileState::READABLE | FileState::SOCKET_ALLOWING_CONNECT,
                    e,
                ));
            }
        };

        // apply accept4 flags to the new socket
        if flags & libc::SOCK_NONBLOCK != 0 {
            let mut file = open_file.inner_file().borrow_mut();
            let status = file.status() | FileStatus::NONBLOCK;
            file.set_status(status);
        }

        // report the peer's address if requested
        if let File::Socket(new_socket) = open_file.inner_file() {
            if let Ok(Some(peer)) = new_socket.borrow().getpeername() {
                write_sockaddr(&mut ctx.process.memory, peer, addr_ptr, len_ptr)?;
            }
        }

        let mut descriptor = Descriptor::new(open_file);
        if flags & libc::SOCK_CLOEXEC != 0 {
            descriptor.set_flags(DescriptorFlags::FD_CLOEXEC);
        }

        let new_fd = ctx.process.descriptor_table.add(descriptor, 0);
        Ok((new_fd as i64).into())
    }

    pub fn shutdown(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let how: i32 = args.get(1).into();

        let how = match how {
            libc::SHUT_RD => ShutdownFlags::READ,
            libc::SHUT_WR => ShutdownFlags::WRITE,
            libc::SHUT_RDWR => ShutdownFlags::READ | ShutdownFlags::WRITE,
            _ => return Err(Errno::EINVAL.into()),
        };

        let socket = Self::get_socket(ctx, fd)?;

        CallbackQueue::queue_and_run(|cb_queue| socket.borrow_mut().shutdown(how, cb_queue))?;
        Ok(0.into())
    }

    pub fn getsockname(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let addr_ptr: ForeignPtr<u8> = args.get(1).into();
        let len_ptr: ForeignPtr<libc::socklen_t> = args.get(2).into();

        let socket = Self::get_socket(ctx, fd)?;
        let addr = socket
            .borrow()
            .getsockname()?
            .unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

        write_sockaddr(&mut ctx.process.memory, addr, addr_ptr, len_ptr)?;
        Ok(0.into())
    }

    pub fn getpeername(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let addr_ptr: ForeignPtr<u8> = args.get(1).into();
        let len_ptr: ForeignPtr<libc::socklen_t> = args.get(2).into();

        let socket = Self::get_socket(ctx, fd)?;
        let addr = socket.borrow().getpeername()?.ok_or(Errno::ENOTCONN)?;

        write_sockaddr(&mut ctx.process.memory, addr, addr_ptr, len_ptr)?;
        Ok(0.into())
    }

    pub fn sendto(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let buf_ptr: ForeignPtr<u8> = args.get(1).into();
        let len: usize = args.get(2).into();
        let flags: i32 = args.get(3).into();
        let addr_ptr: ForeignPtr<u8> = args.get(4).into();
        let addr_len: libc::socklen_t = u32::from(args.get(5)) as libc::socklen_t;

        let socket = Self::get_socket(ctx, fd)?;
        let addr = read_sockaddr(&ctx.process.memory, addr_ptr, addr_len)?;

        let iovs = [IoVec {
            base: buf_ptr,
            len,
        }];

        let send_args = SendmsgArgs {
            addr,
            iovs: &iovs,
            flags,
        };

        let rng = ctx.host.with_random_mut(rand_fork);
        let result = CallbackQueue::queue_and_run(|cb_queue| {
            socket.sendmsg(send_args, &mut ctx.process.memory, ctx.host.net_ns(), rng, cb_queue)
        });

        match result {
            Ok(n) => Ok(n.into()),
            Err(e) => {
                let file = File::Socket(socket);
                Err(Self::maybe_block(&file, FileState::WRITABLE, e))
            }
        }
    }

    pub fn recvfrom(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let buf_ptr: ForeignPtr<u8> = args.get(1).into();
        let len: usize = args.get(2).into();
        let flags: i32 = args.get(3).into();
        let addr_ptr: ForeignPtr<u8> = args.get(4).into();
        let len_ptr: ForeignPtr<libc::socklen_t> = args.get(5).into();

        let socket = Self::get_socket(ctx, fd)?;

        let iovs = [IoVec {
            base: buf_ptr,
            len,
        }];

        let recv_args = RecvmsgArgs {
            iovs: &iovs,
            flags,
        };

        let result = CallbackQueue::queue_and_run(|cb_queue| {
            socket.recvmsg(recv_args, &mut ctx.process.memory, cb_queue)
        });

        match result {
            Ok(recv) => {
                if let Some(addr) = recv.addr {
                    write_sockaddr(&mut ctx.process.memory, addr, addr_ptr, len_ptr)?;
                }
                Ok(recv.return_val.into())
            }
            Err(e) => {
                let file = File::Socket(socket);
                Err(Self::maybe_block(&file, FileState::READABLE, e))
            }
        }
    }

    pub fn sendmsg(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let msg_ptr: ForeignPtr<libc::msghdr> = args.get(1).into();
        let flags: i32 = args.get(2).into();

        let socket = Self::get_socket(ctx, fd)?;
        let msg = ctx.process.memory.read_val(msg_ptr)?;

        let addr = read_sockaddr(
            &ctx.process.memory,
            ForeignPtr::from_raw(msg.msg_name as usize),
            msg.msg_namelen,
        )?;
        let iovs = crate::host::syscall::io::read_iovecs(
            &ctx.process.memory,
            ForeignPtr::from_raw(msg.msg_iov as usize),
            msg.msg_iovlen,
        )?;

        let send_args = SendmsgArgs {
            addr,
            iovs: &iovs,
            flags,
        };

        let rng = ctx.host.with_random_mut(rand_fork);
        let result = CallbackQueue::queue_and_run(|cb_queue| {
            socket.sendmsg(send_args, &mut ctx.process.memory, ctx.host.net_ns(), rng, cb_queue)
        });

        match result {
            Ok(n) => Ok(n.into()),
            Err(e) => {
                let file = File::Socket(socket);
                Err(Self::maybe_block(&file, FileState::WRITABLE, e))
            }
        }
    }

    pub fn recvmsg(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let msg_ptr: ForeignPtr<libc::msghdr> = args.get(1).into();
        let flags: i32 = args.get(2).into();

        let socket = Self::get_socket(ctx, fd)?;
        let msg = ctx.process.memory.read_val(msg_ptr)?;

        let iovs = crate::host::syscall::io::read_iovecs(
            &ctx.process.memory,
            ForeignPtr::from_raw(msg.msg_iov as usize),
            msg.msg_iovlen,
        )?;

        let recv_args = RecvmsgArgs {
            iovs: &iovs,
            flags,
        };

        let result = CallbackQueue::queue_and_run(|cb_queue| {
            socket.recvmsg(recv_args, &mut ctx.process.memory, cb_queue)
        });

        match result {
            Ok(recv) => {
                // report the source address if the caller provided a buffer
                if let Some(addr) = recv.addr {
                    if !msg.msg_name.is_null() && msg.msg_namelen >= SOCKADDR_IN_LEN {
                        let mut bytes = [0u8; SOCKADDR_IN_LEN as usize];
                        bytes[0..2].copy_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
                        bytes[2..4].copy_from_slice(&addr.port().to_be_bytes());
                        bytes[4..8].copy_from_slice(&addr.ip().octets());
                        ctx.process
                            .memory
                            .write_bytes(ForeignPtr::from_raw(msg.msg_name as usize), &bytes)?;
                    }
                }
                Ok(recv.return_val.into())
            }
            Err(e) => {
                let file = File::Socket(socket);
                Err(Self::maybe_block(&file, FileState::READABLE, e))
            }
        }
    }

    pub fn getsockopt(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let level: i32 = args.get(1).into();
        let optname: i32 = args.get(2).into();
        let optval_ptr: ForeignPtr<()> = args.get(3).into();
        let optlen_ptr: ForeignPtr<libc::socklen_t> = args.get(4).into();

        let socket = Self::get_socket(ctx, fd)?;
        let optlen = ctx.process.memory.read_val(optlen_ptr)?;

        let used = socket.borrow_mut().getsockopt(
            level,
            optname,
            optval_ptr,
            optlen,
            &mut ctx.process.memory,
        )?;

        ctx.process.memory.write_vals(optlen_ptr, &[used])?;
        Ok(0.into())
    }

    pub fn setsockopt(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let level: i32 = args.get(1).into();
        let optname: i32 = args.get(2).into();
        let optval_ptr: ForeignPtr<()> = args.get(3).into();
        let optlen: libc::socklen_t = u32::from(args.get(4)) as libc::socklen_t;

        let socket = Self::get_socket(ctx, fd)?;

        socket
            .borrow_mut()
            .setsockopt(level, optname, optval_ptr, optlen, &ctx.process.memory)?;

        Ok(0.into())
    }
}
