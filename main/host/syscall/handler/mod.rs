use nix::errno::Errno;
use sim_support::syscall_types::SysCallArgs;

use crate::host::context::SyscallContext;
use crate::host::descriptor::Descriptor;
use crate::host::syscall::types::{SyscallError, SyscallResult};

mod epoll;
mod eventfd;
mod fcntl;
mod file;
mod fileat;
mod ioctl;
mod mman;
mod poll;
mod random;
mod socket;
mod time;
mod timerfd;
mod uio;
mod unistd;

/// Routes intercepted syscalls to their emulated implementations. Handlers
/// must not block the worker thread; all waiting is expressed by returning
/// [`SyscallError::Blocked`].
pub struct SyscallHandler {}

impl SyscallHandler {
    pub fn syscall(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        match args.number {
            libc::SYS_accept => Self::accept(ctx, args),
            libc::SYS_accept4 => Self::accept4(ctx, args),
            libc::SYS_bind => Self::bind(ctx, args),
            libc::SYS_brk => Err(SyscallError::Native),
            libc::SYS_clock_gettime => Self::clock_gettime(ctx, args),
            libc::SYS_clock_nanosleep => Self::clock_nanosleep(ctx, args),
            libc::SYS_close => Self::close(ctx, args),
            libc::SYS_connect => Self::connect(ctx, args),
            libc::SYS_creat => Self::creat(ctx, args),
            libc::SYS_dup => Self::dup(ctx, args),
            libc::SYS_dup2 => Self::dup2(ctx, args),
            libc::SYS_dup3 => Self::dup3(ctx, args),
            libc::SYS_epoll_create => Self::epoll_create(ctx, args),
            libc::SYS_epoll_create1 => Self::epoll_create1(ctx, args),
            libc::SYS_epoll_ctl => Self::epoll_ctl(ctx, args),
            libc::SYS_epoll_pwait => Self::epoll_pwait(ctx, args),
            libc::SYS_epoll_wait => Self::epoll_wait(ctx, args),
            libc::SYS_eventfd => Self::eventfd(ctx, args),
            libc::SYS_eventfd2 => Self::eventfd2(ctx, args),
            libc::SYS_faccessat => Self::faccessat(ctx, args),
            libc::SYS_fcntl => Self::fcntl(ctx, args),
            libc::SYS_fdatasync => Self::fdatasync(ctx, args),
            libc::SYS_fgetxattr => Self::fgetxattr(ctx, args),
            libc::SYS_flistxattr => Self::flistxattr(ctx, args),
            libc::SYS_fremovexattr => Self::fremovexattr(ctx, args),
            libc::SYS_fsetxattr => Self::fsetxattr(ctx, args),
            libc::SYS_fstat => Self::fstat(ctx, args),
            libc::SYS_fstatfs => Self::fstatfs(ctx, args),
            libc::SYS_fsync => Self::fsync(ctx, args),
            libc::SYS_ftruncate => Self::ftruncate(ctx, args),
            libc::SYS_getdents64 => Self::getdents64(ctx, args),
            libc::SYS_getpeername => Self::getpeername(ctx, args),
            libc::SYS_getpid => Ok((ctx.process.id().0 as i64).into()),
            libc::SYS_getrandom => Self::getrandom(ctx, args),
            libc::SYS_getsockname => Self::getsockname(ctx, args),
            libc::SYS_getsockopt => Self::getsockopt(ctx, args),
            libc::SYS_gettimeofday => Self::gettimeofday(ctx, args),
            libc::SYS_ioctl => Self::ioctl(ctx, args),
            libc::SYS_link => Self::link(ctx, args),
            libc::SYS_listen => Self::listen(ctx, args),
            libc::SYS_lseek => Self::lseek(ctx, args),
            libc::SYS_madvise => Err(SyscallError::Native),
            libc::SYS_mkdir => Self::mkdir(ctx, args),
            libc::SYS_mmap => Self::mmap(ctx, args),
            libc::SYS_mprotect => Err(SyscallError::Native),
            libc::SYS_mremap => Err(SyscallError::Native),
            libc::SYS_munmap => Err(SyscallError::Native),
            libc::SYS_nanosleep => Self::nanosleep(ctx, args),
            libc::SYS_newfstatat => Self::newfstatat(ctx, args),
            libc::SYS_open => Self::open(ctx, args),
            libc::SYS_openat => Self::openat(ctx, args),
            libc::SYS_pipe => Self::pipe(ctx, args),
            libc::SYS_pipe2 => Self::pipe2(ctx, args),
            libc::SYS_poll => Self::poll(ctx, args),
            libc::SYS_ppoll => Self::ppoll(ctx, args),
            libc::SYS_pread64 => Self::pread64(ctx, args),
            libc::SYS_preadv => Self::preadv(ctx, args),
            libc::SYS_pwrite64 => Self::pwrite64(ctx, args),
            libc::SYS_pwritev => Self::pwritev(ctx, args),
            libc::SYS_read => Self::read(ctx, args),
            libc::SYS_readv => Self::readv(ctx, args),
            libc::SYS_recvfrom => Self::recvfrom(ctx, args),
            libc::SYS_recvmsg => Self::recvmsg(ctx, args),
            libc::SYS_rename => Self::rename(ctx, args),
            libc::SYS_renameat => Self::renameat(ctx, args),
            libc::SYS_rmdir => Self::rmdir(ctx, args),
            libc::SYS_sched_yield => Err(SyscallError::Native),
            libc::SYS_sendmsg => Self::sendmsg(ctx, args),
            libc::SYS_sendto => Self::sendto(ctx, args),
            libc::SYS_setsockopt => Self::setsockopt(ctx, args),
            libc::SYS_shutdown => Self::shutdown(ctx, args),
            libc::SYS_socket => Self::socket(ctx, args),
            libc::SYS_socketpair => {
                // only unix-domain socketpairs exist, and unix sockets are
                // outside the simulated stack
                Err(Errno::EOPNOTSUPP.into())
            }
            libc::SYS_statx => Self::statx(ctx, args),
            libc::SYS_time => Self::time(ctx, args),
            libc::SYS_timerfd_create => Self::timerfd_create(ctx, args),
            libc::SYS_timerfd_gettime => Self::timerfd_gettime(ctx, args),
            libc::SYS_timerfd_settime => Self::timerfd_settime(ctx, args),
            libc::SYS_unlink => Self::unlink(ctx, args),
            libc::SYS_write => Self::write(ctx, args),
            libc::SYS_writev => Self::writev(ctx, args),
            number => {
                log::warn!("Returning ENOSYS for unsupported syscall {number}");
                Err(Errno::ENOSYS.into())
            }
        }
    }

    /// The descriptor for `fd`, or `EBADF`.
    fn get_descriptor<'a>(
        ctx: &'a SyscallContext,
        fd: impl TryInto<u32>,
    ) -> Result<&'a Descriptor, Errno> {
        // check that fd is within bounds
        let fd: u32 = fd.try_into().map_err(|_| Errno::EBADF)?;

        match ctx.process.descriptor_table.get(fd) {
            Some(descriptor) => Ok(descriptor),
            None => Err(Errno::EBADF),
        }
    }
}
