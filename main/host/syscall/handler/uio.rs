use nix::errno::Errno;
use sim_support::syscall_types::SysCallArgs;

use crate::host::context::SyscallContext;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::io::read_iovecs;
use crate::host::syscall::types::SyscallResult;

impl SyscallHandler {
    pub fn readv(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let iov_ptr = args.get(1).into();
        let iov_count: i32 = args.get(2).into();

        let count: usize = iov_count.try_into().map_err(|_| Errno::EINVAL)?;
        let iovs = read_iovecs(&ctx.process.memory, iov_ptr, count)?;

        Self::read_helper(ctx, fd, &iovs, None)
    }

    pub fn preadv(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let iov_ptr = args.get(1).into();
        let iov_count: i32 = args.get(2).into();
        let offset: i64 = args.get(3).into();

        let count: usize = iov_count.try_into().map_err(|_| Errno::EINVAL)?;
        let iovs = read_iovecs(&ctx.process.memory, iov_ptr, count)?;

        Self::read_helper(ctx, fd, &iovs, Some(offset))
    }

    pub fn writev(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let iov_ptr = args.get(1).into();
        let iov_count: i32 = args.get(2).into();

        let count: usize = iov_count.try_into().map_err(|_| Errno::EINVAL)?;
        let iovs = read_iovecs(&ctx.process.memory, iov_ptr, count)?;

        Self::write_helper(ctx, fd, &iovs, None)
    }

    pub fn pwritev(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let iov_ptr = args.get(1).into();
        let iov_count: i32 = args.get(2).into();
        let offset: i64 = args.get(3).into();

        let count: usize = iov_count.try_into().map_err(|_| Errno::EINVAL)?;
        let iovs = read_iovecs(&ctx.process.memory, iov_ptr, count)?;

        Self::write_helper(ctx, fd, &iovs, Some(offset))
    }
}
