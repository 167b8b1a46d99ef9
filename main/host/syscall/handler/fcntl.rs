use nix::errno::Errno;
use sim_support::syscall_types::SysCallArgs;

use crate::host::context::SyscallContext;
use crate::host::descriptor::{DescriptorFlags, FileStatus};
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::SyscallResult;

impl SyscallHandler {
    pub fn fcntl(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let cmd: i32 = args.get(1).into();

        match cmd {
            libc::F_GETFL => {
                let descriptor = Self::get_descriptor(ctx, fd)?;
                let status = descriptor.file().borrow().status();
                Ok((status.as_o_flags() as i64).into())
            }
            libc::F_SETFL => {
                let flags: i32 = args.get(2).into();
                let (mut status, _remaining) = FileStatus::from_o_flags(flags);
                // fcntl(2): access mode and creation flags are ignored; only
                // the status flags can change
                status.remove(FileStatus::CLOEXEC);

                let descriptor = Self::get_descriptor(ctx, fd)?;
                let mut file = descriptor.file().borrow_mut();
                let preserved = file.status() & FileStatus::CLOEXEC;
                file.set_status(status | preserved);
                Ok(0.into())
            }
            libc::F_GETFD => {
                let descriptor = Self::get_descriptor(ctx, fd)?;
                let flags = if descriptor.flags().contains(DescriptorFlags::FD_CLOEXEC) {
                    libc::FD_CLOEXEC
                } else {
                    0
                };
                Ok((flags as i64).into())
            }
            libc::F_SETFD => {
                let flags: i32 = args.get(2).into();

                let fd: u32 = fd.try_into().map_err(|_| Errno::EBADF)?;
                let descriptor = ctx
                    .process
                    .descriptor_table
                    .get_mut(fd)
                    .ok_or(Errno::EBADF)?;

                let mut descriptor_flags = DescriptorFlags::empty();
                descriptor_flags.set(DescriptorFlags::FD_CLOEXEC, flags & libc::FD_CLOEXEC != 0);
                descriptor.set_flags(descriptor_flags);
                Ok(0.into())
            }
            libc::F_DUPFD | libc::F_DUPFD_CLOEXEC => {
                let min_fd: i32 = args.get(2).into();
                let min_fd: u32 = min_fd.try_into().map_err(|_| Errno::EINVAL)?;

                let flags = if cmd == libc::F_DUPFD_CLOEXEC {
                    DescriptorFlags::FD_CLOEXEC
                } else {
                    DescriptorFlags::empty()
                };

                let descriptor = Self::get_descriptor(ctx, fd)?;
                let new_descriptor = descriptor.dup(flags);
                let new_fd = ctx.process.descriptor_table.add(new_descriptor, min_fd);
                Ok((new_fd as i64).into())
            }
            cmd => {
                log::warn!("We do not yet handle fcntl command {cmd}");
                Err(Errno::EINVAL.into())
            }
        }
    }
}
