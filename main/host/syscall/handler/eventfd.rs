use nix::errno::Errno;
use sim_support::syscall_types::SysCallArgs;

use crate::host::context::SyscallContext;
use crate::host::descriptor::eventfd::EventFd;
use crate::host::descriptor::{Descriptor, DescriptorFlags, File, FileStatus, OpenFile};
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::SyscallResult;

impl SyscallHandler {
    pub fn eventfd(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        Self::eventfd_helper(ctx, args.get(0).into(), 0)
    }

    pub fn eventfd2(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        Self::eventfd_helper(ctx, args.get(0).into(), args.get(1).into())
    }

    fn eventfd_helper(ctx: &mut SyscallContext, init_value: u32, flags: i32) -> SyscallResult {
        let known =
            libc::EFD_NONBLOCK | libc::EFD_CLOEXEC | libc::EFD_SEMAPHORE;
        if flags & !known != 0 {
            log::debug!("Invalid eventfd flags: {flags:#o}");
            return Err(Errno::EINVAL.into());
        }

        let mut file_status = FileStatus::empty();
        if flags & libc::EFD_NONBLOCK != 0 {
            file_status.insert(FileStatus::NONBLOCK);
        }

        let is_semaphore_mode = flags & libc::EFD_SEMAPHORE != 0;

        let file = EventFd::new(init_value.into(), is_semaphore_mode, file_status);
        let mut descriptor = Descriptor::new(OpenFile::new(File::EventFd(file)));

        if flags & libc::EFD_CLOEXEC != 0 {
            descriptor.set_flags(DescriptorFlags::FD_CLOEXEC);
        }

        let fd = ctx.process.descriptor_table.add(descriptor, 0);
        Ok((fd as i64).into())
    }
}
