use sim_support::syscall_types::{ForeignPtr, SysCallArgs};

use crate::host::context::SyscallContext;
use crate::host::descriptor::FileStatus;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::SyscallResult;

impl SyscallHandler {
    pub fn ioctl(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let request: u64 = args.get(1).into();
        let arg_ptr: ForeignPtr<()> = args.get(2).into();

        let file = Self::get_descriptor(ctx, fd)?.file().clone();

        // FIONBIO toggles O_NONBLOCK and applies to every file type
        if request == libc::FIONBIO as u64 {
            let enabled = ctx
                .process
                .memory
                .read_val(arg_ptr.cast::<libc::c_int>())?;

            let mut file_ref = file.borrow_mut();
            let mut status = file_ref.status();
            status.set(FileStatus::NONBLOCK, enabled != 0);
            file_ref.set_status(status);

            return Ok(0.into());
        }

        let result = file
            .borrow_mut()
            .ioctl(request, arg_ptr, &mut ctx.process.memory);
        result
    }
}
