use nix::errno::Errno;
use sim_support::syscall_types::SysCallArgs;

use crate::host::context::SyscallContext;
use crate::host::descriptor::File;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{SyscallError, SyscallResult};

impl SyscallHandler {
    /// `mmap` of a regular file maps the simulator-opened backing file;
    /// anonymous mappings go to the process natively. The application and
    /// the simulator share one address space in this driver, so the mapping
    /// is directly usable either way.
    pub fn mmap(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let addr: u64 = args.get(0).into();
        let length: usize = args.get(1).into();
        let prot: i32 = args.get(2).into();
        let flags: i32 = args.get(3).into();
        let fd: i32 = args.get(4).into();
        let offset: i64 = args.get(5).into();

        if flags & libc::MAP_ANONYMOUS != 0 {
            // no file involved; the process can make this mapping itself
            return Err(SyscallError::Native);
        }

        if length == 0 {
            return Err(Errno::EINVAL.into());
        }

        let file = Self::get_descriptor(ctx, fd)?.file().clone();

        let File::RegularFile(regular) = &file else {
            return Err(Errno::EACCES.into());
        };

        let os_fd = regular.borrow().os_fd();

        // SAFETY: maps the simulator's own open file into the simulator's
        // address space, which the managed process shares
        let rv = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                length,
                prot,
                flags,
                os_fd,
                offset,
            )
        };

        if rv == libc::MAP_FAILED {
            return Err(Errno::last().into());
        }

        Ok((rv as usize).into())
    }
}
