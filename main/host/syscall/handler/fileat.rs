use std::path::PathBuf;

use nix::errno::Errno;
use sim_support::syscall_types::{ForeignPtr, SysCallArgs};

use crate::host::context::SyscallContext;
use crate::host::descriptor::File;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{SyscallError, SyscallResult};

impl SyscallHandler {
    /// Resolve a directory fd argument to the base path relative paths are
    /// interpreted against: `AT_FDCWD` means the process's working
    /// directory, otherwise the directory descriptor's absolute opened path.
    pub(super) fn resolve_dirfd(ctx: &SyscallContext, dirfd: i32) -> Result<PathBuf, Errno> {
        if dirfd == libc::AT_FDCWD {
            return Ok(ctx.process.cwd().clone());
        }

        let descriptor = Self::get_descriptor(ctx, dirfd)?;
        match descriptor.file() {
            File::RegularFile(regular) => Ok(regular.borrow().abs_path().clone()),
            _ => Err(Errno::ENOTDIR),
        }
    }

    pub fn openat(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let dirfd: i32 = args.get(0).into();
        let path_ptr: ForeignPtr<u8> = args.get(1).into();
        let flags: i32 = args.get(2).into();
        let mode: u32 = args.get(3).into();

        let base = Self::resolve_dirfd(ctx, dirfd)?;
        let path = Self::read_path(ctx, path_ptr, &base)?;
        Self::open_helper(ctx, path, flags, mode)
    }

    pub fn newfstatat(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let dirfd: i32 = args.get(0).into();
        let path_ptr: ForeignPtr<u8> = args.get(1).into();
        let stat_ptr: ForeignPtr<libc::stat> = args.get(2).into();
        let flags: i32 = args.get(3).into();

        let stat = if flags & libc::AT_EMPTY_PATH != 0 {
            let file = Self::get_descriptor(ctx, dirfd)?.file().clone();
            Self::stat_for_file(&file)?
        } else {
            let base = Self::resolve_dirfd(ctx, dirfd)?;
            let path = Self::read_path(ctx, path_ptr, &base)?;

            if flags & libc::AT_SYMLINK_NOFOLLOW != 0 {
                nix::sys::stat::lstat(&path).map_err(SyscallError::from)?
            } else {
                nix::sys::stat::stat(&path).map_err(SyscallError::from)?
            }
        };

        ctx.process.memory.write_vals(stat_ptr, &[stat])?;
        Ok(0.into())
    }

    pub fn faccessat(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let dirfd: i32 = args.get(0).into();
        let path_ptr: ForeignPtr<u8> = args.get(1).into();
        let _mode: i32 = args.get(2).into();

        let base = Self::resolve_dirfd(ctx, dirfd)?;
        let path = Self::read_path(ctx, path_ptr, &base)?;

        // everything the simulator can see, the process can access
        match std::fs::metadata(&path) {
            Ok(_) => Ok(0.into()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn renameat(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let old_dirfd: i32 = args.get(0).into();
        let old_ptr: ForeignPtr<u8> = args.get(1).into();
        let new_dirfd: i32 = args.get(2).into();
        let new_ptr: ForeignPtr<u8> = args.get(3).into();

        let old_base = Self::resolve_dirfd(ctx, old_dirfd)?;
        let new_base = Self::resolve_dirfd(ctx, new_dirfd)?;
        let old = Self::read_path(ctx, old_ptr, &old_base)?;
        let new = Self::read_path(ctx, new_ptr, &new_base)?;

        std::fs::rename(old, new).map_err(SyscallError::from)?;
        Ok(0.into())
    }
}
