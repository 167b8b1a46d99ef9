use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use rand::RngCore;
use sim_support::syscall_types::{ForeignPtr, SysCallArgs};

use crate::core::worker::Worker;
use crate::host::context::SyscallContext;
use crate::host::descriptor::regular_file::RegularFile;
use crate::host::descriptor::{
    Descriptor, DescriptorFlags, File, FileMode, FileStatus, OpenFile,
};
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{SyscallError, SyscallResult};
use crate::host::Host;

const PATH_MAX: usize = 4096;

/// What a managed-process path resolves to after the special-path policy is
/// applied.
enum OpenTarget {
    /// Open this real path.
    Path(PathBuf),
    /// Open an in-memory file with these contents.
    InMemory(Vec<u8>),
}

/// Rewrite the paths the simulator virtualizes before they reach the real
/// filesystem.
fn resolve_special_path(host: &Host, path: &Path) -> Option<OpenTarget> {
    let path_str = path.to_str()?;

    match path_str {
        "/etc/hosts" => {
            let hosts = Worker::with_shared(|shared| shared.hosts_file_path.clone())?;
            Some(OpenTarget::Path(hosts))
        }
        // the simulation runs in UTC regardless of the real machine
        "/etc/localtime" => Some(OpenTarget::Path(PathBuf::from(
            "/usr/share/zoneinfo/Etc/UTC",
        ))),
        // deterministic "device" randomness from the host RNG
        "/dev/random" | "/dev/urandom" => {
            let mut bytes = vec![0u8; 65536];
            host.with_random_mut(|rng| rng.fill_bytes(&mut bytes));
            Some(OpenTarget::InMemory(bytes))
        }
        "/sys/devices/system/cpu/possible" | "/sys/devices/system/cpu/online" => {
            Some(OpenTarget::InMemory(b"0\n".to_vec()))
        }
        "/proc/sys/kernel/random/uuid" => {
            let mut bytes = [0u8; 16];
            host.with_random_mut(|rng| rng.fill_bytes(&mut bytes));
            let uuid = format!(
                "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}\n",
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15]
            );
            Some(OpenTarget::InMemory(uuid.into_bytes()))
        }
        _ => {
            // /proc/self belongs to the simulator process, which hosts the
            // managed process in this driver
            if let Some(rest) = path_str.strip_prefix("/proc/self/") {
                let native_pid = std::process::id();
                return Some(OpenTarget::Path(PathBuf::from(format!(
                    "/proc/{native_pid}/{rest}"
                ))));
            }
            None
        }
    }
}

impl SyscallHandler {
    /// Read a path argument and make it absolute against `base` (the process
    /// CWD or a directory descriptor's opened path).
    pub(super) fn read_path(
        ctx: &SyscallContext,
        path_ptr: ForeignPtr<u8>,
        base: &Path,
    ) -> Result<PathBuf, Errno> {
        let path = ctx.process.memory.read_cstring(path_ptr, PATH_MAX)?;
        let path = PathBuf::from(path);

        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(base.join(path))
        }
    }

    pub(super) fn open_helper(
        ctx: &mut SyscallContext,
        abs_path: PathBuf,
        flags: i32,
        _mode: u32,
    ) -> SyscallResult {
        let target = resolve_special_path(ctx.host, &abs_path)
            .unwrap_or(OpenTarget::Path(abs_path.clone()));

        let file_mode = match flags & libc::O_ACCMODE {
            libc::O_RDONLY => FileMode::READ,
            libc::O_WRONLY => FileMode::WRITE,
            libc::O_RDWR => FileMode::READ | FileMode::WRITE,
            _ => return Err(Errno::EINVAL.into()),
        };

        let (file_status, _remaining) = FileStatus::from_o_flags(flags);

        let os_file = match target {
            OpenTarget::Path(path) => {
                let mut options = std::fs::OpenOptions::new();
                options
                    .read(file_mode.contains(FileMode::READ))
                    .write(file_mode.contains(FileMode::WRITE))
                    .append(flags & libc::O_APPEND != 0)
                    .create(flags & libc::O_CREAT != 0)
                    .create_new(flags & libc::O_EXCL != 0 && flags & libc::O_CREAT != 0)
                    .truncate(flags & libc::O_TRUNC != 0 && file_mode.contains(FileMode::WRITE));

                // O_DIRECTORY and reads of directories need read access only
                if flags & libc::O_DIRECTORY != 0 {
                    options.read(true);
                    options.write(false);
                }

                match options.open(&path) {
                    Ok(file) => file,
                    Err(e) => return Err(e.into()),
                }
            }
            OpenTarget::InMemory(contents) => {
                let mut file = tempfile::tempfile().map_err(SyscallError::from)?;
                file.write_all(&contents).map_err(SyscallError::from)?;
                file.seek(std::io::SeekFrom::Start(0))
                    .map_err(SyscallError::from)?;
                file
            }
        };

        let file = RegularFile::new(os_file, abs_path, file_mode, file_status);
        let mut descriptor = Descriptor::new(OpenFile::new(File::RegularFile(file)));

        if flags & libc::O_CLOEXEC != 0 {
            descriptor.set_flags(DescriptorFlags::FD_CLOEXEC);
        }

        let fd = ctx.process.descriptor_table.add(descriptor, 0);
        Ok((fd as i64).into())
    }

    pub fn open(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let path_ptr: ForeignPtr<u8> = args.get(0).into();
        let flags: i32 = args.get(1).into();
        let mode: u32 = args.get(2).into();

        let cwd = ctx.process.cwd().clone();
        let path = Self::read_path(ctx, path_ptr, &cwd)?;
        Self::open_helper(ctx, path, flags, mode)
    }

    pub fn creat(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let path_ptr: ForeignPtr<u8> = args.get(0).into();
        let mode: u32 = args.get(1).into();

        let cwd = ctx.process.cwd().clone();
        let path = Self::read_path(ctx, path_ptr, &cwd)?;
        Self::open_helper(
            ctx,
            path,
            libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
            mode,
        )
    }

    pub fn fstat(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let stat_ptr: ForeignPtr<libc::stat> = args.get(1).into();

        let file = Self::get_descriptor(ctx, fd)?.file().clone();
        let stat = Self::stat_for_file(&file)?;

        ctx.process.memory.write_vals(stat_ptr, &[stat])?;
        Ok(0.into())
    }

    pub(super) fn stat_for_file(file: &File) -> Result<libc::stat, SyscallError> {
        match file {
            File::RegularFile(regular) => regular.borrow().stat(),
            other => {
                // SAFETY: stat is plain-old-data; an all-zero value is valid
                let mut stat: libc::stat = unsafe { std::mem::zeroed() };
                stat.st_mode = match other {
                    File::Socket(_) => libc::S_IFSOCK,
                    File::Pipe(_) => libc::S_IFIFO,
                    _ => 0,
                };
                stat.st_blksize = 4096;
                Ok(stat)
            }
        }
    }

    pub fn fstatfs(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let statfs_ptr: ForeignPtr<libc::statfs> = args.get(1).into();

        let file = Self::get_descriptor(ctx, fd)?.file().clone();
        let File::RegularFile(regular) = &file else {
            return Err(Errno::EINVAL.into());
        };
        let os_fd = regular.borrow().os_fd();

        // SAFETY: statfs is plain-old-data and the kernel fills it
        let mut out: libc::statfs = unsafe { std::mem::zeroed() };
        let rv = unsafe { libc::fstatfs(os_fd, &mut out) };
        if rv != 0 {
            return Err(Errno::last().into());
        }

        ctx.process.memory.write_vals(statfs_ptr, &[out])?;
        Ok(0.into())
    }

    pub fn statx(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let dirfd: i32 = args.get(0).into();
        let path_ptr: ForeignPtr<u8> = args.get(1).into();
        let flags: i32 = args.get(2).into();
        let _mask: u32 = args.get(3).into();
        let statx_ptr: ForeignPtr<libc::statx> = args.get(4).into();

        // resolve the target like fstatat would
        let stat = if flags & libc::AT_EMPTY_PATH != 0 {
            let file = Self::get_descriptor(ctx, dirfd)?.file().clone();
            Self::stat_for_file(&file)?
        } else {
            let base = Self::resolve_dirfd(ctx, dirfd)?;
            let path = Self::read_path(ctx, path_ptr, &base)?;
            nix::sys::stat::stat(&path).map_err(SyscallError::from)?
        };

        // SAFETY: statx is plain-old-data; an all-zero value is valid
        let mut out: libc::statx = unsafe { std::mem::zeroed() };
        out.stx_mask = libc::STATX_BASIC_STATS;
        out.stx_blksize = stat.st_blksize as u32;
        out.stx_nlink = stat.st_nlink as u32;
        out.stx_uid = stat.st_uid;
        out.stx_gid = stat.st_gid;
        out.stx_mode = stat.st_mode as u16;
        out.stx_ino = stat.st_ino;
        out.stx_size = stat.st_size as u64;
        out.stx_blocks = stat.st_blocks as u64;

        ctx.process.memory.write_vals(statx_ptr, &[out])?;
        Ok(0.into())
    }

    pub fn lseek(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let offset: i64 = args.get(1).into();
        let whence: i32 = args.get(2).into();

        let file = Self::get_descriptor(ctx, fd)?.file().clone();
        let File::RegularFile(regular) = &file else {
            return Err(Errno::ESPIPE.into());
        };

        let new_offset = regular.borrow_mut().lseek(offset, whence)?;
        Ok((new_offset as i64).into())
    }

    pub fn getdents64(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let dirp: ForeignPtr<u8> = args.get(1).into();
        let count: usize = args.get(2).into();

        let file = Self::get_descriptor(ctx, fd)?.file().clone();
        let File::RegularFile(regular) = &file else {
            return Err(Errno::ENOTDIR.into());
        };
        let os_fd = regular.borrow().os_fd();

        let mut buf = vec![0u8; count];
        // SAFETY: the kernel fills at most `count` bytes of the local buffer
        let rv = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                os_fd,
                buf.as_mut_ptr(),
                count as libc::c_uint,
            )
        };

        if rv < 0 {
            return Err(Errno::last().into());
        }

        let num = rv as usize;
        ctx.process.memory.write_bytes(dirp, &buf[..num])?;
        Ok(num.into())
    }

    pub fn unlink(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let path_ptr: ForeignPtr<u8> = args.get(0).into();
        let cwd = ctx.process.cwd().clone();
        let path = Self::read_path(ctx, path_ptr, &cwd)?;

        std::fs::remove_file(path).map_err(SyscallError::from)?;
        Ok(0.into())
    }

    pub fn link(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let old_ptr: ForeignPtr<u8> = args.get(0).into();
        let new_ptr: ForeignPtr<u8> = args.get(1).into();

        let cwd = ctx.process.cwd().clone();
        let old = Self::read_path(ctx, old_ptr, &cwd)?;
        let new = Self::read_path(ctx, new_ptr, &cwd)?;

        std::fs::hard_link(old, new).map_err(SyscallError::from)?;
        Ok(0.into())
    }

    pub fn rename(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let old_ptr: ForeignPtr<u8> = args.get(0).into();
        let new_ptr: ForeignPtr<u8> = args.get(1).into();

        let cwd = ctx.process.cwd().clone();
        let old = Self::read_path(ctx, old_ptr, &cwd)?;
        let new = Self::read_path(ctx, new_ptr, &cwd)?;

        std::fs::rename(old, new).map_err(SyscallError::from)?;
        Ok(0.into())
    }

    pub fn mkdir(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let path_ptr: ForeignPtr<u8> = args.get(0).into();
        let cwd = ctx.process.cwd().clone();
        let path = Self::read_path(ctx, path_ptr, &cwd)?;

        std::fs::create_dir(path).map_err(SyscallError::from)?;
        Ok(0.into())
    }

    pub fn rmdir(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let path_ptr: ForeignPtr<u8> = args.get(0).into();
        let cwd = ctx.process.cwd().clone();
        let path = Self::read_path(ctx, path_ptr, &cwd)?;

        std::fs::remove_dir(path).map_err(SyscallError::from)?;
        Ok(0.into())
    }

    pub fn ftruncate(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let length: i64 = args.get(1).into();

        let file = Self::get_descriptor(ctx, fd)?.file().clone();
        let File::RegularFile(regular) = &file else {
            return Err(Errno::EINVAL.into());
        };
        let os_fd = regular.borrow().os_fd();

        let rv = unsafe { libc::ftruncate(os_fd, length) };
        if rv != 0 {
            return Err(Errno::last().into());
        }
        Ok(0.into())
    }

    pub fn fsync(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        Self::fsync_helper(ctx, args.get(0).into())
    }

    pub fn fdatasync(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        Self::fsync_helper(ctx, args.get(0).into())
    }

    fn fsync_helper(ctx: &mut SyscallContext, fd: i32) -> SyscallResult {
        let file = Self::get_descriptor(ctx, fd)?.file().clone();
        let File::RegularFile(regular) = &file else {
            return Err(Errno::EINVAL.into());
        };
        let os_fd = regular.borrow().os_fd();

        let rv = unsafe { libc::fsync(os_fd) };
        if rv != 0 {
            return Err(Errno::last().into());
        }
        Ok(0.into())
    }

    // The simulated filesystem carries no extended attributes.

    pub fn fgetxattr(_ctx: &mut SyscallContext, _args: &SysCallArgs) -> SyscallResult {
        Err(Errno::ENOTSUP.into())
    }

    pub fn fsetxattr(_ctx: &mut SyscallContext, _args: &SysCallArgs) -> SyscallResult {
        Err(Errno::ENOTSUP.into())
    }

    pub fn flistxattr(_ctx: &mut SyscallContext, _args: &SysCallArgs) -> SyscallResult {
        Err(Errno::ENOTSUP.into())
    }

    pub fn fremovexattr(_ctx: &mut SyscallContext, _args: &SysCallArgs) -> SyscallResult {
        Err(Errno::ENOTSUP.into())
    }
}
