use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;
use sim_support::syscall_types::{ForeignPtr, SysCallArgs};

use crate::host::context::SyscallContext;
use crate::host::descriptor::pipe::Pipe;
use crate::host::descriptor::shared_buf::SharedBuf;
use crate::host::descriptor::socket::{RecvmsgArgs, SendmsgArgs};
use crate::host::descriptor::{
    Descriptor, DescriptorFlags, File, FileMode, FileState, FileStatus, OpenFile,
};
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::io::IoVec;
use crate::host::syscall::types::{Failed, SyscallError, SyscallResult};
use crate::utility::callback_queue::CallbackQueue;

/// The capacity of a pipe's shared buffer.
const CONFIG_PIPE_BUFFER_SIZE: usize = 65536;

impl SyscallHandler {
    /// Convert a would-block failure into a blocking condition on the file,
    /// honoring `O_NONBLOCK`.
    pub(super) fn maybe_block(
        file: &File,
        wait_state: FileState,
        err: SyscallError,
    ) -> SyscallError {
        let (nonblock, restartable) = {
            let file_ref = file.borrow();
            (
                file_ref.status().contains(FileStatus::NONBLOCK),
                file_ref.supports_sa_restart(),
            )
        };

        match &err {
            SyscallError::Failed(Failed {
                errno: Errno::EAGAIN,
                ..
            }) if !nonblock => SyscallError::new_blocked_on_file(
                file.clone(),
                wait_state | FileState::ERROR | FileState::HUP,
                restartable,
            ),
            _ => err,
        }
    }

    pub(super) fn read_helper(
        ctx: &mut SyscallContext,
        fd: i32,
        iovs: &[IoVec],
        offset: Option<libc::off_t>,
    ) -> SyscallResult {
        let file = Self::get_descriptor(ctx, fd)?.file().clone();

        let result: Result<libc::ssize_t, SyscallError> = match (&file, offset) {
            // sockets don't support offsets
            (File::Socket(_), Some(_)) => Err(Errno::ESPIPE.into()),
            (File::Socket(socket), None) => {
                let socket = socket.clone();
                let args = RecvmsgArgs { iovs, flags: 0 };
                CallbackQueue::queue_and_run(|cb_queue| {
                    socket.recvmsg(args, &mut ctx.process.memory, cb_queue)
                })
                .map(|recv| recv.return_val)
            }
            _ => CallbackQueue::queue_and_run(|cb_queue| {
                file.borrow_mut()
                    .readv(iovs, offset, 0, &mut ctx.process.memory, cb_queue)
            }),
        };

        match result {
            Ok(n) => Ok(n.into()),
            Err(e) => Err(Self::maybe_block(&file, FileState::READABLE, e)),
        }
    }

    pub(super) fn write_helper(
        ctx: &mut SyscallContext,
        fd: i32,
        iovs: &[IoVec],
        offset: Option<libc::off_t>,
    ) -> SyscallResult {
        let file = Self::get_descriptor(ctx, fd)?.file().clone();

        let result: Result<libc::ssize_t, SyscallError> = match (&file, offset) {
            (File::Socket(_), Some(_)) => Err(Errno::ESPIPE.into()),
            (File::Socket(socket), None) => {
                let socket = socket.clone();
                let args = SendmsgArgs {
                    addr: None,
                    iovs,
                    flags: 0,
                };
                let rng = ctx.host.with_random_mut(rand_fork);
                CallbackQueue::queue_and_run(|cb_queue| {
                    socket.sendmsg(args, &mut ctx.process.memory, ctx.host.net_ns(), rng, cb_queue)
                })
            }
            _ => CallbackQueue::queue_and_run(|cb_queue| {
                file.borrow_mut()
                    .writev(iovs, offset, 0, &mut ctx.process.memory, cb_queue)
            }),
        };

        match result {
            Ok(n) => Ok(n.into()),
            Err(e) => Err(Self::maybe_block(&file, FileState::WRITABLE, e)),
        }
    }

    pub fn read(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let iov = IoVec {
            base: args.get(1).into(),
            len: args.get(2).into(),
        };

        Self::read_helper(ctx, fd, &[iov], None)
    }

    pub fn pread64(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let iov = IoVec {
            base: args.get(1).into(),
            len: args.get(2).into(),
        };
        let offset: i64 = args.get(3).into();

        Self::read_helper(ctx, fd, &[iov], Some(offset))
    }

    pub fn write(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let iov = IoVec {
            base: args.get(1).into(),
            len: args.get(2).into(),
        };

        Self::write_helper(ctx, fd, &[iov], None)
    }

    pub fn pwrite64(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let iov = IoVec {
            base: args.get(1).into(),
            len: args.get(2).into(),
        };
        let offset: i64 = args.get(3).into();

        Self::write_helper(ctx, fd, &[iov], Some(offset))
    }

    pub fn close(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: u32 = i32::from(args.get(0)).try_into().map_err(|_| Errno::EBADF)?;

        let descriptor = ctx
            .process
            .descriptor_table
            .remove(fd)
            .ok_or(Errno::EBADF)?;

        let result = CallbackQueue::queue_and_run(|cb_queue| descriptor.close(cb_queue));

        match result {
            Some(Ok(())) | None => Ok(0.into()),
            Some(Err(e)) => Err(e),
        }
    }

    pub fn dup(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();

        let descriptor = Self::get_descriptor(ctx, fd)?;
        let new_descriptor = descriptor.dup(DescriptorFlags::empty());
        let new_fd = ctx.process.descriptor_table.add(new_descriptor, 0);

        Ok((new_fd as i64).into())
    }

    pub fn dup2(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let old_fd: i32 = args.get(0).into();
        let new_fd: i32 = args.get(1).into();

        let new_fd: u32 = new_fd.try_into().map_err(|_| Errno::EBADF)?;

        // dup2(2): if oldfd is a valid file descriptor and newfd has the same
        // value, do nothing and return newfd
        let descriptor = Self::get_descriptor(ctx, old_fd)?;
        if old_fd as u32 == new_fd {
            return Ok((new_fd as i64).into());
        }

        let new_descriptor = descriptor.dup(DescriptorFlags::empty());
        let replaced = ctx.process.descriptor_table.set(new_fd, new_descriptor);

        if let Some(replaced) = replaced {
            CallbackQueue::queue_and_run(|cb_queue| replaced.close(cb_queue));
        }

        Ok((new_fd as i64).into())
    }

    pub fn dup3(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let old_fd: i32 = args.get(0).into();
        let new_fd: i32 = args.get(1).into();
        let flags: i32 = args.get(2).into();

        // dup3(2): if oldfd equals newfd, fail with EINVAL
        if old_fd == new_fd {
            return Err(Errno::EINVAL.into());
        }

        let descriptor_flags = if flags & libc::O_CLOEXEC != 0 {
            DescriptorFlags::FD_CLOEXEC
        } else if flags != 0 {
            return Err(Errno::EINVAL.into());
        } else {
            DescriptorFlags::empty()
        };

        let new_fd: u32 = new_fd.try_into().map_err(|_| Errno::EBADF)?;

        let descriptor = Self::get_descriptor(ctx, old_fd)?;
        let new_descriptor = descriptor.dup(descriptor_flags);
        let replaced = ctx.process.descriptor_table.set(new_fd, new_descriptor);

        if let Some(replaced) = replaced {
            CallbackQueue::queue_and_run(|cb_queue| replaced.close(cb_queue));
        }

        Ok((new_fd as i64).into())
    }

    pub fn pipe(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        Self::pipe_helper(ctx, args.get(0).into(), 0)
    }

    pub fn pipe2(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        Self::pipe_helper(ctx, args.get(0).into(), args.get(1).into())
    }

    fn pipe_helper(
        ctx: &mut SyscallContext,
        fd_ptr: ForeignPtr<libc::c_int>,
        flags: i32,
    ) -> SyscallResult {
        let (file_status, remaining) = FileStatus::from_o_flags(flags);
        let remaining = remaining & !libc::O_CLOEXEC;
        if remaining != 0 {
            log::debug!("Invalid pipe flags: {remaining:#o}");
            return Err(Errno::EINVAL.into());
        }

        let descriptor_flags = if flags & libc::O_CLOEXEC != 0 {
            DescriptorFlags::FD_CLOEXEC
        } else {
            DescriptorFlags::empty()
        };

        // the two pipe ends share one buffer
        let buffer = Arc::new(AtomicRefCell::new(SharedBuf::new(CONFIG_PIPE_BUFFER_SIZE)));

        let reader = Pipe::new(FileMode::READ, file_status);
        let writer = Pipe::new(FileMode::WRITE, file_status);

        CallbackQueue::queue_and_run(|cb_queue| {
            Pipe::connect_to_buffer(&reader, Arc::clone(&buffer), cb_queue);
            Pipe::connect_to_buffer(&writer, Arc::clone(&buffer), cb_queue);
        });

        let mut reader_desc = Descriptor::new(OpenFile::new(File::Pipe(reader)));
        let mut writer_desc = Descriptor::new(OpenFile::new(File::Pipe(writer)));
        reader_desc.set_flags(descriptor_flags);
        writer_desc.set_flags(descriptor_flags);

        let read_fd = ctx.process.descriptor_table.add(reader_desc, 0);
        let write_fd = ctx.process.descriptor_table.add(writer_desc, 0);

        let fds = [read_fd as libc::c_int, write_fd as libc::c_int];
        if let Err(e) = ctx.process.memory.write_vals(fd_ptr, &fds) {
            // back out the descriptors on a bad pointer
            let reader_desc = ctx.process.descriptor_table.remove(read_fd).unwrap();
            let writer_desc = ctx.process.descriptor_table.remove(write_fd).unwrap();
            CallbackQueue::queue_and_run(|cb_queue| {
                reader_desc.close(cb_queue);
                writer_desc.close(cb_queue);
            });
            return Err(e.into());
        }

        Ok(0.into())
    }
}

/// Split off an independent RNG stream from the host RNG for operations that
/// may draw (ephemeral ports).
pub(super) fn rand_fork(rng: &mut rand_xoshiro::Xoshiro256PlusPlus) -> rand_xoshiro::Xoshiro256PlusPlus {
    use rand::SeedableRng;
    rand_xoshiro::Xoshiro256PlusPlus::from_rng(rng).unwrap()
}
