use nix::errno::Errno;
use sim_support::emulated_time::EmulatedTime;
use sim_support::simulation_time::SimulationTime;
use sim_support::syscall_types::{ForeignPtr, SysCallArgs};

use crate::core::worker::Worker;
use crate::host::context::SyscallContext;
use crate::host::descriptor::timerfd::TimerFd;
use crate::host::descriptor::{Descriptor, DescriptorFlags, File, FileStatus, OpenFile};
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::SyscallResult;
use crate::utility::callback_queue::CallbackQueue;

impl SyscallHandler {
    pub fn timerfd_create(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let clock_id: i32 = args.get(0).into();
        let flags: i32 = args.get(1).into();

        match clock_id {
            libc::CLOCK_REALTIME | libc::CLOCK_MONOTONIC | libc::CLOCK_BOOTTIME => {}
            _ => return Err(Errno::EINVAL.into()),
        }

        let known = libc::TFD_NONBLOCK | libc::TFD_CLOEXEC;
        if flags & !known != 0 {
            return Err(Errno::EINVAL.into());
        }

        let mut file_status = FileStatus::empty();
        if flags & libc::TFD_NONBLOCK != 0 {
            file_status.insert(FileStatus::NONBLOCK);
        }

        let file = TimerFd::new(file_status);
        let mut descriptor = Descriptor::new(OpenFile::new(File::TimerFd(file)));

        if flags & libc::TFD_CLOEXEC != 0 {
            descriptor.set_flags(DescriptorFlags::FD_CLOEXEC);
        }

        let fd = ctx.process.descriptor_table.add(descriptor, 0);
        Ok((fd as i64).into())
    }

    pub fn timerfd_settime(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let flags: i32 = args.get(1).into();
        let new_value_ptr: ForeignPtr<libc::itimerspec> = args.get(2).into();
        let old_value_ptr: ForeignPtr<libc::itimerspec> = args.get(3).into();

        let file = Self::get_descriptor(ctx, fd)?.file().clone();
        let File::TimerFd(timerfd) = &file else {
            return Err(Errno::EINVAL.into());
        };

        let new_value = ctx.process.memory.read_val(new_value_ptr)?;

        let interval = SimulationTime::try_from(new_value.it_interval).map_err(|_| Errno::EINVAL)?;
        let initial = SimulationTime::try_from(new_value.it_value).map_err(|_| Errno::EINVAL)?;

        if !old_value_ptr.is_null() {
            let old = Self::itimerspec_from_timerfd(&timerfd.borrow());
            ctx.process.memory.write_vals(old_value_ptr, &[old])?;
        }

        let now = Worker::current_time().unwrap();

        CallbackQueue::queue_and_run(|cb_queue| {
            let mut timerfd = timerfd.borrow_mut();

            if initial.is_zero() {
                // a zero it_value disarms
                timerfd.disarm_timer(cb_queue);
                return;
            }

            let expire_at = if flags & libc::TFD_TIMER_ABSTIME != 0 {
                EmulatedTime::UNIX_EPOCH + initial
            } else {
                now + initial
            };

            // an absolute time in the past fires immediately
            let expire_at = expire_at.max(now);

            let interval = (!interval.is_zero()).then_some(interval);
            timerfd.arm_timer(ctx.host, expire_at, interval, cb_queue);
        });

        Ok(0.into())
    }

    pub fn timerfd_gettime(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fd: i32 = args.get(0).into();
        let curr_value_ptr: ForeignPtr<libc::itimerspec> = args.get(1).into();

        let file = Self::get_descriptor(ctx, fd)?.file().clone();
        let File::TimerFd(timerfd) = &file else {
            return Err(Errno::EINVAL.into());
        };

        let value = Self::itimerspec_from_timerfd(&timerfd.borrow());
        ctx.process.memory.write_vals(curr_value_ptr, &[value])?;

        Ok(0.into())
    }

    fn itimerspec_from_timerfd(timerfd: &crate::host::descriptor::timerfd::TimerFd) -> libc::itimerspec {
        let (remaining, interval) = timerfd.get_timer();

        let zero = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        libc::itimerspec {
            it_value: remaining.and_then(|x| x.try_into().ok()).unwrap_or(zero),
            it_interval: interval.and_then(|x| x.try_into().ok()).unwrap_or(zero),
        }
    }
}
