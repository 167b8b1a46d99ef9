use nix::errno::Errno;
use sim_support::emulated_time::EmulatedTime;
use sim_support::simulation_time::SimulationTime;
use sim_support::syscall_types::{ForeignPtr, SysCallArgs};

use crate::core::worker::Worker;
use crate::host::context::SyscallContext;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{SyscallError, SyscallResult};

impl SyscallHandler {
    pub fn clock_gettime(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let clock_id: i32 = args.get(0).into();
        let ts_ptr: ForeignPtr<libc::timespec> = args.get(1).into();

        match clock_id {
            libc::CLOCK_REALTIME
            | libc::CLOCK_MONOTONIC
            | libc::CLOCK_REALTIME_COARSE
            | libc::CLOCK_MONOTONIC_COARSE
            | libc::CLOCK_MONOTONIC_RAW
            | libc::CLOCK_BOOTTIME => {}
            _ => return Err(Errno::EINVAL.into()),
        }

        // every clock reads the virtual clock; the simulation has exactly one
        // notion of time
        let now = Worker::current_time().unwrap();
        let since_epoch = now.duration_since(&EmulatedTime::UNIX_EPOCH);

        let ts: libc::timespec = since_epoch.try_into().map_err(|_| Errno::EOVERFLOW)?;
        ctx.process.memory.write_vals(ts_ptr, &[ts])?;

        Ok(0.into())
    }

    pub fn gettimeofday(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let tv_ptr: ForeignPtr<libc::timeval> = args.get(0).into();
        // the timezone argument is obsolete and ignored

        if !tv_ptr.is_null() {
            let now = Worker::current_time().unwrap();
            let since_epoch = now.duration_since(&EmulatedTime::UNIX_EPOCH);

            let tv: libc::timeval = since_epoch.try_into().map_err(|_| Errno::EOVERFLOW)?;
            ctx.process.memory.write_vals(tv_ptr, &[tv])?;
        }

        Ok(0.into())
    }

    pub fn time(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let time_ptr: ForeignPtr<i64> = args.get(0).into();

        let now = Worker::current_time().unwrap();
        let secs = now.duration_since(&EmulatedTime::UNIX_EPOCH).as_secs() as i64;

        if !time_ptr.is_null() {
            ctx.process.memory.write_vals(time_ptr, &[secs])?;
        }

        Ok(secs.into())
    }

    pub fn nanosleep(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let req_ptr: ForeignPtr<libc::timespec> = args.get(0).into();
        let rem_ptr: ForeignPtr<libc::timespec> = args.get(1).into();

        let req = ctx.process.memory.read_val(req_ptr)?;
        let duration = SimulationTime::try_from(req).map_err(|_| Errno::EINVAL)?;

        Self::sleep_until_helper(ctx, duration, rem_ptr, /* absolute= */ false)
    }

    pub fn clock_nanosleep(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let clock_id: i32 = args.get(0).into();
        let flags: i32 = args.get(1).into();
        let req_ptr: ForeignPtr<libc::timespec> = args.get(2).into();
        let rem_ptr: ForeignPtr<libc::timespec> = args.get(3).into();

        match clock_id {
            libc::CLOCK_REALTIME | libc::CLOCK_MONOTONIC | libc::CLOCK_BOOTTIME => {}
            _ => return Err(Errno::EINVAL.into()),
        }

        let req = ctx.process.memory.read_val(req_ptr)?;
        let requested = SimulationTime::try_from(req).map_err(|_| Errno::EINVAL)?;

        if flags & libc::TIMER_ABSTIME != 0 {
            // an absolute expiry against the virtual epoch
            let target = EmulatedTime::UNIX_EPOCH + requested;
            let now = Worker::current_time().unwrap();

            if target <= now {
                return Ok(0.into());
            }

            // absolute sleeps are naturally idempotent across re-runs and
            // never write a remainder
            return Err(SyscallError::new_blocked_until(target, /* restartable= */ true));
        }

        Self::sleep_until_helper(ctx, requested, rem_ptr, /* absolute= */ false)
    }

    /// Shared relative-sleep path. A zero duration completes immediately
    /// without advancing virtual time.
    fn sleep_until_helper(
        ctx: &mut SyscallContext,
        duration: SimulationTime,
        rem_ptr: ForeignPtr<libc::timespec>,
        _absolute: bool,
    ) -> SyscallResult {
        let now = Worker::current_time().unwrap();

        // a resumed sleep consults the deadline it originally armed instead
        // of sleeping the full duration again
        if let Some(resumed) = ctx.resumed {
            let Some(deadline) = resumed.deadline else {
                // a sleep condition always has a deadline
                return Err(Errno::EINVAL.into());
            };

            if now >= deadline {
                return Ok(0.into());
            }

            // a spurious wakeup (e.g. a signal that was not delivered);
            // report the remaining time and re-block
            if !rem_ptr.is_null() {
                let remaining = deadline.duration_since(&now);
                let rem: libc::timespec = remaining.try_into().map_err(|_| Errno::EOVERFLOW)?;
                ctx.process.memory.write_vals(rem_ptr, &[rem])?;
            }

            return Err(SyscallError::new_blocked_until(deadline, /* restartable= */ false));
        }

        if duration.is_zero() {
            return Ok(0.into());
        }

        Err(SyscallError::new_blocked_until(
            now + duration,
            /* restartable= */ false,
        ))
    }
}
