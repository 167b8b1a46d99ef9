use std::sync::Arc;

use nix::errno::Errno;
use sim_support::simulation_time::SimulationTime;
use sim_support::syscall_types::{ForeignPtr, SysCallArgs};

use crate::core::worker::Worker;
use crate::host::context::SyscallContext;
use crate::host::descriptor::epoll::{Epoll, EpollCtlOp, EpollEvents};
use crate::host::descriptor::{Descriptor, File, FileState, OpenFile};
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::condition::SyscallCondition;
use crate::host::syscall::types::{Blocked, SyscallError, SyscallResult};
use crate::host::syscall::Trigger;
use crate::utility::callback_queue::CallbackQueue;

impl SyscallHandler {
    pub fn epoll_create(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let size: i32 = args.get(0).into();

        // epoll_create(2): the size argument is ignored, but must be > 0
        if size <= 0 {
            return Err(Errno::EINVAL.into());
        }

        Self::epoll_create_helper(ctx, 0)
    }

    pub fn epoll_create1(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        Self::epoll_create_helper(ctx, args.get(0).into())
    }

    fn epoll_create_helper(ctx: &mut SyscallContext, flags: i32) -> SyscallResult {
        if flags != 0 && flags != libc::EPOLL_CLOEXEC {
            return Err(Errno::EINVAL.into());
        }

        let epoll = Epoll::new();
        let mut descriptor = Descriptor::new(OpenFile::new(File::Epoll(epoll)));

        if flags & libc::EPOLL_CLOEXEC != 0 {
            descriptor.set_flags(crate::host::descriptor::DescriptorFlags::FD_CLOEXEC);
        }

        let fd = ctx.process.descriptor_table.add(descriptor, 0);
        Ok((fd as i64).into())
    }

    pub fn epoll_ctl(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let epfd: i32 = args.get(0).into();
        let op: i32 = args.get(1).into();
        let fd: i32 = args.get(2).into();
        let event_ptr: ForeignPtr<libc::epoll_event> = args.get(3).into();

        let op = EpollCtlOp::try_from(op)?;

        let epoll_file = Self::get_descriptor(ctx, epfd)?.file().clone();
        let File::Epoll(epoll) = &epoll_file else {
            return Err(Errno::EINVAL.into());
        };

        let target_file = Self::get_descriptor(ctx, fd)?.file().clone();

        // a file cannot watch itself
        if target_file.canonical_handle() == epoll_file.canonical_handle() {
            return Err(Errno::EINVAL.into());
        }

        let (events, data) = if op == EpollCtlOp::Del {
            (EpollEvents::empty(), 0)
        } else {
            let event = ctx.process.memory.read_val(event_ptr)?;
            let events = EpollEvents::from_bits_truncate(event.events);
            (events, event.u64)
        };

        let weak_epoll = Arc::downgrade(&epoll);
        CallbackQueue::queue_and_run(|cb_queue| {
            epoll
                .borrow_mut()
                .ctl(op, fd, target_file, events, data, weak_epoll, cb_queue)
        })?;

        Ok(0.into())
    }

    pub fn epoll_wait(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let epfd: i32 = args.get(0).into();
        let events_ptr: ForeignPtr<libc::epoll_event> = args.get(1).into();
        let max_events: i32 = args.get(2).into();
        let timeout_ms: i32 = args.get(3).into();

        Self::epoll_wait_helper(ctx, epfd, events_ptr, max_events, timeout_ms)
    }

    pub fn epoll_pwait(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let epfd: i32 = args.get(0).into();
        let events_ptr: ForeignPtr<libc::epoll_event> = args.get(1).into();
        let max_events: i32 = args.get(2).into();
        let timeout_ms: i32 = args.get(3).into();
        // the signal mask is not consulted; the simulation delivers no
        // asynchronous signals

        Self::epoll_wait_helper(ctx, epfd, events_ptr, max_events, timeout_ms)
    }

    fn epoll_wait_helper(
        ctx: &mut SyscallContext,
        epfd: i32,
        events_ptr: ForeignPtr<libc::epoll_event>,
        max_events: i32,
        timeout_ms: i32,
    ) -> SyscallResult {
        if max_events <= 0 {
            return Err(Errno::EINVAL.into());
        }

        let epoll_file = Self::get_descriptor(ctx, epfd)?.file().clone();
        let File::Epoll(epoll) = &epoll_file else {
            return Err(Errno::EINVAL.into());
        };

        if epoll.borrow().has_ready_events() {
            let ready = CallbackQueue::queue_and_run(|cb_queue| {
                epoll
                    .borrow_mut()
                    .collect_ready_events(cb_queue, max_events as u32)
            });

            let out: Vec<libc::epoll_event> = ready
                .into_iter()
                .map(|(events, data)| libc::epoll_event {
                    events: events.bits(),
                    u64: data,
                })
                .collect();

            ctx.process.memory.write_vals(events_ptr, &out)?;
            return Ok((out.len() as i64).into());
        }

        // nothing ready: a zero timeout polls, otherwise block on the epoll
        // descriptor's own readability (which mirrors "ready set nonempty")
        if timeout_ms == 0 {
            return Ok(0.into());
        }

        // a resumed wait whose deadline passed reports zero events
        if let Some(resumed) = ctx.resumed {
            let now = Worker::current_time().unwrap();
            if resumed.deadline_elapsed(now) {
                return Ok(0.into());
            }
        }

        let deadline = if timeout_ms > 0 {
            // keep an armed deadline rather than restarting the timeout
            match ctx.resumed.and_then(|resumed| resumed.deadline) {
                Some(deadline) => Some(deadline),
                None => {
                    let now = Worker::current_time().unwrap();
                    Some(now + SimulationTime::from_millis(timeout_ms as u64))
                }
            }
        } else {
            None
        };

        let trigger = Trigger::from_file(epoll_file.clone(), FileState::READABLE);
        let mut condition = SyscallCondition::new(trigger);
        condition.set_timeout(deadline);

        Err(SyscallError::Blocked(Blocked {
            condition,
            // see epoll_wait(2): always interruptible, never restarted
            restartable: false,
        }))
    }
}
