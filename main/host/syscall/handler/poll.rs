use std::sync::Arc;

use nix::errno::Errno;
use sim_support::simulation_time::SimulationTime;
use sim_support::syscall_types::{ForeignPtr, SysCallArgs};

use crate::core::worker::Worker;
use crate::host::context::SyscallContext;
use crate::host::descriptor::epoll::{Epoll, EpollCtlOp, EpollEvents};
use crate::host::descriptor::{File, FileState};
use crate::host::syscall::condition::SyscallCondition;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{Blocked, SyscallError, SyscallResult};
use crate::host::syscall::Trigger;
use crate::utility::callback_queue::CallbackQueue;

impl SyscallHandler {
    pub fn poll(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fds_ptr: ForeignPtr<libc::pollfd> = args.get(0).into();
        let nfds: u64 = args.get(1).into();
        let timeout_ms: i32 = args.get(2).into();

        Self::poll_helper(ctx, fds_ptr, nfds, timeout_ms)
    }

    pub fn ppoll(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let fds_ptr: ForeignPtr<libc::pollfd> = args.get(0).into();
        let nfds: u64 = args.get(1).into();
        let ts_ptr: ForeignPtr<libc::timespec> = args.get(2).into();
        // the signal mask is not consulted

        let timeout_ms = if ts_ptr.is_null() {
            -1
        } else {
            let ts = ctx.process.memory.read_val(ts_ptr)?;
            let duration = SimulationTime::try_from(ts).map_err(|_| Errno::EINVAL)?;
            duration.as_millis().min(i32::MAX as u64) as i32
        };

        Self::poll_helper(ctx, fds_ptr, nfds, timeout_ms)
    }

    fn poll_helper(
        ctx: &mut SyscallContext,
        fds_ptr: ForeignPtr<libc::pollfd>,
        nfds: u64,
        timeout_ms: i32,
    ) -> SyscallResult {
        if nfds > i32::MAX as u64 {
            return Err(Errno::EINVAL.into());
        }
        let nfds = nfds as usize;

        let mut pollfds = vec![
            libc::pollfd {
                fd: 0,
                events: 0,
                revents: 0,
            };
            nfds
        ];
        ctx.process.memory.read_vals(fds_ptr, &mut pollfds)?;

        // evaluate the current state of every polled descriptor
        let mut num_ready = 0;
        for pollfd in pollfds.iter_mut() {
            pollfd.revents = 0;

            if pollfd.fd < 0 {
                // poll(2): negative fds are skipped
                continue;
            }

            let Ok(descriptor) = Self::get_descriptor(ctx, pollfd.fd) else {
                pollfd.revents = libc::POLLNVAL;
                num_ready += 1;
                continue;
            };

            let state = descriptor.file().borrow().state();

            let mut revents = 0;
            if pollfd.events & libc::POLLIN != 0
                && state.intersects(FileState::READABLE | FileState::SOCKET_ALLOWING_CONNECT)
            {
                revents |= libc::POLLIN;
            }
            if pollfd.events & libc::POLLOUT != 0 && state.contains(FileState::WRITABLE) {
                revents |= libc::POLLOUT;
            }
            // errors and hangups are reported regardless of interest
            if state.contains(FileState::ERROR) {
                revents |= libc::POLLERR;
            }
            if state.contains(FileState::HUP) {
                revents |= libc::POLLHUP;
            }

            if revents != 0 {
                pollfd.revents = revents;
                num_ready += 1;
            }
        }

        if num_ready > 0 || timeout_ms == 0 {
            ctx.process.memory.write_vals(fds_ptr, &pollfds)?;
            return Ok((num_ready as i64).into());
        }

        // a resumed poll whose deadline passed reports zero descriptors
        if let Some(resumed) = ctx.resumed {
            let now = Worker::current_time().unwrap();
            if resumed.deadline_elapsed(now) {
                ctx.process.memory.write_vals(fds_ptr, &pollfds)?;
                return Ok(0.into());
            }
        }

        // Nothing ready: wait on every polled descriptor at once by watching
        // them through a private epoll. Its readable bit flips when any
        // watched descriptor becomes ready, and the re-run re-evaluates the
        // poll set from scratch.
        let epoll = Epoll::new();

        CallbackQueue::queue_and_run(|cb_queue| -> Result<(), SyscallError> {
            for pollfd in &pollfds {
                if pollfd.fd < 0 {
                    continue;
                }

                let Ok(descriptor) = Self::get_descriptor(ctx, pollfd.fd) else {
                    continue;
                };

                let mut events = EpollEvents::empty();
                if pollfd.events & libc::POLLIN != 0 {
                    events.insert(EpollEvents::EPOLLIN);
                }
                if pollfd.events & libc::POLLOUT != 0 {
                    events.insert(EpollEvents::EPOLLOUT);
                }

                let weak = Arc::downgrade(&epoll);
                epoll.borrow_mut().ctl(
                    EpollCtlOp::Add,
                    pollfd.fd,
                    descriptor.file().clone(),
                    events,
                    0,
                    weak,
                    cb_queue,
                )?;
            }
            Ok(())
        })?;

        let deadline = if timeout_ms > 0 {
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

        let trigger = Trigger::from_file(File::Epoll(epoll), FileState::READABLE);
        let mut condition = SyscallCondition::new(trigger);
        condition.set_timeout(deadline);

        Err(SyscallError::Blocked(Blocked {
            condition,
            restartable: false,
        }))
    }
}
