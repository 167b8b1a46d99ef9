use std::sync::{Arc, Weak};

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;
use sim_support::emulated_time::EmulatedTime;
use sim_support::simulation_time::SimulationTime;
use sim_support::syscall_types::ForeignPtr;

use crate::host::descriptor::listener::{StateEventSource, StateListenHandle, StateListenerFilter};
use crate::host::descriptor::{FileMode, FileSignals, FileState, FileStatus};
use crate::host::memory_manager::MemoryManager;
use crate::host::syscall::io::{IoVec, IoVecWriter};
use crate::host::syscall::types::{SyscallError, SyscallResult};
use crate::host::timer::Timer;
use crate::host::Host;
use crate::utility::callback_queue::CallbackQueue;

pub struct TimerFd {
    timer: Timer,
    event_source: StateEventSource,
    state: FileState,
    status: FileStatus,
    // should only be used by `OpenFile` to make sure there is only ever one
    // `OpenFile` instance for this file
    has_open_file: bool,
}

impl TimerFd {
    /// Creates a new [`TimerFd`] with no initial expiration (disarmed).
    pub fn new(status: FileStatus) -> Arc<AtomicRefCell<Self>> {
        Arc::new_cyclic(|weak: &Weak<AtomicRefCell<TimerFd>>| {
            let weak = weak.clone();

            // the timer expiration flips our readable bit; it runs inside the
            // host's event loop, so defer listener callbacks through a fresh
            // callback queue
            let timer = Timer::new(move |_host: &Host| {
                if let Some(timerfd) = weak.upgrade() {
                    CallbackQueue::queue_and_run(|cb_queue| {
                        timerfd.borrow_mut().refresh_state(cb_queue);
                    });
                }
            });

            AtomicRefCell::new(Self {
                timer,
                event_source: StateEventSource::new(),
                state: FileState::ACTIVE,
                status,
                has_open_file: false,
            })
        })
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn set_status(&mut self, status: FileStatus) {
        self.status = status;
    }

    pub fn mode(&self) -> FileMode {
        FileMode::READ
    }

    pub fn has_open_file(&self) -> bool {
        self.has_open_file
    }

    pub fn set_has_open_file(&mut self, val: bool) {
        self.has_open_file = val;
    }

    pub fn supports_sa_restart(&self) -> bool {
        true
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    /// The remaining time until expiration if armed, and the repeat interval.
    pub fn get_timer(&self) -> (Option<SimulationTime>, Option<SimulationTime>) {
        (self.timer.remaining_time(), self.timer.expire_interval())
    }

    /// Arm the timer for an absolute virtual expiration time, with an
    /// optional repeat interval.
    pub fn arm_timer(
        &mut self,
        host: &Host,
        expire_time: EmulatedTime,
        interval: Option<SimulationTime>,
        cb_queue: &mut CallbackQueue,
    ) {
        self.timer.arm(host, expire_time, interval);
        self.refresh_state(cb_queue);
    }

    pub fn disarm_timer(&mut self, cb_queue: &mut CallbackQueue) {
        self.timer.disarm();
        self.refresh_state(cb_queue);
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError> {
        self.timer.disarm();
        self.update_state(FileState::all(), FileState::CLOSED, cb_queue);
        Ok(())
    }

    pub fn readv(
        &mut self,
        iovs: &[IoVec],
        offset: Option<libc::off_t>,
        _flags: libc::c_int,
        mem: &mut MemoryManager,
        cb_queue: &mut CallbackQueue,
    ) -> Result<libc::ssize_t, SyscallError> {
        // timerfds don't support seeking
        if offset.is_some() {
            return Err(Errno::ESPIPE.into());
        }

        // timerfd_create(2): "read(2) returns an unsigned 8-byte integer
        // containing the number of expirations that have occurred"
        const NUM_BYTES: usize = 8;

        let len: usize = iovs.iter().map(|x| x.len).sum();

        if len < NUM_BYTES {
            log::trace!("Reading from a timerfd requires a buffer of at least {NUM_BYTES} bytes");
            return Err(Errno::EINVAL.into());
        }

        let expiration_count = self.timer.consume_expiration_count();

        if expiration_count == 0 {
            log::trace!("Timerfd has no expirations to read right now");
            return Err(Errno::EWOULDBLOCK.into());
        }

        let mut writer = IoVecWriter::new(iovs, mem);
        std::io::Write::write_all(&mut writer, &expiration_count.to_ne_bytes())?;

        self.refresh_state(cb_queue);

        Ok(NUM_BYTES.try_into().unwrap())
    }

    pub fn writev(
        &mut self,
        _iovs: &[IoVec],
        _offset: Option<libc::off_t>,
        _flags: libc::c_int,
        _mem: &mut MemoryManager,
        _cb_queue: &mut CallbackQueue,
    ) -> Result<libc::ssize_t, SyscallError> {
        // timerfds don't support writing
        Err(Errno::EINVAL.into())
    }

    pub fn ioctl(
        &mut self,
        request: u64,
        _arg_ptr: ForeignPtr<()>,
        _mem: &mut MemoryManager,
    ) -> SyscallResult {
        log::warn!("We do not yet handle ioctl request {request} on timerfds");
        Err(Errno::EINVAL.into())
    }

    pub fn add_listener(
        &mut self,
        monitoring_state: FileState,
        monitoring_signals: FileSignals,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, FileSignals, &mut CallbackQueue)
            + Send
            + Sync
            + 'static,
    ) -> StateListenHandle {
        self.event_source
            .add_listener(monitoring_state, monitoring_signals, filter, notify_fn)
    }

    fn refresh_state(&mut self, cb_queue: &mut CallbackQueue) {
        if self.state.contains(FileState::CLOSED) {
            return;
        }

        // readable iff there are unread expirations
        let readable = if self.timer.expiration_count() > 0 {
            FileState::READABLE
        } else {
            FileState::empty()
        };

        self.update_state(FileState::READABLE, readable, cb_queue);
    }

    fn update_state(&mut self, mask: FileState, state: FileState, cb_queue: &mut CallbackQueue) {
        let old_state = self.state;

        self.state.remove(mask);
        self.state.insert(state & mask);

        let states_changed = self.state ^ old_state;
        if states_changed.is_empty() {
            return;
        }

        self.event_source
            .notify_listeners(self.state, states_changed, FileSignals::empty(), cb_queue);
    }
}
