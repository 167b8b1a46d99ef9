use std::sync::{Arc, Weak};

use atomic_refcell::AtomicRefCell;
use log::trace;
use sim_support::emulated_time::EmulatedTime;
use sim_support::simulation_time::SimulationTime;

use crate::core::work::event::EventKind;
use crate::core::work::task::TaskRef;
use crate::core::worker::Worker;
use crate::host::Host;

/// A cancellable virtual-time timer with an optional repeat interval.
/// Expirations are counted; disarming invalidates any already-scheduled
/// expiration events via a generation check.
pub struct Timer {
    // Internals in an Arc so that we can schedule tasks that refer back to
    // it. This is the only persistent strong reference - callbacks use a Weak
    // reference, so scheduled callbacks whose timer was dropped become no-ops.
    internal: Arc<AtomicRefCell<TimerInternal>>,
}

struct TimerInternal {
    next_expire_time: Option<EmulatedTime>,
    expire_interval: Option<SimulationTime>,
    expiration_count: u64,
    next_expire_id: u64,
    min_valid_expire_id: u64,
    on_expire: Box<dyn Fn(&Host) + Send + Sync>,
}

impl TimerInternal {
    fn reset(&mut self, next_expire_time: Option<EmulatedTime>, expire_interval: Option<SimulationTime>) {
        self.min_valid_expire_id = self.next_expire_id;
        self.expiration_count = 0;
        self.next_expire_time = next_expire_time;
        self.expire_interval = expire_interval;
    }
}

impl Timer {
    /// Create a new Timer that directly executes `on_expire` on expiration.
    /// `on_expire` will cause a panic if it calls mutable methods of the
    /// enclosing Timer; if it may need to, it should instead push a new task
    /// to the scheduler to do so.
    pub fn new<F: 'static + Fn(&Host) + Send + Sync>(on_expire: F) -> Self {
        Self {
            internal: Arc::new(AtomicRefCell::new(TimerInternal {
                next_expire_time: None,
                expire_interval: None,
                expiration_count: 0,
                next_expire_id: 0,
                min_valid_expire_id: 0,
                on_expire: Box::new(on_expire),
            })),
        }
    }

    pub fn expiration_count(&self) -> u64 {
        self.internal.borrow().expiration_count
    }

    pub fn expire_interval(&self) -> Option<SimulationTime> {
        self.internal.borrow().expire_interval
    }

    pub fn consume_expiration_count(&mut self) -> u64 {
        let mut internal = self.internal.borrow_mut();
        let count = internal.expiration_count;
        internal.expiration_count = 0;
        count
    }

    /// Returns the remaining time until the next expiration if the timer is
    /// armed, or None otherwise.
    pub fn remaining_time(&self) -> Option<SimulationTime> {
        let t = self.internal.borrow().next_expire_time?;
        let now = Worker::current_time().unwrap();
        Some(t.saturating_duration_since(&now))
    }

    pub fn disarm(&mut self) {
        self.internal.borrow_mut().reset(None, None);
    }

    fn timer_expire(
        internal_weak: &Weak<AtomicRefCell<TimerInternal>>,
        host: &Host,
        expire_id: u64,
    ) {
        let Some(internal) = Weak::upgrade(internal_weak) else {
            trace!("Expired Timer no longer exists.");
            return;
        };

        let mut internal_brw = internal.borrow_mut();
        if expire_id < internal_brw.min_valid_expire_id {
            // cancelled (disarmed or re-armed since this was scheduled)
            return;
        }

        let next_expire_time = internal_brw.next_expire_time.unwrap();
        if next_expire_time > Worker::current_time().unwrap() {
            // hasn't expired yet; check again later
            Self::schedule_new_expire_event(&mut internal_brw, internal_weak.clone(), host);
            return;
        }

        internal_brw.expiration_count += 1;
        if let Some(interval) = internal_brw.expire_interval {
            internal_brw.next_expire_time = Some(next_expire_time + interval);
            Self::schedule_new_expire_event(&mut internal_brw, internal_weak.clone(), host);
        } else {
            internal_brw.next_expire_time = None;
        }

        // re-borrow as an immutable reference while executing the callback
        drop(internal_brw);
        let internal_brw = internal.borrow();
        (internal_brw.on_expire)(host);
    }

    fn schedule_new_expire_event(
        internal_ref: &mut TimerInternal,
        internal_ptr: Weak<AtomicRefCell<TimerInternal>>,
        host: &Host,
    ) {
        let now = Worker::current_time().unwrap();
        let delay = internal_ref.next_expire_time.unwrap() - now;

        let expire_id = internal_ref.next_expire_id;
        internal_ref.next_expire_id += 1;

        let task = TaskRef::new(move |host| Self::timer_expire(&internal_ptr, host, expire_id));
        host.schedule_task_with_delay(task, delay, EventKind::Callback);
    }

    /// Arm the timer for `expire_time`, repeating at `expire_interval` if
    /// given. Any previous arming is cancelled.
    pub fn arm(
        &mut self,
        host: &Host,
        expire_time: EmulatedTime,
        expire_interval: Option<SimulationTime>,
    ) {
        debug_assert!(expire_time >= Worker::current_time().unwrap());

        let mut internal = self.internal.borrow_mut();
        internal.reset(Some(expire_time), expire_interval);
        Self::schedule_new_expire_event(&mut internal, Arc::downgrade(&self.internal), host);
    }
}
