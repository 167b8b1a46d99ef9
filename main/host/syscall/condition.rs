use sim_support::emulated_time::EmulatedTime;

use crate::host::syscall::Trigger;

/// The condition a blocked syscall waits on: the union of an optional file
/// trigger and an optional absolute-virtual-time deadline. The condition
/// resolves when the trigger fires, the deadline elapses, or an unblocked
/// signal arrives; a resumed syscall re-evaluates its preconditions from the
/// top, so spurious wakeups are legal.
#[derive(Debug)]
pub struct SyscallCondition {
    trigger: Option<Trigger>,
    timeout: Option<EmulatedTime>,
}

impl SyscallCondition {
    /// A condition that triggers when the file reaches the trigger's state.
    pub fn new(trigger: Trigger) -> Self {
        Self {
            trigger: Some(trigger),
            timeout: None,
        }
    }

    /// A condition with only an absolute wakeup time.
    pub fn new_from_wakeup_time(abs_wakeup_time: EmulatedTime) -> Self {
        Self {
            trigger: None,
            timeout: Some(abs_wakeup_time),
        }
    }

    pub fn trigger(&self) -> Option<&Trigger> {
        self.trigger.as_ref()
    }

    pub fn timeout(&self) -> Option<EmulatedTime> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<EmulatedTime>) {
        self.timeout = timeout;
    }
}
