use sim_support::emulated_time::EmulatedTime;
use sim_support::syscall_types::SysCallArgs;

use crate::host::descriptor::listener::StateListenHandle;
use crate::host::managed::ManagedThread;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThreadId(pub u32);

/// A thread of a managed process: the driver handle plus the state of any
/// syscall the thread is currently blocked in.
pub struct Thread {
    id: ThreadId,
    managed: ManagedThread,
    blocked: Option<BlockedSyscall>,
    /// Incremented whenever a blocked syscall is armed or resolved. Wakeups
    /// carry the generation they were armed for, so a stale wakeup (for a
    /// condition that was already resolved) validates as a no-op.
    generation: u64,
}

/// A syscall suspended on a condition. Dropping this releases the status
/// listener, which is how a resolved condition stops listening.
pub struct BlockedSyscall {
    pub args: SysCallArgs,
    pub restartable: bool,
    /// Keeps the trigger's status listener registered.
    pub listener_handle: Option<StateListenHandle>,
    /// The condition's absolute deadline, if it has one.
    pub deadline: Option<EmulatedTime>,
}

impl Thread {
    pub fn new(id: ThreadId, managed: ManagedThread) -> Self {
        Self {
            id,
            managed,
            blocked: None,
            generation: 0,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn managed_mut(&mut self) -> &mut ManagedThread {
        &mut self.managed
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Store the blocked syscall, returning the generation its wakeups must
    /// carry.
    pub fn set_blocked(&mut self, blocked: BlockedSyscall) -> u64 {
        assert!(self.blocked.is_none());
        self.generation += 1;
        self.blocked = Some(blocked);
        self.generation
    }

    /// Take the blocked syscall if `generation` is current, invalidating any
    /// other outstanding wakeups for it.
    pub fn take_blocked(&mut self, generation: u64) -> Option<BlockedSyscall> {
        if generation != self.generation {
            return None;
        }
        let blocked = self.blocked.take()?;
        self.generation += 1;
        Some(blocked)
    }

    pub fn kill(&mut self) {
        self.blocked = None;
        self.generation += 1;
        self.managed.kill();
    }
}
