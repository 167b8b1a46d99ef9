use sim_support::emulated_time::EmulatedTime;

use crate::host::process::Process;
use crate::host::thread::ThreadId;
use crate::host::Host;

/// Everything a syscall handler may touch, passed explicitly down the call
/// chain rather than through globals: the host that owns the calling
/// process, the process itself, and the calling thread.
pub struct SyscallContext<'a> {
    pub host: &'a Host,
    pub process: &'a mut Process,
    pub tid: ThreadId,
    /// Set when the syscall is re-running after a blocking condition
    /// resolved. Handlers with relative timeouts consult the armed deadline
    /// rather than re-arming from scratch.
    pub resumed: Option<ResumeInfo>,
}

/// Details of the condition a resumed syscall was blocked on.
#[derive(Copy, Clone, Debug)]
pub struct ResumeInfo {
    pub deadline: Option<EmulatedTime>,
}

impl ResumeInfo {
    /// True if the condition's deadline has been reached.
    pub fn deadline_elapsed(&self, now: EmulatedTime) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}
