//! Types used in emulating syscalls.

use nix::errno::Errno;
use sim_support::emulated_time::EmulatedTime;
use sim_support::syscall_types::SyscallReg;

use crate::host::descriptor::{File, FileState};
use crate::host::syscall::condition::SyscallCondition;
use crate::host::syscall::Trigger;

// Calling all of these errors is stretching the semantics of 'error' a bit,
// but it makes for fluent programming in syscall handlers using the `?`
// operator.
#[derive(Debug)]
pub enum SyscallError {
    /// Done, with a failure to report to the process.
    Failed(Failed),
    /// Suspend the calling thread until the condition resolves.
    Blocked(Blocked),
    /// Direct the process to make the syscall natively.
    Native,
}

#[derive(Debug)]
pub struct Blocked {
    pub condition: SyscallCondition,
    /// True if the syscall is restartable in the case that it was interrupted
    /// by a signal. e.g. if the syscall was a `read` operation on a socket
    /// without a configured timeout. See socket(7).
    pub restartable: bool,
}

#[derive(Debug)]
pub struct Failed {
    pub errno: Errno,
    pub restartable: bool,
}

pub type SyscallResult = Result<SyscallReg, SyscallError>;

impl From<Errno> for SyscallError {
    fn from(e: Errno) -> Self {
        SyscallError::Failed(Failed {
            errno: e,
            restartable: false,
        })
    }
}

impl From<std::io::Error> for SyscallError {
    fn from(e: std::io::Error) -> Self {
        match std::io::Error::raw_os_error(&e) {
            Some(e) => SyscallError::Failed(Failed {
                errno: Errno::from_i32(e),
                restartable: false,
            }),
            None => {
                let default = Errno::ENOTSUP;
                log::warn!("Mapping error {} to {}", e, default);
                SyscallError::from(default)
            }
        }
    }
}

impl SyscallError {
    pub fn new_blocked_on_file(file: File, state: FileState, restartable: bool) -> Self {
        Self::Blocked(Blocked {
            condition: SyscallCondition::new(Trigger::from_file(file, state)),
            restartable,
        })
    }

    pub fn new_blocked_until(unblock_time: EmulatedTime, restartable: bool) -> Self {
        Self::Blocked(Blocked {
            condition: SyscallCondition::new_from_wakeup_time(unblock_time),
            restartable,
        })
    }

    pub fn new_interrupted(restartable: bool) -> Self {
        Self::Failed(Failed {
            errno: Errno::EINTR,
            restartable,
        })
    }

    /// Returns the [condition](SyscallCondition) that the syscall is blocked
    /// on, if any.
    pub fn blocked_condition(&mut self) -> Option<&mut SyscallCondition> {
        if let Self::Blocked(Blocked { condition, .. }) = self {
            Some(condition)
        } else {
            None
        }
    }
}

/// Convert a syscall result into the raw register value returned to the
/// process, with errors as `-errno`. `Blocked` and `Native` have no register
/// representation and must be handled by the caller beforehand.
pub fn result_to_retval(result: &SyscallResult) -> i64 {
    match result {
        Ok(reg) => (*reg).into(),
        Err(SyscallError::Failed(failed)) => -(failed.errno as i32 as i64),
        Err(SyscallError::Blocked(_)) => panic!("Blocked results have no register value"),
        Err(SyscallError::Native) => panic!("Native results have no register value"),
    }
}
