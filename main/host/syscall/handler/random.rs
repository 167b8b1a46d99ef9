use rand::RngCore;
use sim_support::syscall_types::{ForeignPtr, SysCallArgs};

use crate::host::context::SyscallContext;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::SyscallResult;

impl SyscallHandler {
    pub fn getrandom(ctx: &mut SyscallContext, args: &SysCallArgs) -> SyscallResult {
        let buf_ptr: ForeignPtr<u8> = args.get(0).into();
        let len: usize = args.get(1).into();
        // both GRND_NONBLOCK and GRND_RANDOM are irrelevant: the host RNG
        // never blocks

        let mut bytes = vec![0u8; len];
        ctx.host.with_random_mut(|rng| rng.fill_bytes(&mut bytes));

        ctx.process.memory.write_bytes(buf_ptr, &bytes)?;

        Ok(len.into())
    }
}
