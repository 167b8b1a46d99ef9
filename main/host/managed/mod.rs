//! The managed-process driver. Each emulated application runs on its own OS
//! thread, in lockstep with the worker that owns its host: the worker resumes
//! the application, the application runs until it issues a syscall (or
//! exits), and the worker services the syscall through the dispatcher. The
//! application never runs concurrently with simulator code, which keeps the
//! simulation deterministic.
//!
//! This module is the interception boundary: everything above it deals in
//! [`SysCallArgs`] and results, and how the application's instructions are
//! actually paused and resumed stays behind this interface.

pub mod apps;

use std::cell::Cell;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};

use sim_support::syscall_types::{ForeignPtr, SysCallArgs, SyscallReg};

use crate::host::memory_manager::AddressSpace;

/// What an application thread sends to the worker.
enum Request {
    Syscall(SysCallArgs),
    Exited(i32),
}

/// What the worker sends back to an application thread.
pub enum Reply {
    /// The syscall result (negative values are `-errno`).
    Value(i64),
    /// Execute the syscall natively against the real kernel.
    Native,
    /// The process is being torn down; unwind the application.
    Kill,
}

/// The observable status of a managed thread after resuming it.
pub enum ThreadStatus {
    /// The thread issued a syscall and is paused awaiting its result.
    Syscall(SysCallArgs),
    /// The thread's application returned (or was torn down).
    Exited(i32),
}

/// Panic payload used to unwind an application thread on teardown.
struct AppKilled;

/// Install a panic hook that keeps teardown unwinds quiet. Idempotent.
pub fn install_panic_hook() {
    static INSTALL: std::sync::Once = std::sync::Once::new();
    INSTALL.call_once(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<AppKilled>().is_some() {
                // expected teardown unwind; not an error
                return;
            }
            default_hook(info);
        }));
    });
}

/// The worker-side handle to a managed application thread.
pub struct ManagedThread {
    to_app: Sender<Reply>,
    from_app: Receiver<Request>,
    handle: Option<std::thread::JoinHandle<()>>,
    exited: bool,
}

impl ManagedThread {
    /// Spawn the application on its own thread. The application does not run
    /// until the first [`resume`](Self::resume).
    pub fn spawn(
        name: String,
        space: Arc<Mutex<AddressSpace>>,
        app: impl FnOnce(&ProcessApi) + Send + 'static,
    ) -> Self {
        let (req_tx, req_rx) = mpsc::channel::<Request>();
        let (rep_tx, rep_rx) = mpsc::channel::<Reply>();

        let handle = std::thread::Builder::new()
            .name(format!("managed-{name}"))
            .spawn(move || {
                let api = ProcessApi {
                    req: req_tx,
                    rep: rep_rx,
                    space,
                    killed: Cell::new(false),
                };

                // wait for the initial resume before running any app code
                match api.rep.recv() {
                    Ok(Reply::Value(_)) => {}
                    _ => return,
                }

                let api_ref = &api;
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
                    app(api_ref);
                }));

                match result {
                    Ok(()) => {
                        let _ = api.req.send(Request::Exited(0));
                    }
                    Err(payload) if payload.downcast_ref::<AppKilled>().is_some() => {
                        // torn down by the simulator; nothing to report
                    }
                    Err(payload) => {
                        // an application bug; report a failed exit and rethrow
                        let _ = api.req.send(Request::Exited(101));
                        std::panic::resume_unwind(payload);
                    }
                }
            })
            .unwrap();

        Self {
            to_app: rep_tx,
            from_app: req_rx,
            handle: Some(handle),
            exited: false,
        }
    }

    /// Hand control to the application until it issues a syscall or exits.
    /// `reply` answers the syscall the thread is currently paused in, and
    /// must be `None` only for the first resume.
    pub fn resume(&mut self, reply: Option<Reply>) -> ThreadStatus {
        assert!(!self.exited);

        let message = reply.unwrap_or(Reply::Value(0));
        if self.to_app.send(message).is_err() {
            self.exited = true;
            return ThreadStatus::Exited(101);
        }

        match self.from_app.recv() {
            Ok(Request::Syscall(args)) => ThreadStatus::Syscall(args),
            Ok(Request::Exited(code)) => {
                self.exited = true;
                ThreadStatus::Exited(code)
            }
            Err(_) => {
                self.exited = true;
                ThreadStatus::Exited(101)
            }
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exited
    }

    /// Tear the application down. If it is paused in a syscall it unwinds
    /// there; the thread is joined.
    pub fn kill(&mut self) {
        if !self.exited {
            // answer any in-flight syscall with a kill; the app may also be
            // waiting for its first resume
            let _ = self.to_app.send(Reply::Kill);
            self.exited = true;
        }

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ManagedThread {
    fn drop(&mut self) {
        self.kill();
    }
}

/// The application-side interface: issue syscalls and manage buffers in the
/// process's emulated address space.
pub struct ProcessApi {
    req: Sender<Request>,
    rep: Receiver<Reply>,
    space: Arc<Mutex<AddressSpace>>,
    killed: Cell<bool>,
}

impl ProcessApi {
    /// Issue a syscall and wait (in real time; virtual time is the
    /// simulator's concern) for its result.
    pub fn syscall(&self, number: i64, args: [SyscallReg; 6]) -> i64 {
        if self.killed.get() {
            std::panic::panic_any(AppKilled);
        }

        if self
            .req
            .send(Request::Syscall(SysCallArgs { number, args }))
            .is_err()
        {
            self.killed.set(true);
            std::panic::panic_any(AppKilled);
        }

        match self.rep.recv() {
            Ok(Reply::Value(value)) => value,
            Ok(Reply::Native) => {
                // SAFETY: native execution is only directed for syscalls
                // whose arguments are valid as-is in this process
                unsafe {
                    libc::syscall(
                        number,
                        args[0].as_u64(),
                        args[1].as_u64(),
                        args[2].as_u64(),
                        args[3].as_u64(),
                        args[4].as_u64(),
                        args[5].as_u64(),
                    ) as i64
                }
            }
            Ok(Reply::Kill) | Err(_) => {
                self.killed.set(true);
                std::panic::panic_any(AppKilled);
            }
        }
    }

    /// Allocate a buffer in the emulated address space.
    pub fn malloc(&self, len: usize) -> ForeignPtr<u8> {
        self.space.lock().unwrap().alloc(len)
    }

    /// Allocate a buffer and fill it with `bytes`.
    pub fn malloc_and_write(&self, bytes: &[u8]) -> ForeignPtr<u8> {
        let ptr = self.malloc(bytes.len());
        self.write_mem(ptr, bytes);
        ptr
    }

    pub fn write_mem(&self, ptr: ForeignPtr<u8>, bytes: &[u8]) {
        let mut space = self.space.lock().unwrap();
        space
            .write(usize::from(ptr), bytes)
            .expect("application wrote outside its address space");
    }

    pub fn read_mem(&self, ptr: ForeignPtr<u8>, len: usize) -> Vec<u8> {
        let space = self.space.lock().unwrap();
        space
            .read(usize::from(ptr), len)
            .expect("application read outside its address space")
    }
}
