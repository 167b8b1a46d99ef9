use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sim_support::simulation_time::SimulationTime;
use sim_support::syscall_types::SysCallArgs;
use sim_support::HostId;

use crate::core::work::event::EventKind;
use crate::core::work::task::TaskRef;
use crate::host::context::{ResumeInfo, SyscallContext};
use crate::host::descriptor::descriptor_table::DescriptorTable;
use crate::host::descriptor::listener::StateListenerFilter;
use crate::host::descriptor::{FileSignals, FileState};
use crate::host::managed::{ManagedThread, Reply, ThreadStatus};
use crate::host::memory_manager::{AddressSpace, MemoryManager};
use crate::host::syscall::condition::SyscallCondition;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{result_to_retval, SyscallError};
use crate::host::thread::{BlockedSyscall, Thread, ThreadId};
use crate::host::{Host, Wakeup};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessId(pub u32);

/// Default size of a process's emulated address space (used for syscall
/// argument marshalling, not application heap).
const ADDRESS_SPACE_SIZE: usize = 16 * 1024 * 1024;

/// How long after a stop request until the process's descriptors are
/// destroyed.
const STOP_GRACE_PERIOD: SimulationTime = SimulationTime::SECOND;

/// A managed process: its threads, descriptor table, working directory, and
/// memory.
pub struct Process {
    id: ProcessId,
    host_id: HostId,
    name: String,
    cwd: PathBuf,
    pub descriptor_table: DescriptorTable,
    pub memory: MemoryManager,
    address_space: Arc<Mutex<AddressSpace>>,
    threads: BTreeMap<ThreadId, Thread>,
    exit_code: Option<i32>,
    stopping: bool,
}

impl Process {
    pub fn new(id: ProcessId, host_id: HostId, name: String, cwd: PathBuf) -> Self {
        let address_space = Arc::new(Mutex::new(AddressSpace::new(ADDRESS_SPACE_SIZE)));

        Self {
            id,
            host_id,
            name,
            cwd,
            descriptor_table: DescriptorTable::new(),
            memory: MemoryManager::new(Arc::clone(&address_space)),
            address_space,
            threads: BTreeMap::new(),
            exit_code: None,
            stopping: false,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cwd(&self) -> &PathBuf {
        &self.cwd
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code.is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Spawn the application's main thread. The application does not run
    /// until [`start`](Self::start).
    pub fn spawn_main_thread(&mut self, app: impl FnOnce(&crate::host::managed::ProcessApi) + Send + 'static) {
        let tid = ThreadId(self.threads.len() as u32);
        let managed = ManagedThread::spawn(
            format!("{}.{}", self.name, tid.0),
            Arc::clone(&self.address_space),
            app,
        );
        self.threads.insert(tid, Thread::new(tid, managed));
    }

    /// The `start-application` event: run the main thread until it blocks or
    /// exits.
    pub fn start(&mut self, host: &Host) {
        log::debug!("Starting process '{}'", self.name);
        let tids: Vec<ThreadId> = self.threads.keys().copied().collect();
        for tid in tids {
            self.run_thread(host, tid, None);
        }
    }

    /// The `stop-application` event: SIGTERM semantics. The application is
    /// torn down now; descriptors are destroyed after a grace period.
    pub fn stop(&mut self, host: &Host) {
        if self.stopping || self.has_exited() {
            return;
        }
        self.stopping = true;

        log::debug!("Stopping process '{}'", self.name);

        for thread in self.threads.values_mut() {
            thread.kill();
        }
        self.exit_code = Some(0);

        let pid = self.id;
        let task = TaskRef::new(move |host| {
            host.cleanup_process_descriptors(pid);
        });
        host.schedule_task_with_delay(task, STOP_GRACE_PERIOD, EventKind::StopApplication);
    }

    /// Drop every descriptor, closing the underlying files.
    pub fn destroy_descriptors(&mut self) {
        crate::utility::callback_queue::CallbackQueue::queue_and_run(|cb_queue| {
            for descriptor in self.descriptor_table.remove_all() {
                let _ = descriptor.close(cb_queue);
            }
        });
    }

    /// A wakeup for a blocked syscall. Spurious and stale wakeups are legal;
    /// the syscall re-runs from the top and re-evaluates its preconditions.
    pub fn wakeup(&mut self, host: &Host, wakeup: &Wakeup) {
        let Some(thread) = self.threads.get_mut(&wakeup.tid) else {
            return;
        };

        let Some(blocked) = thread.take_blocked(wakeup.generation) else {
            // stale: the syscall was already resolved or re-armed
            return;
        };

        let args = blocked.args;

        let resumed = ResumeInfo {
            deadline: blocked.deadline,
        };
        // dropping the blocked record releases its status listener
        drop(blocked);

        log::trace!("Waking blocked syscall {} in '{}'", args.number, self.name);

        match self.dispatch_syscall(host, wakeup.tid, &args, Some(resumed)) {
            Outcome::Reply(reply) => self.run_thread(host, wakeup.tid, Some(reply)),
            Outcome::Blocked => {}
        }
    }

    /// Run the thread until its next blocking syscall or exit. `reply`
    /// answers the syscall it is currently paused in.
    fn run_thread(&mut self, host: &Host, tid: ThreadId, mut reply: Option<Reply>) {
        loop {
            if self.has_exited() {
                return;
            }

            let status = {
                let thread = self.threads.get_mut(&tid).unwrap();
                thread.managed_mut().resume(reply.take())
            };

            match status {
                ThreadStatus::Syscall(args) => {
                    match self.dispatch_syscall(host, tid, &args, None) {
                        Outcome::Reply(r) => reply = Some(r),
                        Outcome::Blocked => return,
                    }
                }
                ThreadStatus::Exited(code) => {
                    log::debug!("Process '{}' exited with code {code}", self.name);
                    self.exit_code = Some(code);
                    self.destroy_descriptors();
                    return;
                }
            }
        }
    }

    /// Run a syscall through the dispatcher; on `Blocked`, arm the condition.
    fn dispatch_syscall(
        &mut self,
        host: &Host,
        tid: ThreadId,
        args: &SysCallArgs,
        resumed: Option<ResumeInfo>,
    ) -> Outcome {
        let mut ctx = SyscallContext {
            host,
            process: self,
            tid,
            resumed,
        };

        let result = SyscallHandler::syscall(&mut ctx, args);

        match result {
            Err(SyscallError::Blocked(blocked)) => {
                self.arm_condition(host, tid, *args, blocked.condition, blocked.restartable);
                Outcome::Blocked
            }
            Err(SyscallError::Native) => Outcome::Reply(Reply::Native),
            other => Outcome::Reply(Reply::Value(result_to_retval(&other))),
        }
    }

    /// Register the wakeup paths for a blocked syscall: a status listener on
    /// the trigger file, and a scheduled task for the deadline.
    fn arm_condition(
        &mut self,
        host: &Host,
        tid: ThreadId,
        args: SysCallArgs,
        condition: SyscallCondition,
        restartable: bool,
    ) {
        let thread = self.threads.get_mut(&tid).unwrap();
        let generation = thread.generation() + 1;
        let pid = self.id;
        let wakeups = host.wakeup_queue();

        // The listener holds only a weak identity (host/process/thread ids
        // plus the generation); it is validated when the wakeup drains.
        let listener_handle = condition.trigger().map(|trigger| {
            let wakeups = Arc::clone(&wakeups);
            let filter = StateListenerFilter::OffToOn;

            trigger.file().borrow_mut().add_listener(
                // closing the file must also resolve the condition
                trigger.state() | FileState::CLOSED,
                FileSignals::READ_BUFFER_GREW,
                filter,
                move |_state, _changed, _signals, _cb_queue| {
                    wakeups.lock().unwrap().push(Wakeup {
                        pid,
                        tid,
                        generation,
                    });
                },
            )
        });

        let deadline = condition.timeout();
        if let Some(deadline) = deadline {
            let wakeups = Arc::clone(&wakeups);
            let task = TaskRef::new(move |_host| {
                wakeups.lock().unwrap().push(Wakeup {
                    pid,
                    tid,
                    generation,
                });
            });
            host.schedule_task_at(task, deadline, EventKind::Callback);
        }

        let stored = thread.set_blocked(BlockedSyscall {
            args,
            restartable,
            listener_handle,
            deadline,
        });
        debug_assert_eq!(stored, generation);
    }
}

enum Outcome {
    Reply(Reply),
    Blocked,
}
