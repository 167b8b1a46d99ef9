//! Scheduler for discrete-event network simulations.
//!
//! Each host has a queue of events it must process, and within a scheduling
//! round a host can process its events independently of all other hosts, so
//! hosts can run in parallel. The scheduler owns a pool of worker threads,
//! partitions the hosts across them, and runs a single closure on every
//! thread simultaneously until all hosts have been processed for the round.
//!
//! A typical thread pool that creates a new task per host is too slow for a
//! simulator that runs millions of short rounds, so the pool here is
//! optimized for running the same task across all threads with one barrier
//! per round. The scheduler uses a "[scoped threads][std::thread::scope]"
//! design so the calling code can share stack data with the round task
//! without locking or `unsafe`.
//!
//! ```
//! # use scheduler::ThreadPerHostSched;
//! # use std::cell::RefCell;
//! # use std::sync::atomic::{AtomicU32, Ordering};
//! # #[derive(Debug)]
//! # struct Host(u16);
//! # impl Host {
//! #     pub fn id(&self) -> u16 { self.0 }
//! #     pub fn run_events(&mut self) {}
//! # }
//! # std::thread_local! {
//! #     static HOSTS: RefCell<Vec<Host>> = const { RefCell::new(Vec::new()) };
//! # }
//! let hosts = vec![Host(0), Host(1), Host(2)];
//! let mut sched = ThreadPerHostSched::new(&HOSTS, hosts, 2);
//!
//! let counter = AtomicU32::new(0);
//!
//! sched.scope(|s| {
//!     s.run_with_hosts(|thread_idx, hosts| {
//!         hosts.for_each(|mut host| {
//!             host.run_events();
//!             counter.fetch_add(1, Ordering::Relaxed);
//!             host
//!         });
//!     });
//! });
//!
//! assert_eq!(counter.load(Ordering::Relaxed), 3);
//! sched.join();
//! ```

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

mod pool;

use std::cell::RefCell;
use std::fmt::Debug;
use std::sync::Mutex;
use std::thread::LocalKey;

use crate::pool::{TaskRunner, WorkerPool};

/// The trait bounds hosts must satisfy to be scheduled.
pub trait Host: Debug + Send + 'static {}
impl<T> Host for T where T: Debug + Send + 'static {}

/// A host scheduler. Hosts are partitioned across a fixed set of worker
/// threads; each thread owns its hosts for the lifetime of the scheduler and
/// stores them in thread-local storage between rounds.
pub struct ThreadPerHostSched<HostType: Host> {
    /// The thread pool.
    pool: WorkerPool,
    /// Thread-local storage where each thread parks its hosts between rounds.
    host_storage: &'static LocalKey<RefCell<Vec<HostType>>>,
}

impl<HostType: Host> ThreadPerHostSched<HostType> {
    /// A new scheduler over `num_threads` worker threads. Hosts are assigned
    /// to threads round-robin in their given order, which keeps the
    /// partitioning deterministic.
    ///
    /// An empty `host_storage` is required for each thread to have efficient
    /// access to its hosts. A panic may occur if `host_storage` is not empty,
    /// or if it is borrowed while the scheduler is in use.
    pub fn new(
        host_storage: &'static LocalKey<RefCell<Vec<HostType>>>,
        hosts: Vec<HostType>,
        num_threads: usize,
    ) -> Self {
        let num_threads = num_threads.clamp(1, hosts.len().max(1));
        let pool = WorkerPool::new(num_threads, "sim-worker");

        // for determinism, threads take hosts from fixed per-thread slots
        // rather than a shared queue
        let mut partitions: Vec<Vec<HostType>> = (0..num_threads).map(|_| Vec::new()).collect();
        for (i, host) in hosts.into_iter().enumerate() {
            partitions[i % num_threads].push(host);
        }
        let partitions: Vec<Mutex<Vec<HostType>>> = partitions.into_iter().map(Mutex::new).collect();

        // have each thread take its partition and store it as a thread-local
        pool.scope(|s| {
            s.run(|thread_idx| {
                host_storage.with(|x| {
                    assert!(x.borrow().is_empty());
                    *x.borrow_mut() = std::mem::take(&mut *partitions[thread_idx].lock().unwrap());
                });
            });
        });

        Self { pool, host_storage }
    }

    /// The number of threads that will run in parallel.
    pub fn parallelism(&self) -> usize {
        self.pool.num_threads()
    }

    /// Create a scope for a task run on the scheduler. The current thread
    /// blocks at the end of the scope until the task has completed.
    pub fn scope<'scope>(
        &'scope mut self,
        f: impl for<'a> FnOnce(SchedulerScope<'a, 'scope, HostType>) + 'scope,
    ) {
        let host_storage = self.host_storage;
        self.pool.scope(move |s| {
            let sched_scope = SchedulerScope {
                runner: s,
                host_storage,
            };

            (f)(sched_scope);
        });
    }

    /// Join all threads started by the scheduler, returning the hosts.
    pub fn join(mut self) -> Vec<HostType> {
        let collected: Vec<Mutex<Vec<HostType>>> = (0..self.pool.num_threads())
            .map(|_| Mutex::new(Vec::new()))
            .collect();

        // collect all of the hosts from the threads
        self.pool.scope(|s| {
            s.run(|thread_idx| {
                self.host_storage.with(|x| {
                    *collected[thread_idx].lock().unwrap() = std::mem::take(&mut *x.borrow_mut());
                });
            });
        });

        self.pool.join();

        collected
            .into_iter()
            .flat_map(|x| x.into_inner().unwrap())
            .collect()
    }
}

/// A scope for a task run on the scheduler.
pub struct SchedulerScope<'pool, 'scope, HostType: Host> {
    /// The work pool's scoped runner.
    runner: TaskRunner<'pool, 'scope>,
    /// Thread-local storage where a thread can retrieve its hosts.
    host_storage: &'static LocalKey<RefCell<Vec<HostType>>>,
}

impl<'pool, 'scope, HostType: Host> SchedulerScope<'pool, 'scope, HostType> {
    /// Run the closure on all threads. The closure is given the index of the
    /// currently running thread.
    pub fn run(self, f: impl Fn(usize) + Sync + Send + 'scope) {
        self.runner.run(f);
    }

    /// Run the closure on all threads. The closure is given the index of the
    /// currently running thread and an iterator over this thread's hosts.
    ///
    /// The closure must iterate the provided [`HostIter`] to completion.
    pub fn run_with_hosts(self, f: impl Fn(usize, &mut HostIter<HostType>) + Send + Sync + 'scope) {
        let host_storage = self.host_storage;
        self.runner.run(move |thread_idx| {
            host_storage.with(|hosts| {
                let mut hosts = hosts.borrow_mut();
                let mut iter = HostIter {
                    hosts: std::mem::take(&mut *hosts),
                };

                f(thread_idx, &mut iter);

                *hosts = std::mem::take(&mut iter.hosts);
            });
        });
    }
}

/// Iterates over all hosts assigned to this thread.
pub struct HostIter<HostType: Host> {
    hosts: Vec<HostType>,
}

impl<HostType: Host> HostIter<HostType> {
    /// For each host, calls `f` with the host. The host must be returned by
    /// the closure. Ownership is transferred in and out of the closure rather
    /// than borrowed since the worker needs to put the host in a global with
    /// `'static` lifetime.
    pub fn for_each<F>(&mut self, mut f: F)
    where
        F: FnMut(HostType) -> HostType,
    {
        let hosts = std::mem::take(&mut self.hosts);
        self.hosts.reserve_exact(hosts.len());
        for host in hosts {
            let host = f(host);
            self.hosts.push(host);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug)]
    struct TestHost {
        id: u32,
    }

    std::thread_local! {
        static SCHED_HOST_STORAGE: RefCell<Vec<TestHost>> = const { RefCell::new(Vec::new()) };
    }

    fn make_hosts(n: u32) -> Vec<TestHost> {
        (0..n).map(|id| TestHost { id }).collect()
    }

    #[test]
    fn test_parallelism() {
        let sched = ThreadPerHostSched::new(&SCHED_HOST_STORAGE, make_hosts(5), 2);
        assert_eq!(sched.parallelism(), 2);
        sched.join();
    }

    #[test]
    fn test_run() {
        let mut sched = ThreadPerHostSched::new(&SCHED_HOST_STORAGE, make_hosts(5), 2);

        let counter = AtomicU32::new(0);

        for _ in 0..3 {
            sched.scope(|s| {
                s.run(|_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            });
        }

        // `run` executes once per thread per round
        assert_eq!(counter.load(Ordering::SeqCst), 2 * 3);

        sched.join();
    }

    #[test]
    fn test_run_with_hosts() {
        let mut sched = ThreadPerHostSched::new(&SCHED_HOST_STORAGE, make_hosts(5), 2);

        let counter = AtomicU32::new(0);

        for _ in 0..3 {
            sched.scope(|s| {
                s.run_with_hosts(|_, hosts| {
                    hosts.for_each(|host| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        host
                    });
                });
            });
        }

        assert_eq!(counter.load(Ordering::SeqCst), 5 * 3);

        let hosts = sched.join();
        let mut ids: Vec<_> = hosts.iter().map(|x| x.id).collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_share_stack_data() {
        let mut sched = ThreadPerHostSched::new(&SCHED_HOST_STORAGE, make_hosts(4), 4);

        // owned by this stack frame, accessed from the worker threads
        let sum = AtomicU32::new(0);

        sched.scope(|s| {
            s.run_with_hosts(|_, hosts| {
                hosts.for_each(|host| {
                    sum.fetch_add(host.id, Ordering::SeqCst);
                    host
                });
            });
        });

        assert_eq!(sum.load(Ordering::SeqCst), 0 + 1 + 2 + 3);

        sched.join();
    }
}
