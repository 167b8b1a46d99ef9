//! A round-oriented thread pool. The pool runs a single task on every thread
//! simultaneously and blocks the caller until all threads have finished,
//! which is the only synchronization pattern the scheduler needs.

use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use crossbeam::sync::WaitGroup;

type Task = Arc<dyn Fn(usize) + Send + Sync + 'static>;

enum Message {
    Run { task: Task, done: WaitGroup },
    Shutdown,
}

pub(crate) struct WorkerPool {
    senders: Vec<Sender<Message>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(num_threads: usize, name: &str) -> Self {
        assert!(num_threads > 0);

        let mut senders = Vec::with_capacity(num_threads);
        let mut threads = Vec::with_capacity(num_threads);

        for thread_idx in 0..num_threads {
            let (tx, rx) = channel::unbounded::<Message>();

            let handle = std::thread::Builder::new()
                .name(format!("{name}-{thread_idx}"))
                .spawn(move || {
                    loop {
                        match rx.recv() {
                            Ok(Message::Run { task, done }) => {
                                (task)(thread_idx);
                                // signal completion only after the task ran
                                drop(task);
                                drop(done);
                            }
                            // the pool was shut down or dropped
                            Ok(Message::Shutdown) | Err(_) => break,
                        }
                    }
                })
                .unwrap();

            senders.push(tx);
            threads.push(handle);
        }

        Self { senders, threads }
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// Create a scope in which a single round task can be run. The runner's
    /// [`run`](TaskRunner::run) blocks until every thread has finished the
    /// task, which is what allows the task to borrow from the caller's stack.
    pub fn scope<'scope>(&'scope self, f: impl FnOnce(TaskRunner<'scope, 'scope>) + 'scope) {
        let runner = TaskRunner {
            pool: self,
            _scope: PhantomData,
        };

        f(runner);
    }

    /// Shut down and join all threads. Panics if a worker thread panicked.
    pub fn join(&mut self) {
        for tx in &self.senders {
            // a send may fail if the thread already panicked
            let _ = tx.send(Message::Shutdown);
        }

        for handle in self.threads.drain(..) {
            handle.join().expect("worker thread panicked");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // dropping the senders unblocks the threads; don't force a join here
        // since a panicking worker would turn a panic into an abort
    }
}

/// Runs a single task on every thread in the pool.
pub(crate) struct TaskRunner<'pool, 'scope> {
    pool: &'pool WorkerPool,
    _scope: PhantomData<&'scope ()>,
}

impl<'pool, 'scope> TaskRunner<'pool, 'scope> {
    /// Run `f` on every thread, passing the thread's index. Blocks until all
    /// threads have completed the task.
    pub fn run(self, f: impl Fn(usize) + Send + Sync + 'scope) {
        let f: Box<dyn Fn(usize) + Send + Sync + 'scope> = Box::new(f);

        // SAFETY: `run` blocks on the wait group below until every thread has
        // finished executing (and dropped) the task, so the closure and its
        // borrows cannot outlive 'scope.
        let f: Box<dyn Fn(usize) + Send + Sync + 'static> = unsafe { std::mem::transmute(f) };
        let task: Task = Arc::from(f);

        let done = WaitGroup::new();

        for tx in &self.pool.senders {
            tx.send(Message::Run {
                task: Arc::clone(&task),
                done: done.clone(),
            })
            .unwrap();
        }

        done.wait();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_rounds() {
        let mut pool = WorkerPool::new(4, "test");
        let counter = AtomicUsize::new(0);

        for _ in 0..10 {
            pool.scope(|s| {
                s.run(|_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            });
        }

        assert_eq!(counter.load(Ordering::SeqCst), 4 * 10);
        pool.join();
    }

    #[test]
    fn test_thread_indices() {
        let mut pool = WorkerPool::new(3, "test");
        let seen = [const { AtomicUsize::new(0) }; 3];

        pool.scope(|s| {
            s.run(|idx| {
                seen[idx].fetch_add(1, Ordering::SeqCst);
            });
        });

        for slot in &seen {
            assert_eq!(slot.load(Ordering::SeqCst), 1);
        }
        pool.join();
    }
}
