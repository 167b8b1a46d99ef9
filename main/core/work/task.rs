use std::sync::Arc;

use crate::host::Host;

/// A cloneable reference to a callback that runs against a host. Tasks are
/// the payload of scheduled events; everything that happens in the simulation
/// (packet deliveries, timer expirations, process starts) is ultimately a
/// task execution.
///
/// Tasks take a shared host reference; all host state is interior-mutable,
/// which is what lets the worker keep the active host visible through
/// [`Worker::with_active_host`](crate::core::worker::Worker::with_active_host)
/// while a task runs.
#[derive(Clone)]
pub struct TaskRef {
    inner: Arc<dyn Fn(&Host) + Send + Sync>,
}

impl TaskRef {
    pub fn new(f: impl Fn(&Host) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub fn execute(&self, host: &Host) {
        (self.inner)(host)
    }
}

impl std::fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskRef({:p})", Arc::as_ptr(&self.inner))
    }
}

impl PartialEq for TaskRef {
    /// Tasks are equal iff they reference the same callback object.
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.inner), Arc::as_ptr(&other.inner))
    }
}

impl Eq for TaskRef {}
