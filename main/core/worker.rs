use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use sim_support::emulated_time::EmulatedTime;
use sim_support::simulation_time::SimulationTime;
use sim_support::HostId;

use crate::core::runahead::Runahead;
use crate::core::work::event::{Event, EventKind};
use crate::core::work::event_queue::ThreadSafeEventQueue;
use crate::core::work::task::TaskRef;
use crate::host::Host;
use crate::network::dns::Dns;
use crate::network::graph::{IpAssignment, RoutingInfo};
use crate::network::packet::{PacketRc, PacketStatus};

// thread-local worker state, initialized when the worker thread starts
std::thread_local! {
    static WORKER: once_cell::unsync::OnceCell<Worker> = const { once_cell::unsync::OnceCell::new() };

    // The host currently executing events on this thread, if any. Stored as
    // a raw pointer; the `ActiveHostGuard` scopes its validity.
    static ACTIVE_HOST: Cell<Option<*const Host>> = const { Cell::new(None) };
}

/// Keeps the active-host pointer valid for as long as the guard lives.
pub struct ActiveHostGuard {
    prev: Option<*const Host>,
}

impl Drop for ActiveHostGuard {
    fn drop(&mut self) {
        ACTIVE_HOST.with(|c| c.set(self.prev));
    }
}

#[derive(Copy, Clone, Debug)]
pub struct WorkerThreadID(pub u32);

struct Clock {
    now: Option<EmulatedTime>,
    barrier: Option<EmulatedTime>,
}

/// State shared (read-mostly) by all workers: the topology-derived routing
/// tables, the address book, and the per-host event-queue mailboxes that are
/// the single inter-host synchronization point.
pub struct WorkerShared {
    pub ip_assignment: IpAssignment,
    pub routing: RoutingInfo,
    pub dns: Dns,
    pub runahead: Runahead,
    pub sim_end_time: EmulatedTime,
    /// Event queue of every host, keyed by host id. Used for cross-host
    /// packet pushes.
    pub event_queues: HashMap<HostId, Arc<ThreadSafeEventQueue>>,
    /// Root RNG seed of every host; packet delivery draws are derived from
    /// the destination host's seed.
    pub host_seeds: HashMap<HostId, u64>,
    /// The simulator-owned hosts file that replaces `/etc/hosts`.
    pub hosts_file_path: PathBuf,
}

/// Worker context, containing "global" information for the current thread.
pub struct Worker {
    worker_id: WorkerThreadID,
    shared: Arc<WorkerShared>,
    clock: RefCell<Clock>,
    // a saved copy of this worker's lowest seen latency, so the shared
    // runahead lock is rarely touched
    min_latency_cache: Cell<Option<SimulationTime>>,
}

impl Worker {
    /// Create the worker for this thread.
    pub fn new_for_this_thread(worker_id: WorkerThreadID, shared: Arc<WorkerShared>) {
        WORKER.with(|worker| {
            let res = worker.set(Self {
                worker_id,
                shared,
                clock: RefCell::new(Clock {
                    now: None,
                    barrier: None,
                }),
                min_latency_cache: Cell::new(None),
            });
            assert!(res.is_ok(), "Worker already initialized");
        });
    }

    // Runs `f` with a shared reference to the current thread's Worker.
    // Returns None if this thread has no Worker object.
    #[must_use]
    fn with<F, O>(f: F) -> Option<O>
    where
        F: FnOnce(&Worker) -> O,
    {
        WORKER.try_with(|w| w.get().map(f)).ok().flatten()
    }

    /// Whether currently running on a live Worker.
    pub fn is_alive() -> bool {
        Worker::with(|_| ()).is_some()
    }

    /// Mark `host` as the host executing on this thread. The returned guard
    /// must not outlive `host`; events and their callbacks run strictly
    /// within its scope.
    pub fn enter_host(host: &Host) -> ActiveHostGuard {
        let prev = ACTIVE_HOST.with(|c| c.replace(Some(host as *const Host)));
        ActiveHostGuard { prev }
    }

    /// Run `f` with a reference to the host currently executing on this
    /// thread, or return None if there is no active host.
    #[must_use]
    pub fn with_active_host<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&Host) -> R,
    {
        let ptr = ACTIVE_HOST.with(|c| c.get())?;
        // SAFETY: the pointer was stored by `enter_host` whose guard is still
        // alive (it restores the previous value on drop), so the reference is
        // valid; hosts are only executed by their owning worker thread.
        let host = unsafe { &*ptr };
        Some(f(host))
    }

    pub fn thread_id() -> Option<WorkerThreadID> {
        Worker::with(|w| w.worker_id)
    }

    pub fn set_round_end_time(t: EmulatedTime) {
        Worker::with(|w| w.clock.borrow_mut().barrier.replace(t)).unwrap();
    }

    fn round_end_time() -> Option<EmulatedTime> {
        Worker::with(|w| w.clock.borrow().barrier).flatten()
    }

    pub fn set_current_time(t: EmulatedTime) {
        Worker::with(|w| w.clock.borrow_mut().now.replace(t)).unwrap();
    }

    pub fn clear_current_time() {
        Worker::with(|w| w.clock.borrow_mut().now.take()).unwrap();
    }

    pub fn current_time() -> Option<EmulatedTime> {
        Worker::with(|w| w.clock.borrow().now).flatten()
    }

    /// Run `f` against the shared worker state.
    #[must_use]
    pub fn with_shared<F, O>(f: F) -> Option<O>
    where
        F: FnOnce(&WorkerShared) -> O,
    {
        Worker::with(|w| f(&w.shared))
    }

    pub fn update_lowest_used_latency(t: SimulationTime) {
        assert!(t != SimulationTime::ZERO);

        Worker::with(|w| {
            let cached = w.min_latency_cache.get();
            if cached.is_none() || t < cached.unwrap() {
                w.min_latency_cache.set(Some(t));
                w.shared.runahead.update_lowest_used_latency(t);
            }
        })
        .unwrap();
    }

    /// Send a packet from the source host into the simulated internet: decide
    /// delivery with the edge's reliability, draw a latency sample, and
    /// schedule the arrival (or drop) event on the destination host's queue.
    pub fn send_packet(src_host: &Host, packet: PacketRc) {
        let current_time = Worker::current_time().unwrap();
        let round_end_time = Worker::round_end_time().unwrap();

        let is_completed =
            current_time >= Worker::with(|w| w.shared.sim_end_time).unwrap();
        if is_completed {
            // the simulation is over, don't bother
            return;
        }

        let src_ip = *packet.src_address().ip();
        let dst_ip = *packet.dst_address().ip();

        let Some(dst_host_id) = Worker::with(|w| w.shared.ip_assignment.host_for_ip(dst_ip)).unwrap()
        else {
            log::warn!("No host at {dst_ip}; dropping packet from {src_ip}");
            packet.add_status(PacketStatus::SND_INET_DROPPED);
            return;
        };

        let src_node = Worker::with(|w| w.shared.ip_assignment.node_for_host(src_host.id()))
            .unwrap()
            .unwrap();
        let dst_node = Worker::with(|w| w.shared.ip_assignment.node_for_host(dst_host_id))
            .unwrap()
            .unwrap();

        // Delivery draws must be deterministic per packet and attributable to
        // the destination host, but the destination's RNG can't be touched
        // from this thread. Derive a one-shot stream from the destination
        // host's seed and the packet's source identity instead.
        let dst_seed = Worker::with(|w| w.shared.host_seeds[&dst_host_id]).unwrap();
        let packet_id = src_host.get_new_packet_id();
        let mix = dst_seed
            ^ (u64::from(u32::from(src_host.id())) << 32)
            ^ packet_id.wrapping_mul(0x9e3779b97f4a7c15);
        let mut rng = ChaCha12Rng::seed_from_u64(mix);

        let (reliability, latency) = Worker::with(|w| {
            (
                w.shared.routing.reliability(src_node, dst_node),
                w.shared.routing.sample_latency(src_node, dst_node, &mut rng),
            )
        })
        .unwrap();

        let deliver_time = current_time + latency;
        Worker::update_lowest_used_latency(latency);

        // don't drop control packets with length 0, otherwise congestion
        // control has problems responding to packet loss
        let chance: f64 = rng.gen();
        let dropped = chance >= reliability && packet.payload_size() > 0;

        let (kind, task) = if dropped {
            packet.add_status(PacketStatus::SND_INET_DROPPED);
            let task = TaskRef::new(move |_host| {
                packet.add_status(PacketStatus::DESTROYED);
            });
            (EventKind::PacketDropped, task)
        } else {
            packet.add_status(PacketStatus::SND_INET_SENT);
            let packet = crossbeam::atomic::AtomicCell::new(Some(packet));
            let task = TaskRef::new(move |host| {
                let packet = packet.take().expect("Packet task ran twice");
                host.receive_packet_from_internet(packet);
            });
            (EventKind::PacketArrived, task)
        };

        let mut event = Event::new(kind, task, deliver_time, src_host, dst_host_id);

        // A packet sent near the end of a round could nominally arrive inside
        // it; delay such packets to the round barrier so the destination
        // never observes an event in its past.
        if event.time() < round_end_time {
            event.set_time(round_end_time);
        }

        Worker::with(|w| w.shared.event_queues[&dst_host_id].push(event)).unwrap();
    }
}
