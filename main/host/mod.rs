//! A simulated host: its clock-ordered event queue, network stack, processes,
//! and deterministic RNG.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use sim_support::emulated_time::EmulatedTime;
use sim_support::simulation_time::SimulationTime;
use sim_support::HostId;

use crate::core::work::event::{Event, EventKind};
use crate::core::work::event_queue::ThreadSafeEventQueue;
use crate::core::work::task::TaskRef;
use crate::core::worker::Worker;
use crate::host::network::interface::{FifoPacketPriority, NetworkInterface};
use crate::host::network::namespace::NetworkNamespace;
use crate::host::process::{Process, ProcessId};
use crate::host::thread::ThreadId;
use crate::network::packet::PacketRc;
use crate::network::relay::{RateLimit, Relay, RelaySource};
use crate::network::router::Router;
use crate::network::PacketDevice;

pub mod context;
pub mod descriptor;
pub mod managed;
pub mod memory_manager;
pub mod network;
pub mod process;
pub mod syscall;
pub mod thread;
pub mod timer;

/// Parameters a host is created from.
#[derive(Clone, Debug)]
pub struct HostParams {
    pub id: HostId,
    pub name: String,
    pub ip: Ipv4Addr,
    pub seed: u64,
    pub bandwidth_down_kbps: u64,
    pub bandwidth_up_kbps: u64,
    pub send_buf_size: usize,
    pub recv_buf_size: usize,
    pub tcp_config: tcp::TcpConfig,
    pub data_dir: PathBuf,
    /// Record `(time, kind)` of every executed event; used by determinism
    /// checks in tests, off in normal runs.
    pub record_event_trace: bool,
}

/// A queued wakeup for a blocked syscall. Carries only a weak identity; the
/// generation is validated against the thread when the wakeup drains.
#[derive(Copy, Clone, Debug)]
pub struct Wakeup {
    pub pid: ProcessId,
    pub tid: ThreadId,
    pub generation: u64,
}

pub struct Host {
    params: HostParams,

    /// This host's event queue. Also the mailbox other hosts push packet
    /// arrival events into, so it lives behind a lock shared via `Arc`.
    event_queue: Arc<ThreadSafeEventQueue>,

    /// The time of the last popped event; never decreases.
    local_now: Cell<EmulatedTime>,
    event_id_counter: Cell<u64>,
    packet_id_counter: Cell<u64>,
    packet_priority_counter: Cell<u64>,

    random: RefCell<Xoshiro256PlusPlus>,

    net_ns: NetworkNamespace,
    router: RefCell<Router>,
    relay_loopback: Arc<Relay>,
    relay_uplink: Arc<Relay>,
    relay_downlink: Arc<Relay>,

    processes: RefCell<BTreeMap<ProcessId, Arc<Mutex<Process>>>>,
    process_id_counter: Cell<u32>,

    /// Blocked syscalls whose conditions resolved during the current event;
    /// drained after each event execution.
    wakeups: Arc<Mutex<Vec<Wakeup>>>,

    event_trace: RefCell<Vec<(EmulatedTime, EventKind)>>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.params.id)
            .field("name", &self.params.name)
            .field("ip", &self.params.ip)
            .finish_non_exhaustive()
    }
}

impl Host {
    pub fn new(params: HostParams) -> Self {
        let net_ns = NetworkNamespace::new(params.ip);

        // loopback traffic is never rate limited; the uplink and downlink
        // enforce the host's configured bandwidth
        let relay_loopback = Arc::new(Relay::new(
            RateLimit::Unlimited,
            RelaySource::Device(Ipv4Addr::LOCALHOST),
        ));
        let relay_uplink = Arc::new(Relay::new(
            RateLimit::BytesPerSecond(params.bandwidth_up_kbps * 1000 / 8),
            RelaySource::Device(params.ip),
        ));
        let relay_downlink = Arc::new(Relay::new(
            RateLimit::BytesPerSecond(params.bandwidth_down_kbps * 1000 / 8),
            RelaySource::Router,
        ));

        let random = Xoshiro256PlusPlus::seed_from_u64(params.seed);

        Self {
            event_queue: Arc::new(ThreadSafeEventQueue::new()),
            local_now: Cell::new(EmulatedTime::SIMULATION_START),
            event_id_counter: Cell::new(0),
            packet_id_counter: Cell::new(0),
            packet_priority_counter: Cell::new(0),
            random: RefCell::new(random),
            net_ns,
            router: RefCell::new(Router::new()),
            relay_loopback,
            relay_uplink,
            relay_downlink,
            processes: RefCell::new(BTreeMap::new()),
            process_id_counter: Cell::new(1000),
            wakeups: Arc::new(Mutex::new(Vec::new())),
            event_trace: RefCell::new(Vec::new()),
            params,
        }
    }

    pub fn id(&self) -> HostId {
        self.params.id
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn default_ip(&self) -> Ipv4Addr {
        self.params.ip
    }

    pub fn params(&self) -> &HostParams {
        &self.params
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.params.data_dir
    }

    pub fn net_ns(&self) -> &NetworkNamespace {
        &self.net_ns
    }

    /// Run `f` with this host's deterministic RNG.
    pub fn with_random_mut<R>(&self, f: impl FnOnce(&mut Xoshiro256PlusPlus) -> R) -> R {
        f(&mut self.random.borrow_mut())
    }

    pub fn get_new_event_id(&self) -> u64 {
        let id = self.event_id_counter.get();
        self.event_id_counter.set(id + 1);
        id
    }

    pub fn get_new_packet_id(&self) -> u64 {
        let id = self.packet_id_counter.get();
        self.packet_id_counter.set(id + 1);
        id
    }

    pub fn get_next_packet_priority(&self) -> FifoPacketPriority {
        let priority = self.packet_priority_counter.get();
        self.packet_priority_counter.set(priority + 1);
        priority
    }

    pub fn event_queue(&self) -> &Arc<ThreadSafeEventQueue> {
        &self.event_queue
    }

    pub fn wakeup_queue(&self) -> Arc<Mutex<Vec<Wakeup>>> {
        Arc::clone(&self.wakeups)
    }

    /// The current time as this host observes it: the time of the event being
    /// executed, or of the last one executed.
    pub fn local_now(&self) -> EmulatedTime {
        self.local_now.get()
    }

    /// Schedule a task on this host at an absolute time.
    pub fn schedule_task_at(&self, task: TaskRef, time: EmulatedTime, kind: EventKind) {
        let time = time.max(self.local_now.get());
        let event = Event::new(kind, task, time, self, self.id());
        self.event_queue.push(event);
    }

    /// Schedule a task on this host after a delay.
    pub fn schedule_task_with_delay(&self, task: TaskRef, delay: SimulationTime, kind: EventKind) {
        let now = Worker::current_time().unwrap_or_else(|| self.local_now.get());
        self.schedule_task_at(task, now + delay, kind);
    }

    /// The time of this host's next event, if any.
    pub fn next_event_time(&self) -> Option<EmulatedTime> {
        self.event_queue.next_event_time()
    }

    /// Process all events with `time <= until`. The conservative scheduler
    /// guarantees no event earlier than `until` can still arrive while this
    /// runs.
    pub fn execute(&self, until: EmulatedTime) {
        loop {
            let next_time = match self.event_queue.next_event_time() {
                Some(t) if t <= until => t,
                _ => break,
            };
            let Some(event) = self.event_queue.pop() else {
                break;
            };

            debug_assert!(event.time() >= self.local_now.get());
            debug_assert_eq!(event.time(), next_time);

            self.local_now.set(event.time());
            Worker::set_current_time(event.time());

            if self.params.record_event_trace {
                self.event_trace
                    .borrow_mut()
                    .push((event.time(), event.kind()));
            }

            let _guard = Worker::enter_host(self);
            event.execute(self);

            // status listeners may have resolved blocking conditions; wake
            // the owning syscalls before the next event
            self.drain_wakeups();
        }
    }

    fn drain_wakeups(&self) {
        loop {
            let pending: Vec<Wakeup> = std::mem::take(&mut *self.wakeups.lock().unwrap());
            if pending.is_empty() {
                break;
            }

            for wakeup in pending {
                let process = self.processes.borrow().get(&wakeup.pid).cloned();
                match process {
                    Some(process) => process.lock().unwrap().wakeup(self, &wakeup),
                    None => {
                        log::warn!("Dropping wakeup for dead process {:?}", wakeup.pid)
                    }
                }
            }
        }
    }

    /// The event trace recorded when `record_event_trace` is set.
    pub fn event_trace(&self) -> Vec<(EmulatedTime, EventKind)> {
        self.event_trace.borrow().clone()
    }

    // ===== processes =====

    /// Create a process and schedule its application to start at
    /// `start_time`.
    pub fn add_process(
        &self,
        name: &str,
        start_time: EmulatedTime,
        app: impl FnOnce(&managed::ProcessApi) + Send + 'static,
    ) -> ProcessId {
        let pid = ProcessId(self.process_id_counter.get());
        self.process_id_counter.set(pid.0 + 1);

        let mut process = Process::new(pid, self.id(), name.to_string(), self.params.data_dir.clone());
        process.spawn_main_thread(app);

        self.processes
            .borrow_mut()
            .insert(pid, Arc::new(Mutex::new(process)));

        let task = TaskRef::new(move |host: &Host| {
            let process = host.processes.borrow().get(&pid).cloned();
            if let Some(process) = process {
                process.lock().unwrap().start(host);
            }
        });
        self.schedule_task_at(task, start_time, EventKind::StartApplication);

        pid
    }

    /// Schedule a stop (SIGTERM semantics) for the process.
    pub fn schedule_process_stop(&self, pid: ProcessId, stop_time: EmulatedTime) {
        let task = TaskRef::new(move |host: &Host| {
            let process = host.processes.borrow().get(&pid).cloned();
            if let Some(process) = process {
                process.lock().unwrap().stop(host);
            }
        });
        self.schedule_task_at(task, stop_time, EventKind::StopApplication);
    }

    pub fn process(&self, pid: ProcessId) -> Option<Arc<Mutex<Process>>> {
        self.processes.borrow().get(&pid).cloned()
    }

    pub fn process_ids(&self) -> Vec<ProcessId> {
        self.processes.borrow().keys().copied().collect()
    }

    /// The grace-period cleanup after a process stop.
    pub fn cleanup_process_descriptors(&self, pid: ProcessId) {
        let process = self.processes.borrow().get(&pid).cloned();
        if let Some(process) = process {
            process.lock().unwrap().destroy_descriptors();
        }
    }

    /// Tear down everything at the end of the simulation.
    pub fn shutdown(&self) {
        let pids = self.process_ids();
        {
            let _guard = Worker::enter_host(self);
            for pid in pids {
                let process = self.processes.borrow().get(&pid).cloned();
                if let Some(process) = process {
                    let mut process = process.lock().unwrap();
                    process.stop(self);
                    process.destroy_descriptors();
                }
            }
        }

        self.net_ns.shutdown();
    }

    // ===== packet plumbing =====

    pub fn interface_for(&self, addr: Ipv4Addr) -> Option<Arc<NetworkInterface>> {
        self.net_ns.interface(addr).cloned()
    }

    /// Pop the next inbound packet queued at the upstream router.
    pub fn pop_router_packet(&self) -> Option<PacketRc> {
        self.router.borrow_mut().pop()
    }

    /// A packet delivery event from another host: queue at the upstream
    /// router and wake the downlink relay.
    pub fn receive_packet_from_internet(&self, packet: PacketRc) {
        let became_nonempty = self.router.borrow_mut().push(packet);
        if became_nonempty {
            self.relay_downlink.notify(self);
        }
    }

    /// Route a packet leaving a relay: to one of our own interfaces, or out
    /// to the simulated internet.
    pub fn deliver_packet(&self, packet: PacketRc) {
        let dst = *packet.dst_address().ip();

        if dst.is_loopback() {
            self.net_ns.localhost.push(self, packet);
        } else if dst == self.params.ip {
            self.net_ns.internet.push(self, packet);
        } else {
            Worker::send_packet(self, packet);
        }
    }

    /// A socket at `addr` has packets ready; queue it at its interface and
    /// wake the relay that drains that interface.
    pub fn notify_socket_has_packets(
        &self,
        addr: Ipv4Addr,
        socket: &crate::host::descriptor::socket::inet::InetSocket,
    ) {
        let Some(interface) = self.net_ns.interface(addr) else {
            log::warn!("No interface at {addr} for a sendable socket");
            return;
        };

        interface.add_data_source(socket);

        if addr.is_loopback() {
            self.relay_loopback.notify(self);
        } else {
            self.relay_uplink.notify(self);
        }
    }
}

// hosts move between scheduler threads; all interior state is owned
impl crate::utility::IsSend for Host {}
