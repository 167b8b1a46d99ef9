//! Builds the simulation from configuration and drives the conservative
//! parallel rounds: all workers drain their hosts up to a shared safe
//! horizon, a barrier closes the round, and the horizon advances to the next
//! event time plus the lookahead.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use scheduler::ThreadPerHostSched;
use sim_support::emulated_time::EmulatedTime;
use sim_support::simulation_time::SimulationTime;
use sim_support::HostId;

use crate::core::configuration::{CliOptions, GeneralOptions, Scenario};
use crate::core::runahead::Runahead;
use crate::core::worker::{Worker, WorkerShared, WorkerThreadID};
use crate::host::managed::{apps, ProcessApi};
use crate::host::{Host, HostParams};
use crate::network::dns::Dns;
use crate::network::graph::{IpAssignment, NetworkGraph, RoutingInfo};

std::thread_local! {
    // the scheduler parks each worker's hosts here between rounds
    static HOST_STORAGE: RefCell<Vec<Box<Host>>> = const { RefCell::new(Vec::new()) };
}

/// Assembles hosts, addresses, and routing into a runnable [`Simulation`].
pub struct SimulationBuilder {
    graph: NetworkGraph,
    dns: Dns,
    seed: u64,
    end_time: SimulationTime,
    workers: Option<usize>,
    options: GeneralOptions,
    data_dir: PathBuf,
    record_event_trace: bool,

    hosts: Vec<Box<Host>>,
    ip_assignment: IpAssignment,
    host_seeds: HashMap<HostId, u64>,
}

impl SimulationBuilder {
    pub fn new(
        graph: NetworkGraph,
        dns: Dns,
        seed: u64,
        end_time: SimulationTime,
        options: GeneralOptions,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            graph,
            dns,
            seed,
            end_time,
            workers: None,
            options,
            data_dir,
            record_event_trace: false,
            hosts: Vec::new(),
            ip_assignment: IpAssignment::new(),
            host_seeds: HashMap::new(),
        }
    }

    pub fn set_workers(&mut self, workers: Option<usize>) {
        self.workers = workers;
    }

    /// Record per-host event traces (used by determinism tests).
    pub fn record_event_traces(&mut self, enable: bool) {
        self.record_event_trace = enable;
    }

    /// Register a hostname/address pair that isn't in the hosts file.
    pub fn register_address(&mut self, name: &str, addr: Ipv4Addr) -> anyhow::Result<()> {
        self.dns.register(name, addr)
    }

    /// Create a host attached to a topology network. Its address comes from
    /// the hosts file (or [`register_address`](Self::register_address)).
    pub fn add_host(&mut self, name: &str, network_node_id: u32) -> anyhow::Result<HostId> {
        let ip = self
            .dns
            .addr_of(name)
            .with_context(|| format!("host '{name}' has no entry in the hosts file"))?;

        let node = self
            .graph
            .node_id_to_index(network_node_id)
            .with_context(|| format!("host '{name}' references unknown network {network_node_id}"))?;

        let id = HostId::from(self.hosts.len() as u32);

        // every host gets an independent, reproducible seed
        let host_seed = self
            .seed
            .wrapping_add((self.hosts.len() as u64 + 1).wrapping_mul(0x9e3779b97f4a7c15));

        // bandwidths come from the network's distribution unless overridden
        let mut bw_rng = {
            use rand::SeedableRng;
            rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(host_seed)
        };
        let bandwidth_kbps = self.graph.node(node).bandwidth_kbps.sample(&mut bw_rng) as u64;
        let bandwidth_kbps = bandwidth_kbps.max(1);

        let data_dir = self.data_dir.join(name);
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating host data directory {}", data_dir.display()))?;

        let params = HostParams {
            id,
            name: name.to_string(),
            ip,
            seed: host_seed,
            bandwidth_down_kbps: bandwidth_kbps,
            bandwidth_up_kbps: bandwidth_kbps,
            send_buf_size: self.options.send_buffer_size,
            recv_buf_size: self.options.recv_buffer_size,
            tcp_config: self.options.tcp_config()?,
            data_dir,
            record_event_trace: self.record_event_trace,
        };

        self.ip_assignment.assign(ip, id, node);
        self.host_seeds.insert(id, host_seed);
        self.hosts.push(Box::new(Host::new(params)));

        Ok(id)
    }

    pub fn set_host_bandwidth(&mut self, id: HostId, down_kbps: u64, up_kbps: u64) {
        let host = self.host_mut(id);
        let mut params = host.params().clone();
        params.bandwidth_down_kbps = down_kbps;
        params.bandwidth_up_kbps = up_kbps;
        **host = Host::new(params);
    }

    fn host_mut(&mut self, id: HostId) -> &mut Box<Host> {
        let index = u32::from(id) as usize;
        &mut self.hosts[index]
    }

    fn host(&self, id: HostId) -> &Host {
        let index = u32::from(id) as usize;
        &self.hosts[index]
    }

    /// Schedule an application on a host at a virtual start time.
    pub fn spawn_process(
        &mut self,
        host_id: HostId,
        name: &str,
        start_time: SimulationTime,
        app: impl FnOnce(&ProcessApi) + Send + 'static,
    ) {
        let start = EmulatedTime::SIMULATION_START + start_time;
        self.host(host_id).add_process(name, start, app);
    }

    /// Schedule a stop (SIGTERM semantics) for every process of a host.
    pub fn schedule_stop_all(&mut self, host_id: HostId, stop_time: SimulationTime) {
        let stop = EmulatedTime::SIMULATION_START + stop_time;
        let host = self.host(host_id);
        for pid in host.process_ids() {
            host.schedule_process_stop(pid, stop);
        }
    }

    pub fn build(self) -> anyhow::Result<Simulation> {
        if self.hosts.is_empty() {
            bail!("the scenario defines no hosts");
        }

        // pairwise routing over the networks actually in use
        let nodes_in_use: Vec<_> = {
            let mut nodes: Vec<_> = self
                .hosts
                .iter()
                .map(|host| self.ip_assignment.node_for_host(host.id()).unwrap())
                .collect();
            nodes.sort();
            nodes.dedup();
            nodes
        };

        let routing = RoutingInfo::new(&self.graph, &nodes_in_use)?;

        let runahead = Runahead::new(self.options.dynamic_runahead, routing.min_latency());

        // the hosts file managed processes will see at /etc/hosts
        let hosts_file_path = self.data_dir.join("hosts");
        std::fs::write(&hosts_file_path, self.dns.render_hosts_file())
            .with_context(|| format!("writing {}", hosts_file_path.display()))?;

        let event_queues = self
            .hosts
            .iter()
            .map(|host| (host.id(), Arc::clone(host.event_queue())))
            .collect();

        let shared = Arc::new(WorkerShared {
            ip_assignment: self.ip_assignment,
            routing,
            dns: self.dns,
            runahead,
            sim_end_time: EmulatedTime::SIMULATION_START + self.end_time,
            event_queues,
            host_seeds: self.host_seeds,
            hosts_file_path,
        });

        Ok(Simulation {
            shared,
            hosts: self.hosts,
            workers: self.workers,
        })
    }
}

/// A fully assembled simulation, ready to run.
pub struct Simulation {
    shared: Arc<WorkerShared>,
    hosts: Vec<Box<Host>>,
    workers: Option<usize>,
}

impl Simulation {
    /// Run rounds until no host has an event before the end time. Returns the
    /// hosts for post-run inspection.
    pub fn run(self) -> anyhow::Result<Vec<Box<Host>>> {
        let num_hosts = self.hosts.len();
        let num_workers = self.workers.unwrap_or(num_hosts).clamp(1, num_hosts);
        let end_time = self.shared.sim_end_time;
        let shared = Arc::clone(&self.shared);

        log::info!(
            "Simulating {num_hosts} hosts over {num_workers} workers until {:?}",
            end_time.duration_since(&EmulatedTime::SIMULATION_START)
        );

        let mut sched = ThreadPerHostSched::new(&HOST_STORAGE, self.hosts, num_workers);

        // give every worker thread its context
        {
            let shared = Arc::clone(&shared);
            sched.scope(|s| {
                s.run(move |thread_idx| {
                    Worker::new_for_this_thread(
                        WorkerThreadID(thread_idx as u32),
                        Arc::clone(&shared),
                    );
                });
            });
        }

        let mut rounds: u64 = 0;

        loop {
            // the next event time across every host's queue; cross-host
            // packets are already in their destination's queue, so this is a
            // complete view
            let min_next_event = shared
                .event_queues
                .values()
                .filter_map(|queue| queue.next_event_time())
                .min();

            let Some(min_next_event) = min_next_event else {
                log::debug!("No events remain; ending the simulation early");
                break;
            };

            if min_next_event >= end_time {
                break;
            }

            // the conservative safe horizon: no packet sent during this round
            // can arrive at or before it
            let runahead = shared.runahead.get();
            let horizon = min_next_event
                .saturating_add(runahead)
                .min(end_time);

            sched.scope(|s| {
                s.run_with_hosts(move |_thread_idx, hosts| {
                    Worker::set_round_end_time(horizon);
                    hosts.for_each(|host| {
                        host.execute(horizon);
                        Worker::clear_current_time();
                        host
                    });
                });
            });

            rounds += 1;
        }

        log::info!("Simulation reached the end time after {rounds} rounds");

        // collect the hosts back and tear everything down
        let hosts = sched.join();
        for host in &hosts {
            host.shutdown();
        }

        Ok(hosts)
    }
}

/// Everything the command-line front-end does: parse inputs, assemble the
/// simulation from the scenario, run it.
pub fn run_from_cli(options: &CliOptions) -> anyhow::Result<()> {
    let scenario = Scenario::from_file(&options.scenario)?;

    let dns = Dns::from_hosts_file(&options.hosts)?;
    let graph = NetworkGraph::from_file(&options.topology)?;

    let data_dir = match &options.data_directory {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()
            .context("resolving the current directory")?
            .join("mirage.data"),
    };
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let mut builder = SimulationBuilder::new(
        graph,
        dns,
        options.seed,
        options.simulation_end,
        scenario.options.clone(),
        data_dir,
    );
    builder.set_workers(options.workers);

    for (name, host_options) in &scenario.hosts {
        if let Some(ip) = host_options.ip_addr {
            // a scenario-pinned address that may not be in the hosts file
            if builder.dns_addr_of(name).is_none() {
                builder.register_address(name, ip)?;
            }
        }

        let host_id = builder.add_host(name, host_options.network_node_id)?;

        if let (Some(down), Some(up)) = (
            host_options.bandwidth_down_kbps,
            host_options.bandwidth_up_kbps,
        ) {
            builder.set_host_bandwidth(host_id, down, up);
        }

        for (index, process) in host_options.processes.iter().enumerate() {
            let app = apps::lookup(&process.app, &process.args)
                .with_context(|| format!("host '{name}' process {index}"))?;

            let process_name = format!("{}-{}", process.app, index);
            builder.spawn_process(
                host_id,
                &process_name,
                SimulationTime::from_secs(process.start_time_s),
                app,
            );

            if let Some(stop) = process.stop_time_s {
                builder.schedule_stop_all(host_id, SimulationTime::from_secs(stop));
            }
        }
    }

    let simulation = builder.build()?;
    simulation.run()?;

    Ok(())
}

impl SimulationBuilder {
    fn dns_addr_of(&self, name: &str) -> Option<Ipv4Addr> {
        self.dns.addr_of(name)
    }
}
