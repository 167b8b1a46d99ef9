//! Helpers for building small simulations in tests.

// each test binary uses its own subset of these helpers
#![allow(dead_code)]

use std::path::Path;

use mirage::core::configuration::GeneralOptions;
use mirage::core::controller::SimulationBuilder;
use mirage::network::dns::Dns;
use mirage::network::graph::NetworkGraph;
use sim_support::simulation_time::SimulationTime;

/// Two networks joined by a fixed 50 ms edge, with fast 1 ms self-loops.
pub const TWO_NET_50MS: &str = "\
cdf 1 generate 50000000 0 0
cdf 2 generate 1000000 0 0
cdf 3 generate 1000000 0 0
node 1 3
node 2 3
edge 1 1 2 2 1.0 1.0
edge 2 2 2 2 1.0 1.0
edge 1 2 1 1 1.0 1.0
";

/// Two networks joined by a fixed 10 ms edge.
pub const TWO_NET_10MS: &str = "\
cdf 1 generate 10000000 0 0
cdf 2 generate 1000000 0 0
cdf 3 generate 1000000 0 0
node 1 3
node 2 3
edge 1 1 2 2 1.0 1.0
edge 2 2 2 2 1.0 1.0
edge 1 2 1 1 1.0 1.0
";

/// A single network with a 1 ms self-loop.
pub const ONE_NET: &str = "\
cdf 1 generate 1000000 0 0
cdf 3 generate 1000000 0 0
node 1 3
edge 1 1 1 1 1.0 1.0
";

pub const HOSTS_FILE: &str = "\
10.0.0.1 alpha
10.0.0.2 beta
10.0.0.3 gamma
";

pub fn builder(
    topology: &str,
    seed: u64,
    end: SimulationTime,
    data_dir: &Path,
) -> SimulationBuilder {
    mirage::host::managed::install_panic_hook();

    let graph = NetworkGraph::parse(topology, Path::new(".")).unwrap();
    let dns = Dns::parse(HOSTS_FILE).unwrap();

    SimulationBuilder::new(
        graph,
        dns,
        seed,
        end,
        GeneralOptions::default(),
        data_dir.to_path_buf(),
    )
}

pub fn millis(ms: u64) -> SimulationTime {
    SimulationTime::from_millis(ms)
}

pub fn secs(s: u64) -> SimulationTime {
    SimulationTime::from_secs(s)
}
