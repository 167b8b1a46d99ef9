//! The network topology: a directed multigraph of networks. Vertices are
//! address pools with an associated bandwidth distribution; edges carry a
//! latency distribution and a reliability for each direction.

pub mod cdf;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{bail, Context};
use petgraph::graph::{Graph, NodeIndex};
use rand::Rng;
use sim_support::simulation_time::SimulationTime;
use sim_support::HostId;

use self::cdf::Cdf;

/// A topology vertex: a network holding a pool of hosts.
#[derive(Debug)]
pub struct NetworkNode {
    pub id: u32,
    /// Host bandwidths (in kilobits per second) are drawn from this.
    pub bandwidth_kbps: Cdf,
}

/// A directed topology edge.
#[derive(Debug)]
pub struct NetworkEdge {
    /// Latency in nanoseconds.
    pub latency_ns: Cdf,
    /// Probability a packet on this edge is delivered, in [0, 1].
    pub reliability: f64,
}

/// The parsed topology graph.
///
/// The input is plain text, one directive per line:
///
/// ```text
/// cdf  <id> file <path>                      # <value>\t<cum-prob> pairs
/// cdf  <id> generate <center> <base> <tail>
/// node <id> <bandwidth-cdf-id>
/// edge <src-id> <dst-id> <fwd-cdf-id> <rev-cdf-id> <fwd-reliability> <rev-reliability>
/// ```
///
/// Latency CDF values are nanoseconds; bandwidth CDF values are kbit/s. An
/// `edge` line creates the two directed edges at once. A self-loop edge is
/// required for any network that hosts communicating peers.
#[derive(Debug)]
pub struct NetworkGraph {
    graph: Graph<NetworkNode, NetworkEdge, petgraph::Directed>,
    node_id_to_index_map: HashMap<u32, NodeIndex>,
}

impl NetworkGraph {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Reading topology file {}", path.display()))?;
        let base_dir = path.parent().unwrap_or(Path::new("."));
        Self::parse(&text, base_dir)
            .with_context(|| format!("Parsing topology file {}", path.display()))
    }

    pub fn parse(text: &str, base_dir: &Path) -> anyhow::Result<Self> {
        let mut graph = Graph::new();
        let mut node_id_to_index_map = HashMap::new();
        let mut cdfs: HashMap<u32, Cdf> = HashMap::new();

        for (lineno, line) in text.lines().enumerate() {
            let lineno = lineno + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();

            match fields[0] {
                "cdf" => {
                    let [_, id, rest @ ..] = &fields[..] else {
                        bail!("line {lineno}: malformed 'cdf' directive");
                    };
                    let id: u32 = id.parse().context("cdf id")?;

                    let cdf = match rest {
                        ["file", path] => Cdf::from_file(&base_dir.join(path))?,
                        ["generate", center, base, tail] => Cdf::generate(
                            center.parse().context("cdf center")?,
                            base.parse().context("cdf base width")?,
                            tail.parse().context("cdf tail width")?,
                        )?,
                        _ => bail!("line {lineno}: expected 'file <path>' or 'generate <center> <base> <tail>'"),
                    };

                    if cdfs.insert(id, cdf).is_some() {
                        bail!("line {lineno}: duplicate cdf id {id}");
                    }
                }
                "node" => {
                    let [_, id, bandwidth_cdf] = &fields[..] else {
                        bail!("line {lineno}: malformed 'node' directive");
                    };
                    let id: u32 = id.parse().context("node id")?;
                    let bandwidth_cdf: u32 = bandwidth_cdf.parse().context("bandwidth cdf id")?;

                    let bandwidth_kbps = cdfs
                        .get(&bandwidth_cdf)
                        .with_context(|| format!("line {lineno}: unknown cdf id {bandwidth_cdf}"))?
                        .clone();

                    let index = graph.add_node(NetworkNode { id, bandwidth_kbps });
                    if node_id_to_index_map.insert(id, index).is_some() {
                        bail!("line {lineno}: duplicate node id {id}");
                    }
                }
                "edge" => {
                    let [_, src, dst, fwd_cdf, rev_cdf, fwd_rel, rev_rel] = &fields[..] else {
                        bail!("line {lineno}: malformed 'edge' directive");
                    };
                    let src: u32 = src.parse().context("edge source")?;
                    let dst: u32 = dst.parse().context("edge target")?;

                    let src_index = *node_id_to_index_map
                        .get(&src)
                        .with_context(|| format!("line {lineno}: unknown node {src}"))?;
                    let dst_index = *node_id_to_index_map
                        .get(&dst)
                        .with_context(|| format!("line {lineno}: unknown node {dst}"))?;

                    let mut add_edge = |a, b, cdf_id: &str, rel: &str| -> anyhow::Result<()> {
                        let cdf_id: u32 = cdf_id.parse().context("edge cdf id")?;
                        let reliability: f64 = rel.parse().context("edge reliability")?;

                        if !(0.0..=1.0).contains(&reliability) {
                            bail!("line {lineno}: reliability must be in [0, 1]");
                        }

                        let latency_ns = cdfs
                            .get(&cdf_id)
                            .with_context(|| format!("line {lineno}: unknown cdf id {cdf_id}"))?
                            .clone();

                        if latency_ns.min_value() <= 0.0 {
                            bail!("line {lineno}: edge latency must not be 0");
                        }

                        graph.add_edge(a, b, NetworkEdge {
                            latency_ns,
                            reliability,
                        });
                        Ok(())
                    };

                    add_edge(src_index, dst_index, fwd_cdf, fwd_rel)?;
                    if src_index != dst_index {
                        add_edge(dst_index, src_index, rev_cdf, rev_rel)?;
                    }
                }
                directive => bail!("line {lineno}: unknown directive '{directive}'"),
            }
        }

        if graph.node_count() == 0 {
            bail!("the topology has no networks");
        }

        Ok(Self {
            graph,
            node_id_to_index_map,
        })
    }

    pub fn node_id_to_index(&self, id: u32) -> Option<NodeIndex> {
        self.node_id_to_index_map.get(&id).copied()
    }

    pub fn node(&self, index: NodeIndex) -> &NetworkNode {
        self.graph.node_weight(index).unwrap()
    }

    /// Get the directed edge between two networks. Fails if there is not
    /// exactly one such edge.
    pub fn get_edge(&self, src: NodeIndex, dst: NodeIndex) -> anyhow::Result<&NetworkEdge> {
        let mut edges = self.graph.edges_connecting(src, dst);
        let edge = edges.next().with_context(|| {
            format!(
                "No edge connecting network {} to {}",
                self.node(src).id,
                self.node(dst).id
            )
        })?;
        if edges.next().is_some() {
            bail!(
                "More than one edge connecting network {} to {}",
                self.node(src).id,
                self.node(dst).id
            );
        }
        Ok(edge.weight())
    }
}

/// The assignment of host addresses to topology networks, plus name and
/// seed bookkeeping shared read-only across workers.
#[derive(Debug, Default)]
pub struct IpAssignment {
    ip_to_host: HashMap<Ipv4Addr, HostId>,
    host_to_node: HashMap<HostId, NodeIndex>,
}

impl IpAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, ip: Ipv4Addr, host: HostId, node: NodeIndex) {
        assert!(self.ip_to_host.insert(ip, host).is_none(), "duplicate host ip {ip}");
        self.host_to_node.insert(host, node);
    }

    pub fn host_for_ip(&self, ip: Ipv4Addr) -> Option<HostId> {
        self.ip_to_host.get(&ip).copied()
    }

    pub fn node_for_host(&self, host: HostId) -> Option<NodeIndex> {
        self.host_to_node.get(&host).copied()
    }
}

/// Pairwise routing properties, extracted from the graph once at startup so
/// that workers never touch the graph itself.
#[derive(Debug)]
pub struct RoutingInfo {
    paths: HashMap<(NodeIndex, NodeIndex), PathProperties>,
    /// Smallest possible latency over all edges; the scheduler's lookahead.
    min_latency: SimulationTime,
    /// Largest possible latency over all edges.
    max_latency: SimulationTime,
}

#[derive(Clone, Debug)]
struct PathProperties {
    latency_ns: Cdf,
    reliability: f64,
}

impl RoutingInfo {
    /// Precompute properties for every pair of networks in use. Every pair
    /// must be connected by a direct edge (including self-loops for pairs
    /// within one network).
    pub fn new(graph: &NetworkGraph, nodes_in_use: &[NodeIndex]) -> anyhow::Result<Self> {
        let mut paths = HashMap::new();
        let mut min_latency = None;
        let mut max_latency = None;

        for &src in nodes_in_use {
            for &dst in nodes_in_use {
                let edge = graph.get_edge(src, dst)?;

                let edge_min = SimulationTime::from_nanos(edge.latency_ns.min_value() as u64);
                let edge_max = SimulationTime::from_nanos(edge.latency_ns.max_value() as u64);

                min_latency = Some(min_latency.map_or(edge_min, |x: SimulationTime| x.min(edge_min)));
                max_latency = Some(max_latency.map_or(edge_max, |x: SimulationTime| x.max(edge_max)));

                paths.insert(
                    (src, dst),
                    PathProperties {
                        latency_ns: edge.latency_ns.clone(),
                        reliability: edge.reliability,
                    },
                );
            }
        }

        let min_latency = min_latency.context("no networks are in use")?;
        assert!(min_latency.is_positive());

        Ok(Self {
            paths,
            min_latency,
            max_latency: max_latency.unwrap(),
        })
    }

    /// Draw a latency sample for a packet from `src` to `dst`.
    pub fn sample_latency(
        &self,
        src: NodeIndex,
        dst: NodeIndex,
        rng: &mut impl Rng,
    ) -> SimulationTime {
        let path = &self.paths[&(src, dst)];
        let sampled = SimulationTime::from_nanos(path.latency_ns.sample(rng) as u64);
        // never undercut the lookahead the scheduler was built on
        sampled.max(self.min_latency)
    }

    pub fn reliability(&self, src: NodeIndex, dst: NodeIndex) -> f64 {
        self.paths[&(src, dst)].reliability
    }

    /// The smallest latency possible in the topology (the lookahead bound).
    pub fn min_latency(&self) -> SimulationTime {
        self.min_latency
    }

    pub fn max_latency(&self) -> SimulationTime {
        self.max_latency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPOLOGY: &str = "\
# two networks, 50ms fixed latency between them, 10ms inside each
cdf 1 generate 50000000 0 0
cdf 2 generate 10000000 0 0
cdf 3 generate 100000 0 0
node 10 3
node 20 3
edge 10 10 2 2 1.0 1.0
edge 20 20 2 2 1.0 1.0
edge 10 20 1 1 1.0 1.0
";

    fn parse() -> NetworkGraph {
        NetworkGraph::parse(TOPOLOGY, Path::new(".")).unwrap()
    }

    #[test]
    fn test_parse_topology() {
        let graph = parse();
        let a = graph.node_id_to_index(10).unwrap();
        let b = graph.node_id_to_index(20).unwrap();

        let edge = graph.get_edge(a, b).unwrap();
        assert_eq!(edge.latency_ns.min_value(), 50000000.0);

        // the reverse edge was created implicitly
        let edge = graph.get_edge(b, a).unwrap();
        assert_eq!(edge.latency_ns.min_value(), 50000000.0);

        // self loops exist
        assert!(graph.get_edge(a, a).is_ok());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(NetworkGraph::parse("bogus 1 2\n", Path::new(".")).is_err());
        assert!(NetworkGraph::parse("node 1 99\n", Path::new(".")).is_err());
        assert!(NetworkGraph::parse("", Path::new(".")).is_err());
    }

    #[test]
    fn test_routing_info_latency_extrema() {
        let graph = parse();
        let a = graph.node_id_to_index(10).unwrap();
        let b = graph.node_id_to_index(20).unwrap();

        let routing = RoutingInfo::new(&graph, &[a, b]).unwrap();
        assert_eq!(routing.min_latency(), SimulationTime::from_millis(10));
        assert_eq!(routing.max_latency(), SimulationTime::from_millis(50));
    }

    #[test]
    fn test_missing_edge_is_an_error() {
        let text = "\
cdf 1 generate 1000000 0 0
node 1 1
node 2 1
edge 1 1 1 1 1.0 1.0
";
        let graph = NetworkGraph::parse(text, Path::new(".")).unwrap();
        let a = graph.node_id_to_index(1).unwrap();
        let b = graph.node_id_to_index(2).unwrap();

        // nodes 1 and 2 are not connected
        assert!(RoutingInfo::new(&graph, &[a, b]).is_err());
    }
}
