//! The command-line surface and the scenario file.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use sim_support::simulation_time::SimulationTime;

/// Exit codes, as reported by the binary.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const BAD_CONFIGURATION: i32 = 1;
    pub const INPUT_IO_ERROR: i32 = 2;
    pub const INTERNAL_ASSERTION: i32 = 3;
    pub const INTERRUPTED: i32 = 130;
}

/// Run applications over a simulated network.
#[derive(Debug, Clone, Parser)]
#[command(name = "mirage", version)]
pub struct CliOptions {
    /// Path to the hosts file (one '<ipv4> <hostname>' entry per line)
    #[arg(long)]
    pub hosts: PathBuf,

    /// Path to the network topology file
    #[arg(long)]
    pub topology: PathBuf,

    /// How much virtual time to simulate (e.g. '30s', '5m', '1h')
    #[arg(long, value_parser = parse_duration)]
    pub simulation_end: SimulationTime,

    /// Seed for all deterministic randomness
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Log verbosity; repeat for more detail
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Directory to store per-host runtime files in
    #[arg(long)]
    pub data_directory: Option<PathBuf>,

    /// Number of worker threads (defaults to one per host)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Path to the scenario file describing hosts and their applications
    pub scenario: PathBuf,
}

/// Parse a duration like `500ms`, `30s`, `5m`, or `1h` (a bare integer is
/// seconds).
pub fn parse_duration(text: &str) -> Result<SimulationTime, String> {
    let text = text.trim();

    let (value, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => text.split_at(split),
        None => (text, "s"),
    };

    let value: u64 = value.parse().map_err(|_| format!("invalid duration '{text}'"))?;

    match unit.trim() {
        "ns" => Ok(SimulationTime::from_nanos(value)),
        "us" => Ok(SimulationTime::from_micros(value)),
        "ms" => Ok(SimulationTime::from_millis(value)),
        "s" => Ok(SimulationTime::from_secs(value)),
        "m" => Ok(SimulationTime::from_secs(value * 60)),
        "h" => Ok(SimulationTime::from_secs(value * 3600)),
        unit => Err(format!("unknown duration unit '{unit}'")),
    }
}

/// The scenario file: which hosts exist, where they sit in the topology, and
/// what they run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Hosts keyed by hostname, sorted for determinism.
    pub hosts: BTreeMap<String, HostOptions>,

    #[serde(default)]
    pub options: GeneralOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostOptions {
    /// The topology network this host attaches to.
    pub network_node_id: u32,

    /// Fixed address; when omitted, the address comes from the hosts file
    /// entry for this hostname.
    #[serde(default)]
    pub ip_addr: Option<Ipv4Addr>,

    /// Bandwidth overrides; when omitted, drawn from the network's bandwidth
    /// distribution.
    #[serde(default)]
    pub bandwidth_down_kbps: Option<u64>,
    #[serde(default)]
    pub bandwidth_up_kbps: Option<u64>,

    #[serde(default)]
    pub processes: Vec<ProcessOptions>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessOptions {
    /// The built-in application to run (e.g. `tcp-echo-server`).
    pub app: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Virtual start time, in seconds.
    #[serde(default)]
    pub start_time_s: u64,

    /// Optional virtual stop time, in seconds.
    #[serde(default)]
    pub stop_time_s: Option<u64>,
}

/// Tunables with defaults. Anything not set in the scenario keeps the
/// defaults listed here.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GeneralOptions {
    /// Socket send-buffer capacity in bytes.
    pub send_buffer_size: usize,
    /// Socket receive-buffer capacity in bytes.
    pub recv_buffer_size: usize,
    /// TCP congestion-control algorithm: "reno" or "cubic".
    pub tcp_congestion: String,
    /// Minimum TCP retransmission timeout in milliseconds; the default
    /// depends on the congestion algorithm.
    pub tcp_retransmit_min_rto_ms: Option<u64>,
    /// Delayed-acknowledgement timer in milliseconds.
    pub tcp_delayed_ack_ms: u64,
    /// TIME_WAIT lifetime in seconds.
    pub tcp_time_wait_s: u64,
    /// Shrink the scheduling lookahead to the lowest latency actually used.
    pub dynamic_runahead: bool,
    /// Log level: error, warn, info, debug, or trace.
    pub loglevel: String,
}

impl Default for GeneralOptions {
    fn default() -> Self {
        Self {
            send_buffer_size: 131072,
            recv_buffer_size: 174760,
            tcp_congestion: "reno".to_string(),
            tcp_retransmit_min_rto_ms: None,
            tcp_delayed_ack_ms: 40,
            tcp_time_wait_s: 60,
            dynamic_runahead: false,
            loglevel: "info".to_string(),
        }
    }
}

impl GeneralOptions {
    pub fn tcp_config(&self) -> anyhow::Result<tcp::TcpConfig> {
        let mut config = tcp::TcpConfig::default();

        config.buffer_sizes(
            self.send_buffer_size.try_into().context("send buffer size")?,
            self.recv_buffer_size.try_into().context("recv buffer size")?,
        );

        match self.tcp_congestion.as_str() {
            "reno" => config.congestion_algorithm(tcp::CongestionAlgorithm::Reno),
            "cubic" => config.congestion_algorithm(tcp::CongestionAlgorithm::Cubic),
            other => anyhow::bail!("unknown congestion algorithm '{other}'"),
        }

        if let Some(min_rto) = self.tcp_retransmit_min_rto_ms {
            config.min_rto_ms(min_rto);
        }
        config.delayed_ack_ms(self.tcp_delayed_ack_ms);
        config.time_wait_secs(self.tcp_time_wait_s);

        Ok(config)
    }

    pub fn log_level(&self, verbose: u8) -> anyhow::Result<log::LevelFilter> {
        if verbose >= 2 {
            return Ok(log::LevelFilter::Trace);
        }
        if verbose == 1 {
            return Ok(log::LevelFilter::Debug);
        }

        match self.loglevel.as_str() {
            "error" => Ok(log::LevelFilter::Error),
            "warn" => Ok(log::LevelFilter::Warn),
            "info" => Ok(log::LevelFilter::Info),
            "debug" => Ok(log::LevelFilter::Debug),
            "trace" => Ok(log::LevelFilter::Trace),
            other => anyhow::bail!("unknown log level '{other}'"),
        }
    }
}

impl Scenario {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Reading scenario file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("Parsing scenario file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), SimulationTime::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), SimulationTime::from_secs(300));
        assert_eq!(parse_duration("10ms").unwrap(), SimulationTime::from_millis(10));
        assert_eq!(parse_duration("7").unwrap(), SimulationTime::from_secs(7));
        assert!(parse_duration("10 fortnights").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_scenario_parses() {
        let text = "\
hosts:
  server:
    network_node_id: 1
    processes:
      - app: tcp-echo-server
        args: ['80']
  client:
    network_node_id: 1
    processes:
      - app: tcp-client
        args: ['10.0.0.1:80', 'hello']
        start_time_s: 1
options:
  loglevel: debug
";
        let scenario: Scenario = serde_yaml::from_str(text).unwrap();
        assert_eq!(scenario.hosts.len(), 2);
        assert_eq!(scenario.options.loglevel, "debug");
        assert_eq!(scenario.hosts["client"].processes[0].start_time_s, 1);
    }

    #[test]
    fn test_scenario_rejects_unknown_fields() {
        let text = "\
hosts: {}
bogus: 1
";
        assert!(serde_yaml::from_str::<Scenario>(text).is_err());
    }
}
