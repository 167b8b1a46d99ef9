//! Name/address registry for the simulated hosts. This backs both address
//! assignment at startup and the hosts file that managed processes see at
//! `/etc/hosts`.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{bail, Context};

#[derive(Debug, Default)]
pub struct Dns {
    name_to_addr: HashMap<String, Ipv4Addr>,
    // BTreeMap so the rendered hosts file is deterministically ordered
    addr_to_name: BTreeMap<Ipv4Addr, String>,
}

impl Dns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a hosts file: one `<ipv4-dotted-quad> <hostname>` entry per
    /// line. Empty lines and `#` comments are ignored.
    pub fn from_hosts_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Reading hosts file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Parsing hosts file {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut dns = Self::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (Some(addr), Some(name)) = (fields.next(), fields.next()) else {
                bail!("line {}: expected '<ipv4> <hostname>'", lineno + 1);
            };

            let addr: Ipv4Addr = addr
                .parse()
                .with_context(|| format!("line {}: bad address '{addr}'", lineno + 1))?;

            dns.register(name, addr)
                .with_context(|| format!("line {}", lineno + 1))?;
        }

        Ok(dns)
    }

    pub fn register(&mut self, name: &str, addr: Ipv4Addr) -> anyhow::Result<()> {
        if addr.is_loopback() || addr.is_unspecified() {
            bail!("hostname '{name}' cannot use the reserved address {addr}");
        }
        if self.name_to_addr.contains_key(name) {
            bail!("duplicate hostname '{name}'");
        }
        if self.addr_to_name.contains_key(&addr) {
            bail!("duplicate address {addr}");
        }

        self.name_to_addr.insert(name.to_string(), addr);
        self.addr_to_name.insert(addr, name.to_string());
        Ok(())
    }

    pub fn addr_of(&self, name: &str) -> Option<Ipv4Addr> {
        self.name_to_addr.get(name).copied()
    }

    pub fn name_of(&self, addr: Ipv4Addr) -> Option<&str> {
        self.addr_to_name.get(&addr).map(|x| x.as_str())
    }

    /// Render the hosts file that managed processes observe at `/etc/hosts`.
    pub fn render_hosts_file(&self) -> String {
        let mut out = String::from("127.0.0.1 localhost\n");
        for (addr, name) in &self.addr_to_name {
            out.push_str(&format!("{addr} {name}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_lookup() {
        let dns = Dns::parse("10.0.0.1 alpha\n10.0.0.2 beta\n# comment\n").unwrap();

        assert_eq!(dns.addr_of("alpha"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(dns.name_of("10.0.0.2".parse().unwrap()), Some("beta"));
        assert_eq!(dns.addr_of("gamma"), None);
    }

    #[test]
    fn test_rejects_duplicates_and_reserved() {
        assert!(Dns::parse("10.0.0.1 a\n10.0.0.1 b\n").is_err());
        assert!(Dns::parse("10.0.0.1 a\n10.0.0.2 a\n").is_err());
        assert!(Dns::parse("127.0.0.1 a\n").is_err());
        assert!(Dns::parse("0.0.0.0 a\n").is_err());
    }

    #[test]
    fn test_rendered_hosts_file_is_sorted() {
        let mut dns = Dns::new();
        dns.register("late", "10.0.0.9".parse().unwrap()).unwrap();
        dns.register("early", "10.0.0.1".parse().unwrap()).unwrap();

        let rendered = dns.render_hosts_file();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "127.0.0.1 localhost");
        assert_eq!(lines[1], "10.0.0.1 early");
        assert_eq!(lines[2], "10.0.0.9 late");
    }
}
