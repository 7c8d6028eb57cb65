//! Daemon configuration.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use shoal_core::{NodeEntry, NodeId};

/// Configuration of one shoal node, parsed from flags and environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "shoal-node", about = "Shoal object-storage node daemon", version)]
pub struct ServerConfig {
    /// Address this node announces to the cluster.
    #[arg(long, default_value = "127.0.0.1", env = "SHOAL_ADDR")]
    pub addr: IpAddr,

    /// Service port announced to the cluster.
    #[arg(long, default_value_t = 7000, env = "SHOAL_PORT")]
    pub port: u16,

    /// Failure zone override; defaults to deriving one from the address.
    #[arg(long, env = "SHOAL_ZONE")]
    pub zone: Option<u32>,

    /// Replication weight on the placement ring.
    #[arg(long, default_value_t = shoal_core::DEFAULT_VNODES)]
    pub vnodes: u16,

    /// Data directory holding the epoch log.
    #[arg(long, default_value = "/var/lib/shoal", env = "SHOAL_DIR")]
    pub dir: PathBuf,

    /// Reachability probe timeout in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub probe_timeout_ms: u64,

    /// Format a fresh single-node cluster on startup.
    #[arg(long)]
    pub format: bool,

    /// Object redundancy used with --format.
    #[arg(long, default_value_t = shoal_core::DEFAULT_COPIES)]
    pub copies: u32,

    /// Emit logs as JSON lines.
    #[arg(long, env = "SHOAL_JSON_LOGS")]
    pub json_logs: bool,
}

impl ServerConfig {
    /// 16-byte address form used by node identities (v4 addresses mapped).
    #[must_use]
    pub fn addr_bytes(&self) -> [u8; 16] {
        match self.addr {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    /// Driver identity of this process.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        NodeId {
            addr: self.addr_bytes(),
            pid: u64::from(std::process::id()),
        }
    }

    /// Storage entry announced to the cluster.
    #[must_use]
    pub fn node_entry(&self) -> NodeEntry {
        let mut entry = NodeEntry::new(self.addr_bytes(), self.port, self.zone);
        entry.nr_vnodes = self.vnodes;
        entry
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cfg = ServerConfig::parse_from(["shoal-node"]);
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.vnodes, shoal_core::DEFAULT_VNODES);
        assert!(!cfg.format);
    }

    #[test]
    fn entry_derives_zone_from_addr_by_default() {
        let cfg = ServerConfig::parse_from(["shoal-node", "--addr", "10.1.2.3"]);
        let entry = cfg.node_entry();
        assert_eq!(entry.zone, 10 | 1 << 8 | 2 << 16 | 3 << 24);

        let cfg = ServerConfig::parse_from(["shoal-node", "--zone", "5"]);
        assert_eq!(cfg.node_entry().zone, 5);
    }

    #[test]
    fn v4_addr_is_mapped() {
        let cfg = ServerConfig::parse_from(["shoal-node", "--addr", "127.0.0.1"]);
        let bytes = cfg.addr_bytes();
        assert_eq!(&bytes[10..12], &[0xff, 0xff]);
        assert_eq!(&bytes[12..], &[127, 0, 0, 1]);
    }
}
