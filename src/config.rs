use std::net::SocketAddr;
use std::path::PathBuf;

use crate::topology::Topology;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub rank: u32,
    pub listen_addr: SocketAddr,
    /// Address of the parent rank's Overlay service, `host:port`.
    /// Required on every rank except 0.
    pub parent_addr: Option<String>,
    pub topology: Topology,
    /// Path to the job shell executable spawned for local jobs.
    pub shell_path: PathBuf,
    /// Coalescing delay for batched state-update fan-out.
    pub flush_interval_ms: u64,
    /// Backoff between attempts to re-attach the hello stream.
    pub reconnect_delay_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            listen_addr: "127.0.0.1:50200".parse().expect("valid default addr"),
            parent_addr: None,
            topology: Topology::single(0),
            shell_path: PathBuf::from("canopy-shell"),
            flush_interval_ms: 20,
            reconnect_delay_ms: 1000,
        }
    }
}

impl NodeConfig {
    pub fn new(rank: u32, listen_addr: SocketAddr) -> Self {
        Self {
            rank,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_parent(mut self, addr: impl Into<String>) -> Self {
        self.parent_addr = Some(addr.into());
        self
    }
}
