//! Thin controller façade over one or more node servers.
//!
//! Routes `read/write/atomic/fence` through the HDM decoder to the server
//! hosting the home node when it lives in this process, falling back to the
//! default server (which forwards over the fabric). Also aggregates
//! statistics across the registered servers.

use crate::coherency::CoherencyStats;
use crate::error::{CxlError, CxlResult};
use crate::server::node::{NodeServer, ServerStats};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub struct CxlController {
    servers: RwLock<HashMap<u32, Arc<NodeServer>>>,
    default_node: u32,
}

impl CxlController {
    pub fn new(default_node: u32) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            default_node,
        }
    }

    pub fn register_server(&self, server: Arc<NodeServer>) {
        self.servers.write().insert(server.node_id(), server);
    }

    pub fn server(&self, node_id: u32) -> Option<Arc<NodeServer>> {
        self.servers.read().get(&node_id).cloned()
    }

    fn default_server(&self) -> CxlResult<Arc<NodeServer>> {
        self.server(self.default_node)
            .ok_or_else(|| CxlError::config(format!("no server for node {}", self.default_node)))
    }

    /// The server that should issue an op on `addr`: the home server when it
    /// is registered here, otherwise the default server.
    fn route(&self, addr: u64) -> CxlResult<Arc<NodeServer>> {
        let local = self.default_server()?;
        let home = local.get_node_for_address(addr);
        match self.server(home) {
            Some(server) => Ok(server),
            None => Ok(local),
        }
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) -> CxlResult<u64> {
        self.route(addr)?.read(addr, buf)
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> CxlResult<u64> {
        self.route(addr)?.write(addr, data)
    }

    pub fn atomic_faa(&self, addr: u64, value: u64) -> CxlResult<(u64, u64)> {
        self.route(addr)?.atomic_faa(addr, value)
    }

    pub fn atomic_cas(&self, addr: u64, expected: u64, desired: u64) -> CxlResult<(u64, u64)> {
        self.route(addr)?.atomic_cas(addr, expected, desired)
    }

    pub fn fence(&self) -> CxlResult<()> {
        self.default_server()?.fence();
        Ok(())
    }

    /// Sum server statistics across all registered servers.
    pub fn aggregate_stats(&self) -> ServerStats {
        let servers = self.servers.read();
        let mut total = ServerStats::default();
        for server in servers.values() {
            let stats = server.get_stats();
            total.local_reads += stats.local_reads;
            total.local_writes += stats.local_writes;
            total.remote_reads += stats.remote_reads;
            total.remote_writes += stats.remote_writes;
            total.forwarded_requests += stats.forwarded_requests;
            total.coherency_messages += stats.coherency_messages;
        }
        total
    }

    /// Sum coherency statistics across all registered servers.
    pub fn aggregate_coherency_stats(&self) -> CoherencyStats {
        let servers = self.servers.read();
        let mut total = CoherencyStats::default();
        let mut engines = 0u64;
        for server in servers.values() {
            let stats = server.coherency_stats();
            total.coherency_messages += stats.coherency_messages;
            total.invalidations += stats.invalidations;
            total.downgrades += stats.downgrades;
            total.writebacks += stats.writebacks;
            total.remote_ops += stats.remote_ops;
            total.avg_coherency_latency += stats.avg_coherency_latency;
            engines += 1;
        }
        if engines > 0 {
            total.avg_coherency_latency /= engines as f64;
        }
        total
    }
}
