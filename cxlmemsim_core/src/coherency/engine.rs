//! Unified MOESI coherency engine.
//!
//! One engine per node serves both local multi-head accesses and remote
//! (forwarded) accesses: the home node's directory is authoritative for every
//! cacheline in its ranges. State transitions run CPU-bound under the entry
//! lock; coherency traffic to peers is emitted fire-and-forget through the
//! injected `CoherencyTransport`, and ACKs are never awaited under a lock.

use crate::coherency::directory::{
    Directory, DirectoryEntry, DirectoryEntrySnapshot, MhsldCacheState, NO_NODE,
};
use crate::decoder::HdmDecoder;
use crate::latency::{FabricLink, LogPModel};
use crate::util::{cacheline_addr, CACHELINE_SIZE};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Fixed device latency used by the contention model (ns).
const BASE_DEVICE_LATENCY_NS: f64 = 100.0;
const CONTENTION_FACTOR: f64 = 0.3;
const CONTENTION_CAP: f64 = 5.0;

pub const MAX_HEADS: u32 = 16;

/// One memory operation entering the coherency protocol.
#[derive(Debug, Clone, Copy)]
pub struct CoherencyRequest {
    pub addr: u64,
    pub requesting_node: u32,
    pub requesting_head: u32,
    pub is_write: bool,
    pub timestamp: u64,
}

/// Outcome of a coherency transition.
#[derive(Debug, Clone, Copy)]
pub struct CoherencyResponse {
    /// Total coherency overhead in ns (excluding the base memory access).
    pub latency_ns: f64,
    pub new_state: MhsldCacheState,
    pub success: bool,
    /// Which node supplies the data.
    pub data_source_node: u32,
}

impl CoherencyResponse {
    fn failure() -> Self {
        Self {
            latency_ns: 0.0,
            new_state: MhsldCacheState::Invalid,
            success: false,
            data_source_node: NO_NODE,
        }
    }
}

/// Narrow outbound interface for coherency traffic, injected by the owner of
/// the fabric endpoint. Implementations must not block on acknowledgements.
pub trait CoherencyTransport: Send + Sync {
    fn send_invalidate(&self, target: u32, cacheline_addr: u64, version: u32) -> bool;
    fn send_downgrade(&self, target: u32, cacheline_addr: u64, version: u32) -> bool;
}

/// Per-head (host port) state.
pub struct HeadState {
    pub head_id: u32,
    active: AtomicBool,
    allocated_capacity: AtomicU64,
    used_capacity: AtomicU64,
    // f64 bandwidth share stored as bits.
    bandwidth_share: AtomicU64,
    total_reads: AtomicU64,
    total_writes: AtomicU64,
}

impl HeadState {
    fn new(head_id: u32) -> Self {
        Self {
            head_id,
            active: AtomicBool::new(false),
            allocated_capacity: AtomicU64::new(0),
            used_capacity: AtomicU64::new(0),
            bandwidth_share: AtomicU64::new(0f64.to_bits()),
            total_reads: AtomicU64::new(0),
            total_writes: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn share(&self) -> f64 {
        f64::from_bits(self.bandwidth_share.load(Ordering::Relaxed))
    }

    pub fn allocated_capacity(&self) -> u64 {
        self.allocated_capacity.load(Ordering::Relaxed)
    }

    pub fn used_capacity(&self) -> u64 {
        self.used_capacity.load(Ordering::Relaxed)
    }

    /// Track bytes resident through this head.
    pub fn record_usage(&self, bytes: u64) {
        self.used_capacity.fetch_add(bytes, Ordering::Relaxed);
    }

    fn traffic(&self) -> u64 {
        self.total_reads.load(Ordering::Relaxed) + self.total_writes.load(Ordering::Relaxed)
    }
}

/// Coherency statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoherencyStats {
    pub coherency_messages: u64,
    pub invalidations: u64,
    pub downgrades: u64,
    pub writebacks: u64,
    pub remote_ops: u64,
    pub avg_coherency_latency: f64,
}

pub struct CoherencyEngine {
    local_node_id: u32,
    decoder: Arc<HdmDecoder>,
    logp: Arc<LogPModel>,
    directory: Directory,
    fabric_links: RwLock<HashMap<u32, Arc<FabricLink>>>,
    transport: RwLock<Option<Arc<dyn CoherencyTransport>>>,
    heads: Vec<HeadState>,

    total_coherency_messages: AtomicU64,
    total_invalidations: AtomicU64,
    total_downgrades: AtomicU64,
    total_writebacks: AtomicU64,
    total_remote_ops: AtomicU64,
    total_latency_ns: AtomicU64,
    total_ops: AtomicU64,
}

/// Bump an entry's version, aborting on overflow (a version that wraps would
/// silently break monotonicity for every observer).
fn bump_version(entry: &mut DirectoryEntry) {
    entry.version = entry
        .version
        .checked_add(1)
        .expect("directory entry version overflow");
}

impl CoherencyEngine {
    pub fn new(local_node: u32, decoder: Arc<HdmDecoder>, logp: Arc<LogPModel>) -> Self {
        Self::with_heads(local_node, decoder, logp, MAX_HEADS)
    }

    pub fn with_heads(
        local_node: u32,
        decoder: Arc<HdmDecoder>,
        logp: Arc<LogPModel>,
        max_heads: u32,
    ) -> Self {
        let heads = (0..max_heads).map(HeadState::new).collect();
        Self {
            local_node_id: local_node,
            decoder,
            logp,
            directory: Directory::new(),
            fabric_links: RwLock::new(HashMap::new()),
            transport: RwLock::new(None),
            heads,
            total_coherency_messages: AtomicU64::new(0),
            total_invalidations: AtomicU64::new(0),
            total_downgrades: AtomicU64::new(0),
            total_writebacks: AtomicU64::new(0),
            total_remote_ops: AtomicU64::new(0),
            total_latency_ns: AtomicU64::new(0),
            total_ops: AtomicU64::new(0),
        }
    }

    pub fn local_node_id(&self) -> u32 {
        self.local_node_id
    }

    pub fn set_transport(&self, transport: Arc<dyn CoherencyTransport>) {
        *self.transport.write() = Some(transport);
    }

    pub fn register_fabric_link(&self, node_id: u32, link: Arc<FabricLink>) {
        self.fabric_links.write().insert(node_id, link);
    }

    /* ------------------------------------------------------------------ */
    /* Head management                                                    */
    /* ------------------------------------------------------------------ */

    pub fn head(&self, head_id: u32) -> Option<&HeadState> {
        self.heads.get(head_id as usize)
    }

    pub fn activate_head(&self, head_id: u32, capacity: u64) {
        let Some(head) = self.heads.get(head_id as usize) else {
            return;
        };
        head.active.store(true, Ordering::Relaxed);
        head.allocated_capacity.store(capacity, Ordering::Relaxed);
        head.used_capacity.store(0, Ordering::Relaxed);
        self.rebalance_heads();
    }

    pub fn deactivate_head(&self, head_id: u32) {
        let Some(head) = self.heads.get(head_id as usize) else {
            return;
        };
        head.active.store(false, Ordering::Relaxed);
        head.bandwidth_share.store(0f64.to_bits(), Ordering::Relaxed);
        self.rebalance_heads();
    }

    fn rebalance_heads(&self) {
        let active = self.heads.iter().filter(|h| h.is_active()).count();
        if active == 0 {
            return;
        }
        let share = 1.0 / active as f64;
        for head in self.heads.iter().filter(|h| h.is_active()) {
            head.bandwidth_share.store(share.to_bits(), Ordering::Relaxed);
        }
    }

    fn calculate_contention_latency(&self, head_id: u32) -> f64 {
        let Some(head) = self.heads.get(head_id as usize) else {
            return 0.0;
        };
        if !head.is_active() {
            return 0.0;
        }

        let contending = self
            .heads
            .iter()
            .filter(|h| h.is_active() && h.traffic() > 0)
            .count();
        if contending <= 1 {
            return 0.0;
        }

        let mut fair_share = head.share();
        if fair_share <= 0.0 {
            fair_share = 1.0 / contending as f64;
        }
        let additional = BASE_DEVICE_LATENCY_NS * (1.0 / fair_share - 1.0) * CONTENTION_FACTOR;
        additional.min(BASE_DEVICE_LATENCY_NS * CONTENTION_CAP)
    }

    /// Contention overhead the originating node pays when forwarding an op.
    pub fn local_access_overhead(&self, head_id: u32) -> f64 {
        self.calculate_contention_latency(head_id)
    }

    /* ------------------------------------------------------------------ */
    /* Latency helpers                                                    */
    /* ------------------------------------------------------------------ */

    fn coherency_msg_latency(&self, target: u32, ts: u64) -> f64 {
        let mut latency = 0.0;
        if let Some(link) = self.fabric_links.read().get(&target) {
            latency += link.traversal_latency(ts, CACHELINE_SIZE);
        }
        if target != self.local_node_id {
            latency += self.logp.message_latency(ts, target);
        }
        latency
    }

    fn send_invalidate(&self, target: u32, cl_addr: u64, version: u32) -> bool {
        if target == self.local_node_id {
            return true;
        }
        match self.transport.read().as_ref() {
            Some(transport) => transport.send_invalidate(target, cl_addr, version),
            None => true,
        }
    }

    fn send_downgrade(&self, target: u32, cl_addr: u64, version: u32) -> bool {
        if target == self.local_node_id {
            return true;
        }
        match self.transport.read().as_ref() {
            Some(transport) => transport.send_downgrade(target, cl_addr, version),
            None => true,
        }
    }

    /* ------------------------------------------------------------------ */
    /* Coherency actions (entry lock held by caller)                      */
    /* ------------------------------------------------------------------ */

    /// Invalidate every sharer except `except_node`. Messages are issued in
    /// parallel, with the LogP gap serializing successive issues on the
    /// link; the invalidation phase costs the max across peers.
    fn invalidate_sharers(
        &self,
        entry: &mut DirectoryEntry,
        except_node: u32,
        ts: u64,
    ) -> (f64, bool) {
        let targets: Vec<u32> = entry
            .sharer_nodes
            .iter()
            .copied()
            .filter(|&s| s != except_node)
            .collect();

        let mut max_latency = 0.0f64;
        let mut accumulated_gap = 0.0f64;
        let mut all_sent = true;
        for target in targets {
            let latency = accumulated_gap + self.coherency_msg_latency(target, ts);
            max_latency = max_latency.max(latency);
            accumulated_gap += self.logp.gap(target);

            self.total_invalidations.fetch_add(1, Ordering::Relaxed);
            self.total_coherency_messages.fetch_add(1, Ordering::Relaxed);
            all_sent &= self.send_invalidate(target, entry.cacheline_addr, entry.version);
        }

        entry.sharer_nodes.clear();
        (max_latency, all_sent)
    }

    /// Downgrade a conflicting owner so the requester can share the line.
    fn downgrade_owner(
        &self,
        entry: &mut DirectoryEntry,
        requesting_node: u32,
        ts: u64,
    ) -> (f64, bool) {
        let owner = entry.owner_node;
        if owner == NO_NODE || owner == requesting_node {
            return (0.0, true);
        }

        let latency = self.coherency_msg_latency(owner, ts);
        match entry.state {
            MhsldCacheState::Modified => {
                entry.state = MhsldCacheState::Owned;
                entry.has_dirty_data = true;
            }
            MhsldCacheState::Exclusive => {
                entry.sharer_nodes.insert(owner);
                entry.state = MhsldCacheState::Shared;
                entry.clear_owner();
            }
            _ => {}
        }

        self.total_downgrades.fetch_add(1, Ordering::Relaxed);
        self.total_coherency_messages.fetch_add(1, Ordering::Relaxed);
        let sent = self.send_downgrade(owner, entry.cacheline_addr, entry.version);
        (latency, sent)
    }

    /// Fetch the line from a modified remote owner; the owner learns about
    /// the transition through the DOWNGRADE message.
    fn fetch_from_owner(
        &self,
        entry: &mut DirectoryEntry,
        _requesting_node: u32,
        ts: u64,
    ) -> (f64, bool) {
        let owner = entry.owner_node;
        if owner == NO_NODE {
            return (0.0, true);
        }
        let latency = self.coherency_msg_latency(owner, ts);
        self.total_coherency_messages.fetch_add(1, Ordering::Relaxed);
        let sent = self.send_downgrade(owner, entry.cacheline_addr, entry.version);
        (latency, sent)
    }

    /* ------------------------------------------------------------------ */
    /* MOESI read state machine                                           */
    /* ------------------------------------------------------------------ */

    pub fn process_read(&self, req: &CoherencyRequest) -> CoherencyResponse {
        if !self.decoder.decode(req.addr).is_mapped() {
            return CoherencyResponse::failure();
        }
        if let Some(head) = self.heads.get(req.requesting_head as usize) {
            head.total_reads.fetch_add(1, Ordering::Relaxed);
        }

        let entry_arc = self.directory.get_or_create(req.addr);
        let mut entry = entry_arc.lock();
        entry.last_access_time = req.timestamp;

        let rollback = entry.rollback_point();
        let mut latency = 0.0f64;
        let mut data_source = self.local_node_id;
        let mut sends_ok = true;
        let mut mutated = false;
        let new_state;

        if entry.owner_node == req.requesting_node
            && matches!(
                entry.state,
                MhsldCacheState::Exclusive | MhsldCacheState::Modified | MhsldCacheState::Owned
            )
        {
            // Owner hit on another head of the same node.
            new_state = entry.state;
        } else if entry.sharer_nodes.contains(&req.requesting_node) {
            // Already a sharer.
            new_state = MhsldCacheState::Shared;
        } else {
            match entry.state {
                MhsldCacheState::Invalid => {
                    entry.sharer_nodes.insert(req.requesting_node);
                    entry.state = MhsldCacheState::Shared;
                    mutated = true;
                }
                MhsldCacheState::Shared => {
                    entry.sharer_nodes.insert(req.requesting_node);
                    mutated = true;
                }
                MhsldCacheState::Exclusive => {
                    data_source = entry.owner_node;
                    let (lat, ok) = self.downgrade_owner(&mut entry, req.requesting_node, req.timestamp);
                    latency += lat;
                    sends_ok &= ok;
                    entry.sharer_nodes.insert(req.requesting_node);
                    entry.state = MhsldCacheState::Shared;
                    mutated = true;
                }
                MhsldCacheState::Modified => {
                    data_source = entry.owner_node;
                    let (lat, ok) = self.fetch_from_owner(&mut entry, req.requesting_node, req.timestamp);
                    latency += lat;
                    sends_ok &= ok;
                    entry.state = MhsldCacheState::Owned;
                    entry.sharer_nodes.insert(req.requesting_node);
                    mutated = true;
                }
                MhsldCacheState::Owned => {
                    // Forward from the owner; the owner keeps the line in O.
                    data_source = entry.owner_node;
                    latency += self.coherency_msg_latency(entry.owner_node, req.timestamp);
                    self.total_coherency_messages.fetch_add(1, Ordering::Relaxed);
                    entry.sharer_nodes.insert(req.requesting_node);
                    mutated = true;
                }
            }
            new_state = MhsldCacheState::Shared;
        }

        if !sends_ok {
            entry.restore(rollback);
            return CoherencyResponse::failure();
        }
        if mutated {
            bump_version(&mut entry);
        }
        drop(entry);

        self.finish_op(req, latency);
        CoherencyResponse {
            latency_ns: latency + self.calculate_contention_latency(req.requesting_head),
            new_state,
            success: true,
            data_source_node: data_source,
        }
    }

    /* ------------------------------------------------------------------ */
    /* MOESI write state machine                                          */
    /* ------------------------------------------------------------------ */

    pub fn process_write(&self, req: &CoherencyRequest) -> CoherencyResponse {
        if !self.decoder.decode(req.addr).is_mapped() {
            return CoherencyResponse::failure();
        }
        if let Some(head) = self.heads.get(req.requesting_head as usize) {
            head.total_writes.fetch_add(1, Ordering::Relaxed);
        }

        let entry_arc = self.directory.get_or_create(req.addr);
        let mut entry = entry_arc.lock();
        entry.last_access_time = req.timestamp;

        let rollback = entry.rollback_point();
        let mut latency = 0.0f64;
        let mut data_source = self.local_node_id;
        let mut sends_ok = true;

        if entry.owner_node == req.requesting_node
            && matches!(
                entry.state,
                MhsldCacheState::Exclusive | MhsldCacheState::Modified
            )
        {
            // Owner upgrade / write hit.
            entry.state = MhsldCacheState::Modified;
            entry.has_dirty_data = true;
        } else if entry.owner_node == req.requesting_node
            && entry.state == MhsldCacheState::Owned
        {
            // Owner writes an O line: residual sharers must go.
            let (lat, ok) = self.invalidate_sharers(&mut entry, req.requesting_node, req.timestamp);
            latency += lat;
            sends_ok &= ok;
            entry.state = MhsldCacheState::Modified;
            entry.has_dirty_data = true;
        } else {
            match entry.state {
                MhsldCacheState::Invalid => {}
                MhsldCacheState::Shared => {
                    let (lat, ok) =
                        self.invalidate_sharers(&mut entry, req.requesting_node, req.timestamp);
                    latency += lat;
                    sends_ok &= ok;
                }
                MhsldCacheState::Exclusive => {
                    latency += self.coherency_msg_latency(entry.owner_node, req.timestamp);
                    self.total_invalidations.fetch_add(1, Ordering::Relaxed);
                    self.total_coherency_messages.fetch_add(1, Ordering::Relaxed);
                    sends_ok &=
                        self.send_invalidate(entry.owner_node, entry.cacheline_addr, entry.version);
                }
                MhsldCacheState::Modified => {
                    // Fetch + invalidate the previous owner.
                    data_source = entry.owner_node;
                    latency += self.coherency_msg_latency(entry.owner_node, req.timestamp);
                    self.total_writebacks.fetch_add(1, Ordering::Relaxed);
                    self.total_coherency_messages.fetch_add(1, Ordering::Relaxed);
                    sends_ok &=
                        self.send_invalidate(entry.owner_node, entry.cacheline_addr, entry.version);
                }
                MhsldCacheState::Owned => {
                    data_source = entry.owner_node;
                    let owner_latency = self.coherency_msg_latency(entry.owner_node, req.timestamp);
                    self.total_writebacks.fetch_add(1, Ordering::Relaxed);
                    self.total_coherency_messages.fetch_add(1, Ordering::Relaxed);
                    sends_ok &=
                        self.send_invalidate(entry.owner_node, entry.cacheline_addr, entry.version);
                    let (sharer_latency, ok) =
                        self.invalidate_sharers(&mut entry, req.requesting_node, req.timestamp);
                    sends_ok &= ok;
                    latency += owner_latency + sharer_latency;
                }
            }

            entry.owner_node = req.requesting_node;
            entry.owner_head = req.requesting_head;
            entry.state = MhsldCacheState::Modified;
            entry.sharer_nodes.clear();
            entry.has_dirty_data = true;
        }

        if !sends_ok {
            entry.restore(rollback);
            return CoherencyResponse::failure();
        }
        // Every successful write mutates the line.
        bump_version(&mut entry);
        drop(entry);

        self.finish_op(req, latency);
        CoherencyResponse {
            latency_ns: latency + self.calculate_contention_latency(req.requesting_head),
            new_state: MhsldCacheState::Modified,
            success: true,
            data_source_node: data_source,
        }
    }

    /// Atomic = exclusive access plus a serialization penalty.
    pub fn process_atomic(&self, req: &CoherencyRequest) -> CoherencyResponse {
        let mut resp = self.process_write(req);
        if resp.success {
            resp.latency_ns += self.logp.serialization_overhead();
        }
        resp
    }

    fn finish_op(&self, req: &CoherencyRequest, latency: f64) {
        if req.requesting_node != self.local_node_id {
            self.total_remote_ops.fetch_add(1, Ordering::Relaxed);
        }
        self.total_ops.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ns
            .fetch_add(latency as u64, Ordering::Relaxed);
    }

    /* ------------------------------------------------------------------ */
    /* Remote message handlers (applied at any caching node)              */
    /* ------------------------------------------------------------------ */

    pub fn handle_remote_invalidate(&self, addr: u64, from_node: u32) {
        let cl_addr = cacheline_addr(addr);
        let Some(entry_arc) = self.directory.lookup(cl_addr) else {
            return;
        };
        let mut entry = entry_arc.lock();
        let mut mutated = entry.sharer_nodes.remove(&self.local_node_id);

        if entry.owner_node == self.local_node_id {
            if entry.state == MhsldCacheState::Modified {
                // Our dirty copy is being taken; account the writeback.
                self.total_writebacks.fetch_add(1, Ordering::Relaxed);
            }
            entry.clear_owner();
            entry.state = MhsldCacheState::Invalid;
            entry.sharer_nodes.clear();
            entry.has_dirty_data = false;
            mutated = true;
        }
        if mutated {
            bump_version(&mut entry);
        }
        drop(entry);

        log::debug!(
            "Invalidated cacheline 0x{:x} on request from node {}",
            cl_addr,
            from_node
        );
        self.total_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handle_remote_downgrade(&self, addr: u64, from_node: u32) {
        let cl_addr = cacheline_addr(addr);
        let Some(entry_arc) = self.directory.lookup(cl_addr) else {
            return;
        };
        let mut entry = entry_arc.lock();

        if entry.owner_node == self.local_node_id {
            match entry.state {
                MhsldCacheState::Modified => {
                    entry.state = MhsldCacheState::Owned;
                    bump_version(&mut entry);
                }
                MhsldCacheState::Exclusive => {
                    entry.sharer_nodes.insert(self.local_node_id);
                    entry.state = MhsldCacheState::Shared;
                    entry.clear_owner();
                    bump_version(&mut entry);
                }
                _ => {}
            }
        }
        drop(entry);

        log::debug!(
            "Downgraded cacheline 0x{:x} on request from node {}",
            cl_addr,
            from_node
        );
        self.total_downgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handle_remote_writeback(&self, addr: u64, from_node: u32, _data: &[u8]) {
        let cl_addr = cacheline_addr(addr);
        if let Some(entry_arc) = self.directory.lookup(cl_addr) {
            let mut entry = entry_arc.lock();
            if entry.owner_node == from_node {
                entry.has_dirty_data = false;
                entry.clear_owner();
                entry.state = MhsldCacheState::Invalid;
                entry.sharer_nodes.clear();
                bump_version(&mut entry);
            }
        }
        self.total_writebacks.fetch_add(1, Ordering::Relaxed);
    }

    /* ------------------------------------------------------------------ */
    /* Introspection                                                      */
    /* ------------------------------------------------------------------ */

    pub fn entry_snapshot(&self, addr: u64) -> Option<DirectoryEntrySnapshot> {
        self.directory.entry_snapshot(addr)
    }

    pub fn directory_snapshots(&self) -> Vec<DirectoryEntrySnapshot> {
        self.directory.snapshots()
    }

    pub fn directory_len(&self) -> usize {
        self.directory.len()
    }

    pub fn get_stats(&self) -> CoherencyStats {
        let ops = self.total_ops.load(Ordering::Relaxed);
        let latency = self.total_latency_ns.load(Ordering::Relaxed);
        CoherencyStats {
            coherency_messages: self.total_coherency_messages.load(Ordering::Relaxed),
            invalidations: self.total_invalidations.load(Ordering::Relaxed),
            downgrades: self.total_downgrades.load(Ordering::Relaxed),
            writebacks: self.total_writebacks.load(Ordering::Relaxed),
            remote_ops: self.total_remote_ops.load(Ordering::Relaxed),
            avg_coherency_latency: if ops > 0 { latency as f64 / ops as f64 } else { 0.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{HdmDecoder, HdmDecoderMode};
    use crate::latency::{LogPConfig, LogPModel};
    use crate::util::now_ns;

    fn engine_for(local_node: u32) -> CoherencyEngine {
        let decoder = Arc::new(HdmDecoder::new(HdmDecoderMode::RangeBased));
        decoder.add_range(0x1000_0000, 0x100_0000, 0, false).unwrap();
        let logp = Arc::new(LogPModel::new(LogPConfig::default()));
        CoherencyEngine::new(local_node, decoder, logp)
    }

    fn read_req(addr: u64, node: u32) -> CoherencyRequest {
        CoherencyRequest {
            addr,
            requesting_node: node,
            requesting_head: 0,
            is_write: false,
            timestamp: now_ns(),
        }
    }

    fn write_req(addr: u64, node: u32) -> CoherencyRequest {
        CoherencyRequest {
            is_write: true,
            ..read_req(addr, node)
        }
    }

    fn assert_invariants(engine: &CoherencyEngine) {
        for snap in engine.directory_snapshots() {
            snap.check_invariants().unwrap();
        }
    }

    #[test]
    fn test_read_then_write_scenario() {
        // Node 0 is home. Nodes 1 and 2 read, then node 0 writes.
        let engine = engine_for(0);
        let addr = 0x1000_0040u64;

        let r1 = engine.process_read(&read_req(addr, 1));
        assert!(r1.success);
        assert_eq!(r1.new_state, MhsldCacheState::Shared);
        let v1 = engine.entry_snapshot(addr).unwrap().version;
        assert_invariants(&engine);

        let r2 = engine.process_read(&read_req(addr, 2));
        assert!(r2.success);
        let snap = engine.entry_snapshot(addr).unwrap();
        assert_eq!(snap.state, MhsldCacheState::Shared);
        assert!(snap.sharer_nodes.contains(&1) && snap.sharer_nodes.contains(&2));
        assert!(snap.version > v1);
        assert_invariants(&engine);

        let w = engine.process_write(&write_req(addr, 0));
        assert!(w.success);
        assert_eq!(w.new_state, MhsldCacheState::Modified);
        let after = engine.entry_snapshot(addr).unwrap();
        assert_eq!(after.state, MhsldCacheState::Modified);
        assert_eq!(after.owner_node, 0);
        assert!(after.sharer_nodes.is_empty());
        assert!(after.version > snap.version);
        assert_invariants(&engine);

        let stats = engine.get_stats();
        assert_eq!(stats.invalidations, 2);
        assert_eq!(stats.coherency_messages, 2);
        assert_eq!(stats.remote_ops, 2);
        // Invalidations were issued in parallel: latency is the max across
        // peers, i.e. one message latency plus one gap at most.
        assert!(w.latency_ns >= 190.0 && w.latency_ns < 2.0 * 190.0);
    }

    #[test]
    fn test_unmapped_address_fails() {
        let engine = engine_for(0);
        let resp = engine.process_read(&read_req(0x9999_0000_0000, 0));
        assert!(!resp.success);
        assert_eq!(resp.latency_ns, 0.0);
        assert_eq!(engine.directory_len(), 0);
    }

    #[test]
    fn test_write_hit_keeps_owner() {
        let engine = engine_for(0);
        let addr = 0x1000_0000u64;

        assert!(engine.process_write(&write_req(addr, 0)).success);
        let v = engine.entry_snapshot(addr).unwrap().version;
        assert!(engine.process_write(&write_req(addr, 0)).success);
        let snap = engine.entry_snapshot(addr).unwrap();
        assert_eq!(snap.state, MhsldCacheState::Modified);
        assert_eq!(snap.owner_node, 0);
        assert!(snap.version > v);
        assert_eq!(engine.get_stats().invalidations, 0);
    }

    #[test]
    fn test_read_downgrades_modified_owner_to_owned() {
        let engine = engine_for(0);
        let addr = 0x1000_0080u64;

        assert!(engine.process_write(&write_req(addr, 1)).success);
        let r = engine.process_read(&read_req(addr, 2));
        assert!(r.success);
        assert_eq!(r.data_source_node, 1);
        // One message latency to the owner.
        assert!(r.latency_ns >= 190.0);

        let snap = engine.entry_snapshot(addr).unwrap();
        assert_eq!(snap.state, MhsldCacheState::Owned);
        assert_eq!(snap.owner_node, 1);
        assert!(snap.sharer_nodes.contains(&2));
        assert!(snap.has_dirty_data);
        assert_invariants(&engine);
        assert_eq!(engine.get_stats().coherency_messages, 1);
    }

    #[test]
    fn test_owned_write_invalidates_owner_and_sharers() {
        let engine = engine_for(0);
        let addr = 0x1000_00C0u64;

        assert!(engine.process_write(&write_req(addr, 1)).success);
        assert!(engine.process_read(&read_req(addr, 2)).success); // 1: M -> O
        let w = engine.process_write(&write_req(addr, 3));
        assert!(w.success);
        assert_eq!(w.data_source_node, 1);

        let snap = engine.entry_snapshot(addr).unwrap();
        assert_eq!(snap.state, MhsldCacheState::Modified);
        assert_eq!(snap.owner_node, 3);
        assert!(snap.sharer_nodes.is_empty());
        assert_invariants(&engine);

        let stats = engine.get_stats();
        assert!(stats.writebacks >= 1);
        assert!(stats.invalidations >= 1);
    }

    #[test]
    fn test_atomic_adds_serialization_overhead() {
        let engine = engine_for(0);
        let addr = 0x1000_0100u64;

        let w = engine.process_write(&write_req(addr, 0));
        let a = engine.process_atomic(&write_req(addr, 0));
        assert!(a.success);
        assert!((a.latency_ns - w.latency_ns - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_remote_handlers() {
        // This engine plays the non-home caching node (node 2).
        let engine = engine_for(2);
        let addr = 0x1000_0140u64;

        // Local write makes node 2 the modified owner in its own view.
        assert!(engine.process_write(&write_req(addr, 2)).success);

        engine.handle_remote_downgrade(addr, 0);
        let snap = engine.entry_snapshot(addr).unwrap();
        assert_eq!(snap.state, MhsldCacheState::Owned);
        assert_invariants(&engine);

        engine.handle_remote_invalidate(addr, 0);
        let snap = engine.entry_snapshot(addr).unwrap();
        assert_eq!(snap.state, MhsldCacheState::Invalid);
        assert_eq!(snap.owner_node, NO_NODE);
        assert!(snap.sharer_nodes.is_empty());
        assert_invariants(&engine);
    }

    #[test]
    fn test_remote_writeback_clears_entry() {
        let engine = engine_for(0);
        let addr = 0x1000_0180u64;

        assert!(engine.process_write(&write_req(addr, 1)).success);
        engine.handle_remote_writeback(addr, 1, &[0u8; 64]);

        let snap = engine.entry_snapshot(addr).unwrap();
        assert_eq!(snap.state, MhsldCacheState::Invalid);
        assert!(!snap.has_dirty_data);
        assert!(engine.get_stats().writebacks >= 1);
        assert_invariants(&engine);
    }

    #[test]
    fn test_registered_link_adds_traversal_latency() {
        use crate::latency::{FabricLink, FabricLinkConfig};
        let engine = engine_for(0);
        engine.register_fabric_link(
            1,
            Arc::new(FabricLink::new(FabricLinkConfig {
                hop_latency_ns: 100.0,
                bandwidth_gbps: 64.0,
                credits: 32,
            })),
        );

        let addr = 0x1000_0240u64;
        assert!(engine.process_write(&write_req(addr, 1)).success);
        // Reading from node 2 downgrades node 1; the link contributes its
        // hop latency plus one cacheline of serialization (1ns at 64B/ns).
        let r = engine.process_read(&read_req(addr, 2));
        assert!(r.success);
        assert!((r.latency_ns - (190.0 + 101.0)).abs() < 1e-6);
    }

    struct FailingTransport;
    impl CoherencyTransport for FailingTransport {
        fn send_invalidate(&self, _target: u32, _addr: u64, _version: u32) -> bool {
            false
        }
        fn send_downgrade(&self, _target: u32, _addr: u64, _version: u32) -> bool {
            false
        }
    }

    #[test]
    fn test_send_failure_rolls_back() {
        let engine = engine_for(0);
        let addr = 0x1000_01C0u64;

        assert!(engine.process_read(&read_req(addr, 1)).success);
        let before = engine.entry_snapshot(addr).unwrap();

        engine.set_transport(Arc::new(FailingTransport));
        let resp = engine.process_write(&write_req(addr, 2));
        assert!(!resp.success);
        assert_eq!(resp.latency_ns, 0.0);

        let after = engine.entry_snapshot(addr).unwrap();
        assert_eq!(after.state, before.state);
        assert_eq!(after.version, before.version);
        assert_eq!(after.sharer_nodes, before.sharer_nodes);
        assert_invariants(&engine);
    }

    #[test]
    fn test_contention_between_heads() {
        let engine = engine_for(0);
        engine.activate_head(0, 1 << 30);
        engine.activate_head(1, 1 << 30);

        let addr = 0x1000_0200u64;
        // Build up traffic on both heads.
        let mut req0 = write_req(addr, 0);
        req0.requesting_head = 0;
        let mut req1 = write_req(addr + 64, 0);
        req1.requesting_head = 1;
        assert!(engine.process_write(&req0).success);
        assert!(engine.process_write(&req1).success);

        // With two contending heads at 0.5 share: 100 * (2 - 1) * 0.3 = 30ns.
        let resp = engine.process_write(&write_req(addr, 0));
        assert!((resp.latency_ns - 30.0).abs() < 1e-9);

        engine.deactivate_head(1);
        let resp = engine.process_write(&write_req(addr, 0));
        assert_eq!(resp.latency_ns, 0.0);
    }

    #[test]
    fn test_randomized_invariants_hold() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let engine = engine_for(0);
        let lines: Vec<u64> = (0..8).map(|i| 0x1000_0000 + i * 64).collect();

        let mut last_versions = std::collections::HashMap::new();
        for _ in 0..2000 {
            let addr = lines[rng.gen_range(0..lines.len())];
            let node = rng.gen_range(0..4u32);
            let resp = if rng.gen_bool(0.5) {
                engine.process_read(&read_req(addr, node))
            } else if rng.gen_bool(0.2) {
                engine.process_atomic(&write_req(addr, node))
            } else {
                engine.process_write(&write_req(addr, node))
            };
            assert!(resp.success);

            for snap in engine.directory_snapshots() {
                snap.check_invariants().unwrap();
                let last = last_versions
                    .entry(snap.cacheline_addr)
                    .or_insert(snap.version);
                assert!(snap.version >= *last, "version moved backwards");
                *last = snap.version;
            }
        }
    }
}
