//! Per-node memory server.
//!
//! Owns the node's data segment, coherency engine, HDM decoder view and
//! fabric endpoint. Local operations run the coherency protocol and touch
//! local memory; operations whose home is another node are forwarded over
//! the fabric and awaited with a timeout. Ownership is strictly tree-shaped:
//! the server owns its components, and the coherency engine reaches the
//! fabric only through the narrow `CoherencyTransport` interface installed
//! here.

use crate::coherency::{
    CoherencyEngine, CoherencyRequest, CoherencyStats, CoherencyTransport, MhsldCacheState,
    NO_NODE,
};
use crate::decoder::{HdmDecoder, HdmDecoderMode};
use crate::error::{CxlError, CxlResult};
use crate::fabric::{
    CoherencyPayload, Envelope, MemPayload, MessageFabric, MsgType, NodePayload, NodeRegistration,
    NodeState, BROADCAST_NODE, STATUS_ERROR, STATUS_OK,
};
use crate::latency::{FabricLink, FabricLinkConfig, LogPConfig, LogPModel};
use crate::memory::SharedMemoryManager;
use crate::util::{cacheline_addr, now_ns, CACHELINE_SIZE};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Extra latency charged for the home-side RMW of an atomic (ns).
const ATOMIC_OVERHEAD_NS: u64 = 20;
/// Peers silent for this long are marked offline.
const PEER_TIMEOUT_NS: u64 = 10_000_000_000;
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// Node server construction parameters.
#[derive(Debug, Clone)]
pub struct NodeServerConfig {
    pub node_id: u32,
    /// Fabric segment name; the data segment is `{shm_name}_node{id}`.
    pub shm_name: String,
    pub capacity_mb: usize,
    /// Explicit memory base; None consults `CXL_BASE_ADDR`.
    pub memory_base: Option<u64>,
    pub decoder_mode: HdmDecoderMode,
    pub logp: LogPConfig,
    /// Base device latency charged on every local/home access (ns).
    pub local_latency_ns: f64,
    pub request_timeout_ms: u64,
    pub hostname: String,
}

impl NodeServerConfig {
    pub fn new(node_id: u32, shm_name: &str) -> Self {
        Self {
            node_id,
            shm_name: shm_name.to_string(),
            capacity_mb: 64,
            memory_base: None,
            decoder_mode: HdmDecoderMode::RangeBased,
            logp: LogPConfig::default(),
            local_latency_ns: 85.0,
            request_timeout_ms: 5000,
            hostname: format!("node{}", node_id),
        }
    }
}

/// A peer as learned from registration and heartbeats.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub node_id: u32,
    pub hostname: String,
    pub state: NodeState,
    pub memory_base: u64,
    pub memory_size: u64,
    pub last_heartbeat: u64,
}

#[derive(Default)]
struct ServerCounters {
    local_reads: AtomicU64,
    local_writes: AtomicU64,
    remote_reads: AtomicU64,
    remote_writes: AtomicU64,
    forwarded_requests: AtomicU64,
    coherency_messages: AtomicU64,
}

/// Server statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStats {
    pub local_reads: u64,
    pub local_writes: u64,
    pub remote_reads: u64,
    pub remote_writes: u64,
    pub forwarded_requests: u64,
    pub coherency_messages: u64,
}

/// Sends coherency protocol messages through the fabric endpoint.
struct FabricCoherencyTransport {
    fabric: Arc<MessageFabric>,
    local_node: u32,
}

impl FabricCoherencyTransport {
    fn coherency_envelope(
        &self,
        msg_type: MsgType,
        target: u32,
        cl_addr: u64,
        version: u32,
    ) -> Envelope {
        let mut env = Envelope::new(msg_type, self.fabric.generate_msg_id(), self.local_node, target);
        let payload = CoherencyPayload {
            cacheline_addr: cl_addr,
            requesting_node: self.local_node,
            owner_node: NO_NODE,
            version,
            ..Default::default()
        };
        env.set_coherency_payload(&payload);
        env
    }
}

impl CoherencyTransport for FabricCoherencyTransport {
    fn send_invalidate(&self, target: u32, cacheline_addr: u64, version: u32) -> bool {
        let env = self.coherency_envelope(MsgType::Invalidate, target, cacheline_addr, version);
        self.fabric.send(target, &env)
    }

    fn send_downgrade(&self, target: u32, cacheline_addr: u64, version: u32) -> bool {
        let env = self.coherency_envelope(MsgType::Downgrade, target, cacheline_addr, version);
        self.fabric.send(target, &env)
    }
}

pub struct NodeServer {
    config: NodeServerConfig,
    memory: Arc<SharedMemoryManager>,
    fabric: Arc<MessageFabric>,
    coherency: Arc<CoherencyEngine>,
    decoder: Arc<HdmDecoder>,
    logp: Arc<LogPModel>,
    nodes: RwLock<HashMap<u32, PeerInfo>>,
    state: AtomicU32,
    running: Arc<AtomicBool>,
    heartbeat_thread: Mutex<Option<JoinHandle<()>>>,
    stats: ServerCounters,
}

impl NodeServer {
    /// Build the server and register it on the fabric. Node 0 creates the
    /// shared message segment; other ids open the existing one.
    pub fn new(config: NodeServerConfig) -> CxlResult<Arc<Self>> {
        let data_shm = format!("{}_node{}", config.shm_name, config.node_id);
        let memory = Arc::new(SharedMemoryManager::new(
            config.capacity_mb,
            &data_shm,
            config.memory_base,
        )?);
        let shm_info = memory.get_shm_info();
        let data_capacity = shm_info.num_cachelines * CACHELINE_SIZE;

        let is_coordinator = config.node_id == 0;
        let fabric = Arc::new(MessageFabric::new(
            &config.shm_name,
            config.node_id,
            is_coordinator,
        )?);

        let decoder = Arc::new(HdmDecoder::new(config.decoder_mode));
        decoder.add_range(shm_info.base_addr, data_capacity, config.node_id, false)?;

        let logp = Arc::new(LogPModel::new(config.logp));
        let coherency = Arc::new(CoherencyEngine::new(
            config.node_id,
            Arc::clone(&decoder),
            Arc::clone(&logp),
        ));

        fabric.register_node(&NodeRegistration {
            node_id: config.node_id,
            hostname: config.hostname.clone(),
            memory_base: shm_info.base_addr,
            memory_size: data_capacity,
        })?;

        log::info!(
            "Distributed node {} initialized: memory 0x{:x}-0x{:x} ({} MB)",
            config.node_id,
            shm_info.base_addr,
            shm_info.base_addr + data_capacity,
            config.capacity_mb
        );

        Ok(Arc::new(Self {
            config,
            memory,
            fabric,
            coherency,
            decoder,
            logp,
            nodes: RwLock::new(HashMap::new()),
            state: AtomicU32::new(NodeState::Ready as u32),
            running: Arc::new(AtomicBool::new(false)),
            heartbeat_thread: Mutex::new(None),
            stats: ServerCounters::default(),
        }))
    }

    /// Install handlers, start fabric workers and the heartbeat loop, and
    /// announce this node to the cluster.
    pub fn start(self: &Arc<Self>) -> CxlResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.coherency.set_transport(Arc::new(FabricCoherencyTransport {
            fabric: Arc::clone(&self.fabric),
            local_node: self.config.node_id,
        }));

        self.setup_message_handlers();
        self.fabric.start_processing();
        if self.fabric.is_coordinator() {
            self.fabric.set_system_ready(true);
        }
        self.join_cluster();

        let server = Arc::downgrade(self);
        let running = Arc::clone(&self.running);
        *self.heartbeat_thread.lock() = Some(
            std::thread::Builder::new()
                .name(format!("cxl-heartbeat-{}", self.config.node_id))
                .spawn(move || heartbeat_loop(server, running))
                .map_err(|e| CxlError::InitializationFailed(e.to_string()))?,
        );

        log::info!("Distributed node {} started", self.config.node_id);
        Ok(())
    }

    /// Quiesce workers, leave the cluster and release the fabric endpoint.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.state
            .store(NodeState::Draining as u32, Ordering::Release);

        if let Some(handle) = self.heartbeat_thread.lock().take() {
            // The final Arc can be dropped from the heartbeat thread itself;
            // joining it from there would deadlock.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        self.leave_cluster();
        self.fabric.stop_processing();
        let _ = self.fabric.deregister_node(self.config.node_id);

        self.state.store(NodeState::Offline as u32, Ordering::Release);
        log::info!("Distributed node {} stopped", self.config.node_id);
    }

    /// Announce this node to all active peers.
    pub fn join_cluster(&self) {
        let shm_info = self.memory.get_shm_info();
        let mut payload = NodePayload::default();
        payload.node_id = self.config.node_id;
        payload.node_state = NodeState::Ready as u32;
        payload.memory_base = shm_info.base_addr;
        payload.memory_size = shm_info.num_cachelines * CACHELINE_SIZE;
        payload.num_cachelines = shm_info.num_cachelines;
        payload.set_hostname(&self.config.hostname);

        let mut env = Envelope::new(
            MsgType::NodeRegister,
            self.fabric.generate_msg_id(),
            self.config.node_id,
            BROADCAST_NODE,
        );
        env.set_node_payload(&payload);
        self.fabric.broadcast(&env);
        log::info!("Node {} joined cluster", self.config.node_id);
    }

    /// Broadcast departure so peers mark this node offline immediately.
    pub fn leave_cluster(&self) {
        let mut payload = NodePayload::default();
        payload.node_id = self.config.node_id;
        payload.node_state = NodeState::Offline as u32;

        let mut env = Envelope::new(
            MsgType::NodeDeregister,
            self.fabric.generate_msg_id(),
            self.config.node_id,
            BROADCAST_NODE,
        );
        env.set_node_payload(&payload);
        self.fabric.broadcast(&env);
        log::info!("Node {} left cluster", self.config.node_id);
    }

    /* ------------------------------------------------------------------ */
    /* Accessors                                                          */
    /* ------------------------------------------------------------------ */

    pub fn node_id(&self) -> u32 {
        self.config.node_id
    }

    pub fn node_state(&self) -> NodeState {
        NodeState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn decoder(&self) -> &Arc<HdmDecoder> {
        &self.decoder
    }

    pub fn coherency(&self) -> &Arc<CoherencyEngine> {
        &self.coherency
    }

    pub fn memory(&self) -> &Arc<SharedMemoryManager> {
        &self.memory
    }

    pub fn fabric(&self) -> &Arc<MessageFabric> {
        &self.fabric
    }

    pub fn logp(&self) -> &Arc<LogPModel> {
        &self.logp
    }

    /// Model a dedicated fabric link to `node_id`; the coherency engine adds
    /// its traversal delay on top of the LogP cost for that peer.
    pub fn register_fabric_link(&self, node_id: u32, config: FabricLinkConfig) {
        self.coherency
            .register_fabric_link(node_id, Arc::new(FabricLink::new(config)));
    }

    pub fn get_cluster_nodes(&self) -> Vec<PeerInfo> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn add_remote_node(&self, info: PeerInfo) {
        self.nodes.write().insert(info.node_id, info);
    }

    pub fn get_stats(&self) -> ServerStats {
        ServerStats {
            local_reads: self.stats.local_reads.load(Ordering::Relaxed),
            local_writes: self.stats.local_writes.load(Ordering::Relaxed),
            remote_reads: self.stats.remote_reads.load(Ordering::Relaxed),
            remote_writes: self.stats.remote_writes.load(Ordering::Relaxed),
            forwarded_requests: self.stats.forwarded_requests.load(Ordering::Relaxed),
            coherency_messages: self.stats.coherency_messages.load(Ordering::Relaxed),
        }
    }

    pub fn coherency_stats(&self) -> CoherencyStats {
        self.coherency.get_stats()
    }

    /* ------------------------------------------------------------------ */
    /* Address routing                                                    */
    /* ------------------------------------------------------------------ */

    pub fn get_node_for_address(&self, addr: u64) -> u32 {
        self.decoder.get_home_node(addr)
    }

    pub fn is_local_address(&self, addr: u64) -> bool {
        self.memory.contains(addr)
    }

    /// Resolve the home node, falling back to the local segment for
    /// addresses the decoder does not know.
    fn route(&self, addr: u64) -> CxlResult<u32> {
        let decoded = self.decoder.decode(addr);
        if decoded.is_mapped() {
            return Ok(decoded.target_id);
        }
        if self.memory.contains(addr) {
            return Ok(self.config.node_id);
        }
        Err(CxlError::Address(addr))
    }

    fn check_peer(&self, target: u32) -> CxlResult<()> {
        if let Some(peer) = self.nodes.read().get(&target) {
            if peer.state == NodeState::Offline {
                return Err(CxlError::PeerOffline(target));
            }
        }
        Ok(())
    }

    fn coherency_request(&self, addr: u64, is_write: bool) -> CoherencyRequest {
        CoherencyRequest {
            addr,
            requesting_node: self.config.node_id,
            requesting_head: 0,
            is_write,
            timestamp: now_ns(),
        }
    }

    /* ------------------------------------------------------------------ */
    /* Public memory operations                                           */
    /* ------------------------------------------------------------------ */

    /// Read `buf.len()` bytes at `addr`; returns the modeled latency in ns.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> CxlResult<u64> {
        let target = self.route(addr)?;

        if target == self.config.node_id || self.memory.contains(addr) {
            self.stats.local_reads.fetch_add(1, Ordering::Relaxed);
            let cohr = self.coherency.process_read(&self.coherency_request(addr, false));
            if !cohr.success {
                return Err(CxlError::Coherency(format!(
                    "read coherency failed for 0x{:x}",
                    addr
                )));
            }
            self.memory.read_cacheline(addr, buf)?;
            return Ok((self.config.local_latency_ns + cohr.latency_ns) as u64);
        }

        self.forward_read(target, addr, buf)
    }

    /// Write `data` at `addr`; returns the modeled latency in ns.
    pub fn write(&self, addr: u64, data: &[u8]) -> CxlResult<u64> {
        let target = self.route(addr)?;

        if target == self.config.node_id || self.memory.contains(addr) {
            self.stats.local_writes.fetch_add(1, Ordering::Relaxed);
            let cohr = self.coherency.process_write(&self.coherency_request(addr, true));
            if !cohr.success {
                return Err(CxlError::Coherency(format!(
                    "write coherency failed for 0x{:x}",
                    addr
                )));
            }
            self.memory.write_cacheline(addr, data)?;
            return Ok((self.config.local_latency_ns + cohr.latency_ns) as u64);
        }

        self.forward_write(target, addr, data)
    }

    /// Atomic fetch-add on the u64 at `addr`; returns (old value, latency).
    pub fn atomic_faa(&self, addr: u64, value: u64) -> CxlResult<(u64, u64)> {
        let target = self.route(addr)?;
        if target == self.config.node_id {
            self.stats.local_writes.fetch_add(1, Ordering::Relaxed);
            return self.local_atomic_faa(addr, value, self.config.node_id);
        }
        self.check_peer(target)?;
        self.stats.forwarded_requests.fetch_add(1, Ordering::Relaxed);
        self.stats.remote_writes.fetch_add(1, Ordering::Relaxed);

        let mut env = Envelope::new(
            MsgType::AtomicFaaReq,
            self.fabric.generate_msg_id(),
            self.config.node_id,
            target,
        );
        let payload = MemPayload {
            addr,
            size: 8,
            value,
            client_id: self.config.node_id,
            ..Default::default()
        };
        env.set_mem_payload(&payload);

        let resp = self
            .fabric
            .send_and_wait(target, &env, self.config.request_timeout_ms)
            .ok_or_else(|| CxlError::timeout(format!("atomic_faa to node {}", target)))?;
        let mem = resp.mem_payload();
        if mem.status != STATUS_OK {
            return Err(CxlError::Remote {
                node: target,
                status: mem.status,
            });
        }
        let latency =
            mem.latency_ns + self.logp.message_latency(now_ns(), target) as u64;
        Ok((mem.value, latency))
    }

    /// Atomic compare-and-swap; returns (observed value, latency).
    pub fn atomic_cas(&self, addr: u64, expected: u64, desired: u64) -> CxlResult<(u64, u64)> {
        let target = self.route(addr)?;
        if target == self.config.node_id {
            self.stats.local_writes.fetch_add(1, Ordering::Relaxed);
            return self.local_atomic_cas(addr, expected, desired, self.config.node_id);
        }
        self.check_peer(target)?;
        self.stats.forwarded_requests.fetch_add(1, Ordering::Relaxed);
        self.stats.remote_writes.fetch_add(1, Ordering::Relaxed);

        let mut env = Envelope::new(
            MsgType::AtomicCasReq,
            self.fabric.generate_msg_id(),
            self.config.node_id,
            target,
        );
        let payload = MemPayload {
            addr,
            size: 8,
            value: desired,
            expected,
            client_id: self.config.node_id,
            ..Default::default()
        };
        env.set_mem_payload(&payload);

        let resp = self
            .fabric
            .send_and_wait(target, &env, self.config.request_timeout_ms)
            .ok_or_else(|| CxlError::timeout(format!("atomic_cas to node {}", target)))?;
        let mem = resp.mem_payload();
        if mem.status != STATUS_OK {
            return Err(CxlError::Remote {
                node: target,
                status: mem.status,
            });
        }
        let latency =
            mem.latency_ns + self.logp.message_latency(now_ns(), target) as u64;
        Ok((mem.value, latency))
    }

    /// SMP fence locally, then a best-effort FENCE broadcast to all peers.
    pub fn fence(&self) {
        fence(Ordering::SeqCst);
        let env = Envelope::new(
            MsgType::FenceReq,
            self.fabric.generate_msg_id(),
            self.config.node_id,
            BROADCAST_NODE,
        );
        self.fabric.broadcast(&env);
    }

    /// Push a dirty cacheline back to its home node.
    pub fn writeback(&self, addr: u64, data: &[u8; 64]) -> CxlResult<()> {
        let cl_addr = cacheline_addr(addr);
        let target = self.route(cl_addr)?;

        if target == self.config.node_id {
            self.memory.write_cacheline(cl_addr, data)?;
            self.coherency
                .handle_remote_writeback(cl_addr, self.config.node_id, data);
            return Ok(());
        }

        self.check_peer(target)?;
        let mut env = Envelope::new(
            MsgType::Writeback,
            self.fabric.generate_msg_id(),
            self.config.node_id,
            target,
        );
        let mut payload = MemPayload {
            addr: cl_addr,
            size: 64,
            client_id: self.config.node_id,
            ..Default::default()
        };
        payload.data.copy_from_slice(data);
        env.set_mem_payload(&payload);

        if !self.fabric.send(target, &env) {
            return Err(CxlError::QueueFull(target));
        }
        Ok(())
    }

    /* ------------------------------------------------------------------ */
    /* Forwarding                                                         */
    /* ------------------------------------------------------------------ */

    fn forward_read(&self, target: u32, addr: u64, buf: &mut [u8]) -> CxlResult<u64> {
        self.stats.forwarded_requests.fetch_add(1, Ordering::Relaxed);
        self.stats.remote_reads.fetch_add(1, Ordering::Relaxed);
        self.check_peer(target)?;
        if buf.len() > 64 {
            return Err(CxlError::invalid_input(format!(
                "forwarded read of {} bytes exceeds one cacheline",
                buf.len()
            )));
        }

        let mut env = Envelope::new(
            MsgType::ReadReq,
            self.fabric.generate_msg_id(),
            self.config.node_id,
            target,
        );
        let payload = MemPayload {
            addr,
            size: buf.len() as u64,
            client_id: self.config.node_id,
            ..Default::default()
        };
        env.set_mem_payload(&payload);

        let resp = self
            .fabric
            .send_and_wait(target, &env, self.config.request_timeout_ms)
            .ok_or_else(|| {
                log::warn!("Forward read to node {} failed", target);
                CxlError::timeout(format!("read forwarded to node {}", target))
            })?;
        let mem = resp.mem_payload();
        if mem.status != STATUS_OK {
            return Err(CxlError::Remote {
                node: target,
                status: mem.status,
            });
        }
        buf.copy_from_slice(&mem.data[..buf.len()]);

        let transit = self.logp.message_latency(now_ns(), target);
        let local_overhead = self.coherency.local_access_overhead(0);
        Ok(mem.latency_ns + (transit + local_overhead) as u64)
    }

    fn forward_write(&self, target: u32, addr: u64, data: &[u8]) -> CxlResult<u64> {
        self.stats.forwarded_requests.fetch_add(1, Ordering::Relaxed);
        self.stats.remote_writes.fetch_add(1, Ordering::Relaxed);
        self.check_peer(target)?;
        if data.len() > 64 {
            return Err(CxlError::invalid_input(format!(
                "forwarded write of {} bytes exceeds one cacheline",
                data.len()
            )));
        }

        let mut env = Envelope::new(
            MsgType::WriteReq,
            self.fabric.generate_msg_id(),
            self.config.node_id,
            target,
        );
        let mut payload = MemPayload {
            addr,
            size: data.len() as u64,
            client_id: self.config.node_id,
            ..Default::default()
        };
        payload.data[..data.len()].copy_from_slice(data);
        env.set_mem_payload(&payload);

        let resp = self
            .fabric
            .send_and_wait(target, &env, self.config.request_timeout_ms)
            .ok_or_else(|| {
                log::warn!("Forward write to node {} failed", target);
                CxlError::timeout(format!("write forwarded to node {}", target))
            })?;
        let mem = resp.mem_payload();
        if mem.status != STATUS_OK {
            return Err(CxlError::Remote {
                node: target,
                status: mem.status,
            });
        }

        let transit = self.logp.message_latency(now_ns(), target);
        let local_overhead = self.coherency.local_access_overhead(0);
        Ok(mem.latency_ns + (transit + local_overhead) as u64)
    }

    /* ------------------------------------------------------------------ */
    /* Home-side atomic helpers                                           */
    /* ------------------------------------------------------------------ */

    fn local_atomic_faa(&self, addr: u64, value: u64, client: u32) -> CxlResult<(u64, u64)> {
        let mut req = self.coherency_request(addr, true);
        req.requesting_node = client;
        let cohr = self.coherency.process_atomic(&req);
        if !cohr.success {
            return Err(CxlError::Coherency(format!(
                "atomic coherency failed for 0x{:x}",
                addr
            )));
        }
        let old = self.memory.fetch_add_u64(addr, value)?;
        let latency =
            (self.config.local_latency_ns + cohr.latency_ns) as u64 + ATOMIC_OVERHEAD_NS;
        Ok((old, latency))
    }

    fn local_atomic_cas(
        &self,
        addr: u64,
        expected: u64,
        desired: u64,
        client: u32,
    ) -> CxlResult<(u64, u64)> {
        let mut req = self.coherency_request(addr, true);
        req.requesting_node = client;
        let cohr = self.coherency.process_atomic(&req);
        if !cohr.success {
            return Err(CxlError::Coherency(format!(
                "atomic coherency failed for 0x{:x}",
                addr
            )));
        }
        let old = self.memory.compare_exchange_u64(addr, expected, desired)?;
        let latency =
            (self.config.local_latency_ns + cohr.latency_ns) as u64 + ATOMIC_OVERHEAD_NS;
        Ok((old, latency))
    }

    /* ------------------------------------------------------------------ */
    /* Message handlers (home side)                                       */
    /* ------------------------------------------------------------------ */

    fn setup_message_handlers(self: &Arc<Self>) {
        macro_rules! handler {
            ($method:ident) => {{
                let weak = Arc::downgrade(self);
                move |req: &Envelope, resp: &mut Envelope| {
                    if let Some(server) = weak.upgrade() {
                        server.$method(req, resp);
                    }
                }
            }};
        }

        self.fabric.register_handler(MsgType::ReadReq, handler!(handle_read_request));
        self.fabric.register_handler(MsgType::WriteReq, handler!(handle_write_request));
        self.fabric.register_handler(MsgType::AtomicFaaReq, handler!(handle_atomic_request));
        self.fabric.register_handler(MsgType::AtomicCasReq, handler!(handle_atomic_request));
        self.fabric.register_handler(MsgType::FenceReq, handler!(handle_fence_request));
        self.fabric.register_handler(MsgType::Invalidate, handler!(handle_coherency_request));
        self.fabric.register_handler(MsgType::Downgrade, handler!(handle_coherency_request));
        self.fabric.register_handler(MsgType::Writeback, handler!(handle_writeback_request));
        self.fabric.register_handler(MsgType::NodeRegister, handler!(handle_node_message));
        self.fabric.register_handler(MsgType::NodeDeregister, handler!(handle_node_message));
        self.fabric.register_handler(MsgType::NodeHeartbeat, handler!(handle_node_message));
        self.fabric.register_handler(MsgType::DirQuery, handler!(handle_dir_query));

        // Responses and ACKs with no pending waiter are dropped silently;
        // these arise from timed-out requests and fire-and-forget traffic.
        for msg_type in [
            MsgType::NodeAck,
            MsgType::ReadResp,
            MsgType::WriteResp,
            MsgType::AtomicFaaResp,
            MsgType::AtomicCasResp,
            MsgType::FenceResp,
            MsgType::InvalidateAck,
            MsgType::DowngradeAck,
            MsgType::WritebackAck,
            MsgType::DirResponse,
        ] {
            self.fabric.register_handler(msg_type, |_req, _resp| {});
        }
    }

    fn handle_read_request(&self, req: &Envelope, resp: &mut Envelope) {
        resp.set_msg_type(MsgType::ReadResp);
        let mem = req.mem_payload();
        let mut out = MemPayload {
            addr: mem.addr,
            size: mem.size,
            client_id: mem.client_id,
            ..Default::default()
        };

        let size = mem.size as usize;
        if size == 0 || size > 64 {
            log::warn!("Malformed read request: size {}", mem.size);
            out.status = STATUS_ERROR;
            resp.set_mem_payload(&out);
            return;
        }

        let mut cohreq = self.coherency_request(mem.addr, false);
        cohreq.requesting_node = mem.client_id;
        let cohr = self.coherency.process_read(&cohreq);

        if cohr.success
            && self
                .memory
                .read_cacheline(mem.addr, &mut out.data[..size])
                .is_ok()
        {
            out.status = STATUS_OK;
            out.latency_ns = (self.config.local_latency_ns + cohr.latency_ns) as u64;
            out.new_cache_state = cohr.new_state as u8;
            self.stats.local_reads.fetch_add(1, Ordering::Relaxed);
        } else {
            log::error!("Failed to read local address 0x{:x}", mem.addr);
            out.status = STATUS_ERROR;
        }
        resp.set_mem_payload(&out);
    }

    fn handle_write_request(&self, req: &Envelope, resp: &mut Envelope) {
        resp.set_msg_type(MsgType::WriteResp);
        let mem = req.mem_payload();
        let mut out = MemPayload {
            addr: mem.addr,
            size: mem.size,
            client_id: mem.client_id,
            ..Default::default()
        };

        let size = mem.size as usize;
        if size == 0 || size > 64 {
            log::warn!("Malformed write request: size {}", mem.size);
            out.status = STATUS_ERROR;
            resp.set_mem_payload(&out);
            return;
        }

        let mut cohreq = self.coherency_request(mem.addr, true);
        cohreq.requesting_node = mem.client_id;
        let cohr = self.coherency.process_write(&cohreq);

        if cohr.success
            && self
                .memory
                .write_cacheline(mem.addr, &mem.data[..size])
                .is_ok()
        {
            out.status = STATUS_OK;
            out.latency_ns = (self.config.local_latency_ns + cohr.latency_ns) as u64;
            out.new_cache_state = cohr.new_state as u8;
            self.stats.local_writes.fetch_add(1, Ordering::Relaxed);
        } else {
            log::error!("Failed to write local address 0x{:x}", mem.addr);
            out.status = STATUS_ERROR;
        }
        resp.set_mem_payload(&out);
    }

    fn handle_atomic_request(&self, req: &Envelope, resp: &mut Envelope) {
        let is_faa = req.header.msg_type == MsgType::AtomicFaaReq as u32;
        resp.set_msg_type(if is_faa {
            MsgType::AtomicFaaResp
        } else {
            MsgType::AtomicCasResp
        });

        let mem = req.mem_payload();
        let mut out = MemPayload {
            addr: mem.addr,
            size: 8,
            client_id: mem.client_id,
            ..Default::default()
        };

        let result = if is_faa {
            self.local_atomic_faa(mem.addr, mem.value, req.header.src_node)
        } else {
            self.local_atomic_cas(mem.addr, mem.expected, mem.value, req.header.src_node)
        };

        match result {
            Ok((old, latency)) => {
                out.value = old;
                out.latency_ns = latency;
                out.status = STATUS_OK;
            }
            Err(err) => {
                log::error!("Atomic op at 0x{:x} failed: {}", mem.addr, err);
                out.status = STATUS_ERROR;
            }
        }
        resp.set_mem_payload(&out);
    }

    fn handle_fence_request(&self, _req: &Envelope, resp: &mut Envelope) {
        fence(Ordering::SeqCst);
        resp.set_msg_type(MsgType::FenceResp);
    }

    fn handle_coherency_request(&self, req: &Envelope, resp: &mut Envelope) {
        self.stats.coherency_messages.fetch_add(1, Ordering::Relaxed);
        let coherency = req.coherency_payload();
        let cl_addr = coherency.cacheline_addr;

        if req.header.msg_type == MsgType::Invalidate as u32 {
            self.coherency
                .handle_remote_invalidate(cl_addr, req.header.src_node);
            resp.set_msg_type(MsgType::InvalidateAck);
        } else {
            self.coherency
                .handle_remote_downgrade(cl_addr, req.header.src_node);
            resp.set_msg_type(MsgType::DowngradeAck);
        }

        let mut out = CoherencyPayload::default();
        out.cacheline_addr = cl_addr;
        out.requesting_node = self.config.node_id;
        resp.set_coherency_payload(&out);
    }

    fn handle_writeback_request(&self, req: &Envelope, resp: &mut Envelope) {
        self.stats.coherency_messages.fetch_add(1, Ordering::Relaxed);
        let mem = req.mem_payload();
        let cl_addr = cacheline_addr(mem.addr);

        if self.memory.write_cacheline(cl_addr, &mem.data).is_ok() {
            self.coherency
                .handle_remote_writeback(cl_addr, req.header.src_node, &mem.data);
            resp.set_msg_type(MsgType::WritebackAck);
            let mut out = MemPayload::default();
            out.addr = cl_addr;
            out.status = STATUS_OK;
            resp.set_mem_payload(&out);
        } else {
            log::error!("Writeback to 0x{:x} failed", cl_addr);
            resp.set_msg_type(MsgType::WritebackAck);
            let mut out = MemPayload::default();
            out.addr = cl_addr;
            out.status = STATUS_ERROR;
            resp.set_mem_payload(&out);
        }
    }

    fn handle_node_message(&self, req: &Envelope, resp: &mut Envelope) {
        let node = req.node_payload();
        match MsgType::from_u32(req.header.msg_type) {
            Some(MsgType::NodeRegister) => {
                let info = PeerInfo {
                    node_id: node.node_id,
                    hostname: node.hostname_str(),
                    state: NodeState::from_u32(node.node_state),
                    memory_base: node.memory_base,
                    memory_size: node.memory_size,
                    last_heartbeat: now_ns(),
                };
                log::info!(
                    "Node {} registered: {} (memory: 0x{:x}-0x{:x})",
                    info.node_id,
                    info.hostname,
                    info.memory_base,
                    info.memory_base + info.memory_size
                );
                self.nodes.write().insert(info.node_id, info);
                resp.set_msg_type(MsgType::NodeAck);
            }
            Some(MsgType::NodeDeregister) => {
                if let Some(peer) = self.nodes.write().get_mut(&node.node_id) {
                    peer.state = NodeState::Offline;
                }
                log::info!("Node {} deregistered", node.node_id);
            }
            Some(MsgType::NodeHeartbeat) => {
                let mut nodes = self.nodes.write();
                let peer = nodes.entry(node.node_id).or_insert_with(|| PeerInfo {
                    node_id: node.node_id,
                    hostname: node.hostname_str(),
                    state: NodeState::from_u32(node.node_state),
                    memory_base: node.memory_base,
                    memory_size: node.memory_size,
                    last_heartbeat: 0,
                });
                // Stamp with the receiver's clock; peer clocks are not
                // comparable across processes.
                peer.last_heartbeat = now_ns();
                peer.state = NodeState::from_u32(node.node_state);
            }
            _ => {}
        }
    }

    fn handle_dir_query(&self, req: &Envelope, resp: &mut Envelope) {
        let query = req.coherency_payload();
        resp.set_msg_type(MsgType::DirResponse);

        let mut out = CoherencyPayload::default();
        out.cacheline_addr = query.cacheline_addr;
        match self.coherency.entry_snapshot(query.cacheline_addr) {
            Some(snap) => {
                out.owner_node = snap.owner_node;
                out.current_state = snap.state as u8;
                out.version = snap.version;
                out.sharers_bitmap = snap
                    .sharer_nodes
                    .iter()
                    .filter(|&&n| n < 16)
                    .fold(0u16, |bits, &n| bits | (1 << n));
            }
            None => {
                out.owner_node = NO_NODE;
                out.current_state = MhsldCacheState::Invalid as u8;
            }
        }
        resp.set_coherency_payload(&out);
    }

    /* ------------------------------------------------------------------ */
    /* Peer liveness                                                      */
    /* ------------------------------------------------------------------ */

    fn check_peer_liveness(&self) {
        let now = now_ns();
        let mut nodes = self.nodes.write();
        for (id, peer) in nodes.iter_mut() {
            if *id == self.config.node_id || peer.state == NodeState::Offline {
                continue;
            }
            if peer.last_heartbeat != 0 && now.saturating_sub(peer.last_heartbeat) > PEER_TIMEOUT_NS
            {
                log::warn!("Node {} appears to be offline", id);
                peer.state = NodeState::Offline;
            }
        }
    }
}

impl Drop for NodeServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn heartbeat_loop(server: Weak<NodeServer>, running: Arc<AtomicBool>) {
    let mut last_beat: Option<Instant> = None;
    while running.load(Ordering::Acquire) {
        if last_beat.map_or(true, |t| t.elapsed() >= HEARTBEAT_PERIOD) {
            let Some(server) = server.upgrade() else { break };
            server.fabric.send_heartbeat();
            server.check_peer_liveness();
            last_beat = Some(Instant::now());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
