//! Inter-node message fabric over one shared POSIX segment.
//!
//! The coordinator (node 0) creates the segment and initializes the header;
//! other nodes open it read-write. Delivery is best-effort and FIFO per
//! (src, dst) ring queue. Request/response correlation runs through a pending
//! table keyed by message id; a small worker pool polls all source queues and
//! dispatches registered handlers.

use crate::error::{CxlError, CxlResult};
use crate::fabric::envelope::{Envelope, MsgType, NodePayload, NodeState, BROADCAST_NODE, MAX_NODES};
use crate::fabric::queue::{fabric_shm_size, FabricShmHeader};
use crate::memory::ShmRegion;
use crate::util::now_ns;
use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default shared segment name for the distributed fabric.
pub const DEFAULT_FABRIC_SHM: &str = "/cxlmemsim_dist";

const NUM_WORKERS: usize = 2;
const MAX_MESSAGES_PER_TICK: usize = 100;
const IDLE_SLEEP: Duration = Duration::from_micros(100);

/// Handler for one message type. Assigning a non-None type to the response
/// envelope sends it back to the requester.
pub type MessageHandler = Box<dyn Fn(&Envelope, &mut Envelope) + Send + Sync>;

/// Peer registration data published into the shared header.
#[derive(Debug, Clone)]
pub struct NodeRegistration {
    pub node_id: u32,
    pub hostname: String,
    pub memory_base: u64,
    pub memory_size: u64,
}

#[derive(Default)]
struct PendingRequest {
    response: Mutex<Option<Envelope>>,
    cv: Condvar,
}

/// Aggregated fabric statistics across all ring queues.
#[derive(Debug, Clone, Copy, Default)]
pub struct FabricStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
}

pub struct MessageFabric {
    region: ShmRegion,
    header: *const FabricShmHeader,
    shm_name: String,
    local_node: u32,
    is_coordinator: bool,
    handlers: RwLock<HashMap<u32, MessageHandler>>,
    next_msg_id: AtomicU32,
    pending: Mutex<HashMap<u32, Arc<PendingRequest>>>,
    // Serializes in-process producers per destination queue; the wire
    // protocol itself is single-producer per (src, dst) ring.
    send_locks: [Mutex<()>; MAX_NODES],
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

unsafe impl Send for MessageFabric {}
unsafe impl Sync for MessageFabric {}

impl MessageFabric {
    /// Create (as coordinator) or open the shared fabric segment.
    pub fn new(shm_name: &str, node_id: u32, create_new: bool) -> CxlResult<Self> {
        if node_id as usize >= MAX_NODES {
            return Err(CxlError::config(format!(
                "node id {} out of range (max {})",
                node_id,
                MAX_NODES - 1
            )));
        }

        let region = if create_new {
            ShmRegion::create(shm_name, fabric_shm_size())?
        } else {
            ShmRegion::open(shm_name, fabric_shm_size())?
        };
        let header = region.as_ptr() as *const FabricShmHeader;

        if create_new {
            unsafe { &*header }.init_as_coordinator(node_id);
            log::info!("Fabric '{}' initialized, coordinator node {}", shm_name, node_id);
        } else {
            unsafe { &*header }
                .validate()
                .map_err(CxlError::Fabric)?;
            log::info!("Joined existing fabric '{}' as node {}", shm_name, node_id);
        }

        Ok(Self {
            region,
            header,
            shm_name: shm_name.to_string(),
            local_node: node_id,
            is_coordinator: create_new,
            handlers: RwLock::new(HashMap::new()),
            next_msg_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            send_locks: std::array::from_fn(|_| Mutex::new(())),
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        })
    }

    fn header(&self) -> &FabricShmHeader {
        unsafe { &*self.header }
    }

    pub fn local_node_id(&self) -> u32 {
        self.local_node
    }

    pub fn is_coordinator(&self) -> bool {
        self.is_coordinator
    }

    pub fn shm_name(&self) -> &str {
        &self.shm_name
    }

    pub fn generate_msg_id(&self) -> u32 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /* ------------------------------------------------------------------ */
    /* Node registry                                                      */
    /* ------------------------------------------------------------------ */

    pub fn register_node(&self, info: &NodeRegistration) -> CxlResult<()> {
        let slot = self
            .header()
            .node(info.node_id)
            .ok_or_else(|| CxlError::config(format!("node id {} out of range", info.node_id)))?;

        slot.node_id.store(info.node_id, Ordering::Relaxed);
        slot.memory_base.store(info.memory_base, Ordering::Relaxed);
        slot.memory_size.store(info.memory_size, Ordering::Relaxed);
        slot.active_connections.store(0, Ordering::Relaxed);
        slot.flags.store(0, Ordering::Relaxed);
        slot.set_hostname(&info.hostname);
        slot.last_heartbeat.store(now_ns(), Ordering::Relaxed);
        slot.state.store(NodeState::Ready as u32, Ordering::Release);
        self.header().add_node();

        log::info!(
            "Registered node {}: {} (memory: 0x{:x}-0x{:x})",
            info.node_id,
            info.hostname,
            info.memory_base,
            info.memory_base + info.memory_size
        );
        Ok(())
    }

    pub fn deregister_node(&self, node_id: u32) -> CxlResult<()> {
        let slot = self
            .header()
            .node(node_id)
            .ok_or_else(|| CxlError::config(format!("node id {} out of range", node_id)))?;
        slot.state.store(NodeState::Offline as u32, Ordering::Release);
        slot.last_heartbeat.store(0, Ordering::Relaxed);
        self.header().remove_node();
        log::info!("Deregistered node {}", node_id);
        Ok(())
    }

    pub fn is_node_active(&self, node_id: u32) -> bool {
        self.header()
            .node(node_id)
            .map(|slot| slot.is_active())
            .unwrap_or(false)
    }

    pub fn get_active_nodes(&self) -> Vec<u32> {
        (0..MAX_NODES as u32)
            .filter(|&id| self.is_node_active(id))
            .collect()
    }

    /// Peer state as recorded in the shared header.
    pub fn node_state(&self, node_id: u32) -> NodeState {
        self.header()
            .node(node_id)
            .map(|slot| slot.node_state())
            .unwrap_or(NodeState::Unknown)
    }

    pub fn node_last_heartbeat(&self, node_id: u32) -> u64 {
        self.header()
            .node(node_id)
            .map(|slot| slot.last_heartbeat.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /* ------------------------------------------------------------------ */
    /* Sending                                                            */
    /* ------------------------------------------------------------------ */

    /// Enqueue `env` for `dst`. Returns false on a full queue (counted as a
    /// drop in the queue stats) or an out-of-range destination.
    pub fn send(&self, dst: u32, env: &Envelope) -> bool {
        let Some(queue) = self.header().queue(self.local_node, dst) else {
            return false;
        };
        let _guard = self.send_locks[dst as usize].lock();
        let ok = queue.enqueue(env);
        if !ok {
            log::warn!("Message queue to node {} full, dropping message", dst);
        }
        ok
    }

    /// Send to every active peer; true only if all sends succeeded.
    pub fn broadcast(&self, env: &Envelope) -> bool {
        let mut all_ok = true;
        for node_id in self.get_active_nodes() {
            if node_id == self.local_node {
                continue;
            }
            let mut copy = *env;
            copy.header.dst_node = node_id;
            if !self.send(node_id, &copy) {
                all_ok = false;
            }
        }
        all_ok
    }

    /// Send a request and block until its response arrives or `timeout_ms`
    /// elapses. A response is matched by msg_id and response kind; late
    /// responses after a timeout are dropped silently. Returns None on
    /// timeout, send failure, or fabric shutdown.
    pub fn send_and_wait(&self, dst: u32, req: &Envelope, timeout_ms: u64) -> Option<Envelope> {
        if !self.running.load(Ordering::Acquire) {
            return None;
        }
        let msg_id = req.header.msg_id;
        let slot = Arc::new(PendingRequest::default());
        self.pending.lock().insert(msg_id, slot.clone());

        if !self.send(dst, req) {
            self.pending.lock().remove(&msg_id);
            return None;
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut response = slot.response.lock();
        let result = loop {
            if let Some(env) = response.take() {
                break Some(env);
            }
            if !self.running.load(Ordering::Acquire) {
                break None;
            }
            if slot.cv.wait_until(&mut response, deadline).timed_out() {
                break response.take();
            }
        };
        drop(response);
        self.pending.lock().remove(&msg_id);

        if result.is_none() {
            log::warn!("Request {} to node {} timed out", msg_id, dst);
        }
        result
    }

    /* ------------------------------------------------------------------ */
    /* Handlers and processing                                            */
    /* ------------------------------------------------------------------ */

    pub fn register_handler<F>(&self, msg_type: MsgType, handler: F)
    where
        F: Fn(&Envelope, &mut Envelope) + Send + Sync + 'static,
    {
        self.handlers.write().insert(msg_type as u32, Box::new(handler));
    }

    pub fn unregister_handler(&self, msg_type: MsgType) {
        self.handlers.write().remove(&(msg_type as u32));
    }

    fn process_message(&self, env: &Envelope) {
        let Some(msg_type) = env.msg_type() else {
            log::warn!(
                "Dropping envelope with unknown msg_type {} from node {}",
                env.header.msg_type,
                env.header.src_node
            );
            return;
        };

        // Responses complete their pending request if one is still waiting.
        if msg_type.is_response() {
            let slot = self.pending.lock().get(&env.header.msg_id).cloned();
            if let Some(slot) = slot {
                *slot.response.lock() = Some(*env);
                slot.cv.notify_one();
                return;
            }
        }

        let handlers = self.handlers.read();
        let Some(handler) = handlers.get(&env.header.msg_type) else {
            log::warn!("No handler for message type {:?}", msg_type);
            return;
        };

        let mut response = Envelope::new(MsgType::None, env.header.msg_id, self.local_node, env.header.src_node);
        handler(env, &mut response);

        if response.header.msg_type != MsgType::None as u32 {
            self.send(env.header.src_node, &response);
        }
    }

    /// Drain up to `max_messages` envelopes across all source queues.
    pub fn poll_messages(&self, max_messages: usize) -> usize {
        self.poll_sources(0..MAX_NODES as u32, max_messages)
    }

    fn poll_sources<I>(&self, sources: I, max_messages: usize) -> usize
    where
        I: Iterator<Item = u32>,
    {
        let mut processed = 0;
        for src in sources {
            if src == self.local_node || processed >= max_messages {
                continue;
            }
            if !self.is_node_active(src) {
                continue;
            }
            let Some(queue) = self.header().queue(src, self.local_node) else {
                continue;
            };
            while processed < max_messages {
                let Some(env) = queue.dequeue() else { break };
                self.process_message(&env);
                processed += 1;
            }
        }
        processed
    }

    pub fn start_processing(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut workers = self.workers.lock();
        for worker_id in 0..NUM_WORKERS {
            let fabric = Arc::clone(self);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("cxl-fabric-{}-{}", self.local_node, worker_id))
                    .spawn(move || fabric.worker_loop(worker_id))
                    .expect("failed to spawn fabric worker"),
            );
        }
        log::info!(
            "Started {} message processing workers for node {}",
            NUM_WORKERS,
            self.local_node
        );
    }

    /// Each worker owns the source ids congruent to its index, so every
    /// (src, dst) ring has exactly one steady-state consumer and envelopes
    /// from one source are dispatched in the order they were dequeued.
    fn worker_loop(&self, worker_id: usize) {
        let backoff = Backoff::new();
        while self.running.load(Ordering::Acquire) {
            let sources =
                (0..MAX_NODES as u32).filter(|src| *src as usize % NUM_WORKERS == worker_id);
            let processed = self.poll_sources(sources, MAX_MESSAGES_PER_TICK);
            if processed == 0 {
                if backoff.is_completed() {
                    std::thread::sleep(IDLE_SLEEP);
                } else {
                    backoff.snooze();
                }
            } else {
                backoff.reset();
            }
        }
    }

    /// Signal workers and join them; outstanding `send_and_wait` callers
    /// observe the shutdown and return None.
    pub fn stop_processing(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for slot in self.pending.lock().values() {
            slot.cv.notify_all();
        }
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /* ------------------------------------------------------------------ */
    /* Heartbeat and stats                                                */
    /* ------------------------------------------------------------------ */

    /// Stamp the local heartbeat and broadcast it to all active peers.
    pub fn send_heartbeat(&self) {
        let Some(slot) = self.header().node(self.local_node) else {
            return;
        };
        let now = now_ns();
        slot.last_heartbeat.store(now, Ordering::Relaxed);

        let mut payload = NodePayload::default();
        payload.node_id = self.local_node;
        payload.node_state = slot.state.load(Ordering::Relaxed);
        payload.memory_base = slot.memory_base.load(Ordering::Relaxed);
        payload.memory_size = slot.memory_size.load(Ordering::Relaxed);
        payload.set_hostname(&slot.hostname());

        let mut env = Envelope::new(
            MsgType::NodeHeartbeat,
            self.generate_msg_id(),
            self.local_node,
            BROADCAST_NODE,
        );
        env.set_node_payload(&payload);
        self.broadcast(&env);
    }

    /// Coordinator marks the cluster ready once its own setup finished.
    pub fn set_system_ready(&self, ready: bool) {
        self.header().set_system_ready(ready);
    }

    pub fn system_ready(&self) -> bool {
        self.header().system_ready()
    }

    pub fn get_stats(&self) -> FabricStats {
        let (sent, received, dropped) = self.header().queue_totals();
        FabricStats {
            messages_sent: sent,
            messages_received: received,
            messages_dropped: dropped,
        }
    }

    /// Raw dropped-count for the (local -> dst) queue.
    pub fn dropped_to(&self, dst: u32) -> u64 {
        self.header()
            .queue(self.local_node, dst)
            .map(|q| q.total_dropped())
            .unwrap_or(0)
    }
}

impl Drop for MessageFabric {
    fn drop(&mut self) {
        self.stop_processing();
        // The coordinator's ShmRegion unlinks the segment on drop.
        let _ = &self.region;
    }
}
