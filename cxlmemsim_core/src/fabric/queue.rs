//! Shared fabric segment layout: header, node status array, ring queues.
//!
//! The whole segment is one `FabricShmHeader` mapped by every node. All
//! mutable fields are atomics (or racy-by-design byte arrays like hostnames);
//! the envelope slots are written through `UnsafeCell` pointers bracketed by
//! release/acquire fences. Nothing in here takes a `&mut` to shared memory.
//!
//! Queue discipline per ordered (src, dst) pair: the producer checks for
//! space, writes the envelope into the slot at `head`, fences, then publishes
//! the new head; a consumer copies the slot at `tail` out and then claims it
//! by advancing `tail` with a compare-exchange, so concurrent pollers on the
//! destination node never deliver the same envelope twice or skip one. A
//! full queue drops the message and counts it.

use crate::fabric::envelope::{Envelope, NodeState, MAX_NODES, RING_DEPTH};
use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

/// Magic value identifying a fabric segment ("DXTMEMSH").
pub const FABRIC_MAGIC: u64 = 0x4458544D454D5348;
pub const FABRIC_VERSION: u32 = 1;

/// One ring queue for messages flowing src -> dst.
#[repr(C, align(64))]
pub struct RingQueue {
    head: AtomicU32,
    tail: AtomicU32,
    msg_count: AtomicU32,
    capacity: AtomicU32,
    total_sent: AtomicU64,
    total_received: AtomicU64,
    total_dropped: AtomicU64,
    _pad: [u8; 24],
    messages: [UnsafeCell<Envelope>; RING_DEPTH],
}

unsafe impl Sync for RingQueue {}

impl RingQueue {
    /// Called once by the coordinator on a zeroed segment.
    fn init(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.msg_count.store(0, Ordering::Relaxed);
        self.capacity.store(RING_DEPTH as u32, Ordering::Relaxed);
        self.total_sent.store(0, Ordering::Relaxed);
        self.total_received.store(0, Ordering::Relaxed);
        self.total_dropped.store(0, Ordering::Relaxed);
    }

    /// Copy `env` into the queue; returns false (and counts a drop) when full.
    pub fn enqueue(&self, env: &Envelope) -> bool {
        let cap = self.capacity.load(Ordering::Relaxed);
        if cap == 0 {
            return false;
        }
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let next = (head + 1) % cap;
        if next == tail {
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        unsafe {
            std::ptr::write(self.messages[head as usize].get(), *env);
        }
        fence(Ordering::Release);
        self.head.store(next, Ordering::Release);
        self.msg_count.fetch_add(1, Ordering::Relaxed);
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Copy the oldest envelope out, or None when empty.
    ///
    /// The slot is read first and only then claimed by a compare-exchange on
    /// `tail`: the producer cannot reuse the slot until `tail` moves past it,
    /// and a losing consumer discards its copy and retries.
    pub fn dequeue(&self) -> Option<Envelope> {
        let cap = self.capacity.load(Ordering::Relaxed);
        if cap == 0 {
            return None;
        }
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }

            let env = unsafe { std::ptr::read(self.messages[tail as usize].get()) };
            fence(Ordering::Acquire);
            if self
                .tail
                .compare_exchange(tail, (tail + 1) % cap, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.msg_count.fetch_sub(1, Ordering::Relaxed);
                self.total_received.fetch_add(1, Ordering::Relaxed);
                return Some(env);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Free slots remaining (one slot is always kept open).
    pub fn free_slots(&self) -> u32 {
        let cap = self.capacity.load(Ordering::Relaxed);
        if cap == 0 {
            return 0;
        }
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (cap + tail - head - 1) % cap
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent.load(Ordering::Relaxed)
    }

    pub fn total_received(&self) -> u64 {
        self.total_received.load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }
}

/// Per-node status slot in the shared header.
#[repr(C, align(64))]
pub struct NodeStatus {
    pub node_id: AtomicU32,
    pub state: AtomicU32,
    pub last_heartbeat: AtomicU64,
    pub memory_base: AtomicU64,
    pub memory_size: AtomicU64,
    pub active_connections: AtomicU32,
    pub flags: AtomicU32,
    hostname: UnsafeCell<[u8; 32]>,
    _pad: [u8; 56],
}

unsafe impl Sync for NodeStatus {}

impl NodeStatus {
    /// Hostname writes race only with registration of the same node id,
    /// which the registry serializes; readers may see a mid-write name.
    pub fn set_hostname(&self, name: &str) {
        let bytes = name.as_bytes();
        let field = unsafe { &mut *self.hostname.get() };
        let n = bytes.len().min(field.len() - 1);
        field[..n].copy_from_slice(&bytes[..n]);
        field[n..].fill(0);
    }

    pub fn hostname(&self) -> String {
        let field = unsafe { *self.hostname.get() };
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        String::from_utf8_lossy(&field[..end]).into_owned()
    }

    pub fn node_state(&self) -> NodeState {
        NodeState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.node_state().is_active()
    }
}

/// The complete shared fabric segment.
#[repr(C, align(4096))]
pub struct FabricShmHeader {
    magic: AtomicU64,
    version: AtomicU32,
    num_nodes: AtomicU32,
    coordinator_node: AtomicU32,
    global_epoch: AtomicU32,
    system_ready: AtomicU32,
    shutdown_requested: AtomicU32,
    _pad: [u8; 32],
    nodes: [NodeStatus; MAX_NODES],
    queues: [RingQueue; MAX_NODES * MAX_NODES],
}

unsafe impl Sync for FabricShmHeader {}

const _: () = assert!(std::mem::size_of::<NodeStatus>() == 128);
const _: () = assert!(std::mem::size_of::<RingQueue>() == 64 + RING_DEPTH * 512);
const _: () = assert!(std::mem::offset_of!(FabricShmHeader, nodes) == 64);
const _: () = assert!(std::mem::offset_of!(FabricShmHeader, queues) == 64 + MAX_NODES * 128);

/// Bytes to map for one fabric segment.
pub const fn fabric_shm_size() -> usize {
    std::mem::size_of::<FabricShmHeader>()
}

impl FabricShmHeader {
    /// Initialize a freshly created (zeroed) segment as coordinator.
    pub fn init_as_coordinator(&self, coordinator_node: u32) {
        self.num_nodes.store(0, Ordering::Relaxed);
        self.coordinator_node.store(coordinator_node, Ordering::Relaxed);
        self.global_epoch.store(0, Ordering::Relaxed);
        self.system_ready.store(0, Ordering::Relaxed);
        self.shutdown_requested.store(0, Ordering::Relaxed);
        for queue in self.queues.iter() {
            queue.init();
        }
        self.version.store(FABRIC_VERSION, Ordering::Relaxed);
        // Magic last: joiners spin until the header is fully initialized.
        self.magic.store(FABRIC_MAGIC, Ordering::Release);
    }

    /// Validate a segment created by another node.
    pub fn validate(&self) -> Result<(), String> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != FABRIC_MAGIC {
            return Err(format!("bad fabric magic 0x{:x}", magic));
        }
        let version = self.version.load(Ordering::Relaxed);
        if version != FABRIC_VERSION {
            return Err(format!("incompatible fabric version {}", version));
        }
        Ok(())
    }

    pub fn queue(&self, src: u32, dst: u32) -> Option<&RingQueue> {
        if src as usize >= MAX_NODES || dst as usize >= MAX_NODES {
            return None;
        }
        Some(&self.queues[src as usize * MAX_NODES + dst as usize])
    }

    pub fn node(&self, node_id: u32) -> Option<&NodeStatus> {
        self.nodes.get(node_id as usize)
    }

    pub fn coordinator_node(&self) -> u32 {
        self.coordinator_node.load(Ordering::Relaxed)
    }

    pub fn global_epoch(&self) -> u32 {
        self.global_epoch.load(Ordering::Acquire)
    }

    pub fn advance_epoch(&self) -> u32 {
        self.global_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn system_ready(&self) -> bool {
        self.system_ready.load(Ordering::Acquire) != 0
    }

    pub fn num_nodes(&self) -> u32 {
        self.num_nodes.load(Ordering::Relaxed)
    }

    pub fn add_node(&self) {
        self.num_nodes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn remove_node(&self) {
        self.num_nodes.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(1, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire) != 0
    }

    pub fn set_system_ready(&self, ready: bool) {
        self.system_ready.store(ready as u32, Ordering::Release);
    }

    /// Sum the per-queue counters across the whole segment.
    pub fn queue_totals(&self) -> (u64, u64, u64) {
        let mut sent = 0;
        let mut received = 0;
        let mut dropped = 0;
        for queue in self.queues.iter() {
            sent += queue.total_sent();
            received += queue.total_received();
            dropped += queue.total_dropped();
        }
        (sent, received, dropped)
    }
}
