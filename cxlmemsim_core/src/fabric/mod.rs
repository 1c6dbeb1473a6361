//! Inter-node message fabric: wire format, shared ring queues, and the
//! send/dispatch manager.

pub mod envelope;
pub mod manager;
pub mod queue;

pub use envelope::{
    CoherencyPayload, Envelope, EnvelopeHeader, MemPayload, MsgType, NodePayload, NodeState,
    BROADCAST_NODE, MAX_NODES, PAYLOAD_AREA, RING_DEPTH, STATUS_ERROR, STATUS_OK,
};
pub use manager::{
    FabricStats, MessageFabric, MessageHandler, NodeRegistration, DEFAULT_FABRIC_SHM,
};
pub use queue::{fabric_shm_size, FabricShmHeader, NodeStatus, RingQueue, FABRIC_MAGIC};
