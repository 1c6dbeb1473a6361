//! On-wire message format for the inter-node fabric.
//!
//! Every message is a fixed 512-byte `Envelope`: a 32-byte header followed by
//! a 256-byte payload area holding one of the typed payloads below, then tail
//! padding. Payloads are `bytemuck` Pod views copied in and out of the
//! payload area, so the same bytes are valid across processes.

use crate::util::now_ns;
use bytemuck::{Pod, Zeroable};

/// Maximum nodes in one fabric segment.
pub const MAX_NODES: usize = 16;
/// Ring queue depth per ordered node pair.
pub const RING_DEPTH: usize = 4096;
/// Destination id meaning "all active peers".
pub const BROADCAST_NODE: u32 = 0xFFFF;

/// Payload area size inside an envelope.
pub const PAYLOAD_AREA: usize = 256;

/// Operation completed at the home node.
pub const STATUS_OK: u32 = 0;
/// Operation failed at the home node.
pub const STATUS_ERROR: u32 = 1;

/// Inter-node message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    None = 0,

    // Node management
    NodeRegister = 1,
    NodeDeregister = 2,
    NodeHeartbeat = 3,
    NodeAck = 4,

    // Memory operations (forwarded between nodes)
    ReadReq = 10,
    ReadResp = 11,
    WriteReq = 12,
    WriteResp = 13,

    // Atomic operations
    AtomicFaaReq = 20,
    AtomicFaaResp = 21,
    AtomicCasReq = 22,
    AtomicCasResp = 23,
    FenceReq = 24,
    FenceResp = 25,

    // Coherency protocol
    Invalidate = 30,
    InvalidateAck = 31,
    Downgrade = 32,
    DowngradeAck = 33,
    Writeback = 34,
    WritebackAck = 35,

    // Directory operations
    DirQuery = 41,
    DirResponse = 42,
}

impl MsgType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::NodeRegister,
            2 => Self::NodeDeregister,
            3 => Self::NodeHeartbeat,
            4 => Self::NodeAck,
            10 => Self::ReadReq,
            11 => Self::ReadResp,
            12 => Self::WriteReq,
            13 => Self::WriteResp,
            20 => Self::AtomicFaaReq,
            21 => Self::AtomicFaaResp,
            22 => Self::AtomicCasReq,
            23 => Self::AtomicCasResp,
            24 => Self::FenceReq,
            25 => Self::FenceResp,
            30 => Self::Invalidate,
            31 => Self::InvalidateAck,
            32 => Self::Downgrade,
            33 => Self::DowngradeAck,
            34 => Self::Writeback,
            35 => Self::WritebackAck,
            41 => Self::DirQuery,
            42 => Self::DirResponse,
            _ => return None,
        })
    }

    /// Whether this type answers a pending request (matched by msg_id).
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Self::NodeAck
                | Self::ReadResp
                | Self::WriteResp
                | Self::AtomicFaaResp
                | Self::AtomicCasResp
                | Self::FenceResp
                | Self::InvalidateAck
                | Self::DowngradeAck
                | Self::WritebackAck
                | Self::DirResponse
        )
    }
}

/// Node lifecycle states, shared between the wire format and the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NodeState {
    Unknown = 0,
    Initializing = 1,
    Ready = 2,
    Busy = 3,
    Draining = 4,
    Offline = 5,
}

impl NodeState {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            1 => Self::Initializing,
            2 => Self::Ready,
            3 => Self::Busy,
            4 => Self::Draining,
            5 => Self::Offline,
            _ => Self::Unknown,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

/// Envelope header, 32 bytes.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct EnvelopeHeader {
    pub msg_type: u32,
    pub msg_id: u32,
    pub src_node: u32,
    pub dst_node: u32,
    pub timestamp_ns: u64,
    pub payload_size: u32,
    pub flags: u32,
}

/// Memory operation payload.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct MemPayload {
    pub addr: u64,
    pub size: u64,
    pub value: u64,
    pub expected: u64,
    pub latency_ns: u64,
    pub client_id: u32,
    pub status: u32,
    pub cache_state: u8,
    pub new_cache_state: u8,
    pub sharers_bitmap: u16,
    pub version: u32,
    pub data: [u8; 64],
    pub reserved: [u8; 12],
    pub _pad: [u8; 4],
}

impl Default for MemPayload {
    fn default() -> Self {
        Zeroable::zeroed()
    }
}

/// Node registration/heartbeat payload, 64 bytes.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct NodePayload {
    pub node_id: u32,
    pub node_state: u32,
    pub memory_base: u64,
    pub memory_size: u64,
    pub num_cachelines: u64,
    pub port: u32,
    pub flags: u32,
    pub hostname: [u8; 24],
}

impl Default for NodePayload {
    fn default() -> Self {
        Zeroable::zeroed()
    }
}

impl NodePayload {
    pub fn set_hostname(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let n = bytes.len().min(self.hostname.len() - 1);
        self.hostname[..n].copy_from_slice(&bytes[..n]);
        self.hostname[n..].fill(0);
    }

    pub fn hostname_str(&self) -> String {
        let end = self
            .hostname
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.hostname.len());
        String::from_utf8_lossy(&self.hostname[..end]).into_owned()
    }
}

/// Coherency protocol payload, 48 bytes.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct CoherencyPayload {
    pub cacheline_addr: u64,
    pub requesting_node: u32,
    pub owner_node: u32,
    pub sharers_bitmap: u16,
    pub current_state: u8,
    pub requested_state: u8,
    pub version: u32,
    pub data: [u8; 24],
}

impl Default for CoherencyPayload {
    fn default() -> Self {
        Zeroable::zeroed()
    }
}

/// The fixed-size on-wire message.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
pub struct Envelope {
    pub header: EnvelopeHeader,
    payload: [u8; PAYLOAD_AREA],
    _tail: [u8; 224],
}

// 32 + 256 + 224 = 512, no implicit padding; every bit pattern is valid.
unsafe impl Zeroable for Envelope {}
unsafe impl Pod for Envelope {}

const _: () = assert!(std::mem::size_of::<EnvelopeHeader>() == 32);
const _: () = assert!(std::mem::size_of::<Envelope>() == 512);
const _: () = assert!(std::mem::align_of::<Envelope>() == 64);
const _: () = assert!(std::mem::size_of::<NodePayload>() == 64);
const _: () = assert!(std::mem::size_of::<CoherencyPayload>() == 48);
const _: () = assert!(std::mem::size_of::<MemPayload>() <= PAYLOAD_AREA);

impl Envelope {
    pub fn new(msg_type: MsgType, msg_id: u32, src_node: u32, dst_node: u32) -> Self {
        let mut env: Envelope = Zeroable::zeroed();
        env.header = EnvelopeHeader {
            msg_type: msg_type as u32,
            msg_id,
            src_node,
            dst_node,
            timestamp_ns: now_ns(),
            payload_size: 0,
            flags: 0,
        };
        env
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_u32(self.header.msg_type)
    }

    pub fn set_msg_type(&mut self, msg_type: MsgType) {
        self.header.msg_type = msg_type as u32;
    }

    pub fn mem_payload(&self) -> MemPayload {
        bytemuck::pod_read_unaligned(&self.payload[..std::mem::size_of::<MemPayload>()])
    }

    pub fn set_mem_payload(&mut self, payload: &MemPayload) {
        let bytes = bytemuck::bytes_of(payload);
        self.payload[..bytes.len()].copy_from_slice(bytes);
        self.header.payload_size = bytes.len() as u32;
    }

    pub fn node_payload(&self) -> NodePayload {
        bytemuck::pod_read_unaligned(&self.payload[..std::mem::size_of::<NodePayload>()])
    }

    pub fn set_node_payload(&mut self, payload: &NodePayload) {
        let bytes = bytemuck::bytes_of(payload);
        self.payload[..bytes.len()].copy_from_slice(bytes);
        self.header.payload_size = bytes.len() as u32;
    }

    pub fn coherency_payload(&self) -> CoherencyPayload {
        bytemuck::pod_read_unaligned(&self.payload[..std::mem::size_of::<CoherencyPayload>()])
    }

    pub fn set_coherency_payload(&mut self, payload: &CoherencyPayload) {
        let bytes = bytemuck::bytes_of(payload);
        self.payload[..bytes.len()].copy_from_slice(bytes);
        self.header.payload_size = bytes.len() as u32;
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Zeroable::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_header_layout() {
        assert_eq!(offset_of!(EnvelopeHeader, msg_type), 0);
        assert_eq!(offset_of!(EnvelopeHeader, msg_id), 4);
        assert_eq!(offset_of!(EnvelopeHeader, src_node), 8);
        assert_eq!(offset_of!(EnvelopeHeader, dst_node), 12);
        assert_eq!(offset_of!(EnvelopeHeader, timestamp_ns), 16);
        assert_eq!(offset_of!(EnvelopeHeader, payload_size), 24);
        assert_eq!(offset_of!(EnvelopeHeader, flags), 28);
    }

    #[test]
    fn test_mem_payload_layout() {
        assert_eq!(offset_of!(MemPayload, addr), 0);
        assert_eq!(offset_of!(MemPayload, latency_ns), 32);
        assert_eq!(offset_of!(MemPayload, client_id), 40);
        assert_eq!(offset_of!(MemPayload, cache_state), 48);
        assert_eq!(offset_of!(MemPayload, sharers_bitmap), 50);
        assert_eq!(offset_of!(MemPayload, version), 52);
        assert_eq!(offset_of!(MemPayload, data), 56);
        assert_eq!(offset_of!(MemPayload, reserved), 120);
    }

    #[test]
    fn test_payload_roundtrip() {
        let mut env = Envelope::new(MsgType::ReadReq, 7, 0, 1);
        let mut mem = MemPayload {
            addr: 0x1_0000_0040,
            size: 64,
            ..Default::default()
        };
        mem.data[0] = 0xEE;
        mem.data[63] = 0x11;
        env.set_mem_payload(&mem);

        assert_eq!(env.header.payload_size as usize, std::mem::size_of::<MemPayload>());
        let back = env.mem_payload();
        assert_eq!(back.addr, 0x1_0000_0040);
        assert_eq!(back.size, 64);
        assert_eq!(back.data[0], 0xEE);
        assert_eq!(back.data[63], 0x11);
    }

    #[test]
    fn test_node_payload_hostname() {
        let mut node = NodePayload::default();
        node.set_hostname("node3");
        assert_eq!(node.hostname_str(), "node3");
        node.set_hostname("a-very-long-hostname-that-exceeds-the-field");
        assert_eq!(node.hostname_str().len(), 23);
    }

    #[test]
    fn test_msg_type_roundtrip() {
        for raw in 0..64u32 {
            if let Some(t) = MsgType::from_u32(raw) {
                assert_eq!(t as u32, raw);
            }
        }
        assert!(MsgType::from_u32(99).is_none());
        assert!(MsgType::ReadResp.is_response());
        assert!(MsgType::InvalidateAck.is_response());
        assert!(!MsgType::ReadReq.is_response());
        assert!(!MsgType::Invalidate.is_response());
    }
}
