//! # CXLMemSim Core
//!
//! Distributed coherency and address-decoding core of the CXLMemSim memory
//! fabric simulator. A host with local DRAM plus CXL memory expanders is
//! modeled as a set of nodes sharing one global address space; every load,
//! store and atomic is attributed a realistic latency.
//!
//! The building blocks:
//!
//! - **Memory**: per-node shared memory segments holding real cacheline bytes
//! - **Decoder**: HDM address decoding (range-based, interleaved, hybrid)
//! - **Coherency**: a unified MOESI directory engine with per-line locks
//! - **Fabric**: lock-free ring queues in one shared segment, with
//!   request/response correlation and a worker pool
//! - **Latency**: the LogP network model and per-peer fabric links
//! - **Server**: the per-node memory server tying it all together
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use cxlmemsim_core::server::{NodeServer, NodeServerConfig};
//!
//! let mut config = NodeServerConfig::new(0, "/cxlmemsim_dist");
//! config.memory_base = Some(0x1_0000_0000);
//! let server = NodeServer::new(config).unwrap();
//! server.start().unwrap();
//!
//! let latency = server.write(0x1_0000_0000, &[0xAA; 64]).unwrap();
//! println!("write took {} ns", latency);
//! ```

pub mod coherency;
pub mod config;
pub mod decoder;
pub mod error;
pub mod fabric;
pub mod latency;
pub mod memory;
pub mod server;
pub mod util;

// Re-export commonly used types for easy access
pub use coherency::{
    CoherencyEngine, CoherencyRequest, CoherencyResponse, CoherencyStats, MhsldCacheState, NO_NODE,
};
pub use config::ClusterConfig;
pub use decoder::{DecodeResult, HdmDecoder, HdmDecoderMode, InterleaveGranularity, NO_TARGET};
pub use error::{CxlError, CxlResult};
pub use fabric::{Envelope, MessageFabric, MsgType, NodeState, DEFAULT_FABRIC_SHM};
pub use latency::{CalibrationResult, FabricLink, FabricLinkConfig, LogPConfig, LogPModel};
pub use memory::{SharedMemoryManager, CXL_BASE_ADDR_ENV};
pub use server::{CxlController, NodeServer, NodeServerConfig, ServerStats};
pub use util::{cacheline_addr, now_ns, CACHELINE_SIZE};
