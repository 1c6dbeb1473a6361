//! # CXLMemSim
//!
//! CXLMemSim simulates a Compute Express Link (CXL) memory fabric: a host
//! processor with local DRAM connected to memory expanders across simulated
//! nodes sharing one global address space. Latency and bandwidth costs are
//! attributed to every load, store and atomic so tiering, placement and
//! coherency policies can be evaluated without physical CXL hardware.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use cxlmemsim::prelude::*;
//!
//! let mut config = NodeServerConfig::new(0, "/cxlmemsim_dist");
//! config.memory_base = Some(0x1_0000_0000);
//! let server = NodeServer::new(config).unwrap();
//! server.start().unwrap();
//!
//! let mut buf = [0u8; 64];
//! server.write(0x1_0000_0000, &[0xAA; 64]).unwrap();
//! server.read(0x1_0000_0000, &mut buf).unwrap();
//! ```

// Re-export core components
pub use cxlmemsim_core::{self, *};

// Re-export commonly used dependencies for downstream crates
pub use anyhow;
pub use serde;
pub use thiserror;

/// The CXLMemSim prelude - everything you need to get started
pub mod prelude {
    // ============================================
    // Server and controller
    // ============================================
    pub use cxlmemsim_core::server::{
        CxlController, NodeServer, NodeServerConfig, PeerInfo, ServerStats,
    };

    // ============================================
    // Address decoding
    // ============================================
    pub use cxlmemsim_core::decoder::{
        DecodeResult, HdmDecoder, HdmDecoderMode, InterleaveGranularity, NO_TARGET,
    };

    // ============================================
    // Coherency
    // ============================================
    pub use cxlmemsim_core::coherency::{
        CoherencyEngine, CoherencyRequest, CoherencyResponse, CoherencyStats, MhsldCacheState,
    };

    // ============================================
    // Latency model and configuration
    // ============================================
    pub use cxlmemsim_core::config::ClusterConfig;
    pub use cxlmemsim_core::latency::{
        CalibrationResult, FabricLink, FabricLinkConfig, LogPConfig, LogPModel,
    };

    // ============================================
    // Memory and fabric
    // ============================================
    pub use cxlmemsim_core::error::{CxlError, CxlResult};
    pub use cxlmemsim_core::fabric::{MessageFabric, MsgType, NodeState};
    pub use cxlmemsim_core::memory::SharedMemoryManager;
}
