//! Shared memory: raw region mapping and the per-node data segment manager.

pub mod manager;
pub mod shm_region;

pub use manager::{
    base_addr_from_env, MemoryStats, SharedMemoryInfo, SharedMemoryManager, CXL_BASE_ADDR_ENV,
};
pub use shm_region::ShmRegion;
