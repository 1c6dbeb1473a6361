//! MOESI coherency: the per-line directory and the unified engine.

pub mod directory;
pub mod engine;

pub use directory::{
    Directory, DirectoryEntry, DirectoryEntrySnapshot, MhsldCacheState, NO_NODE,
};
pub use engine::{
    CoherencyEngine, CoherencyRequest, CoherencyResponse, CoherencyStats, CoherencyTransport,
    HeadState, MAX_HEADS,
};
