//! Cacheline directory: per-line MOESI state owned by the home node.
//!
//! The directory is an arena of individually lockable entries plus a hash
//! index from cacheline address to arena slot. The rw-lock guards only the
//! index lookup; all per-line mutation happens under the entry's own mutex,
//! so operations on different cachelines run in parallel while mutations of
//! one line are totally ordered. Entries are created lazily and never removed
//! while the node runs.

use crate::util::cacheline_addr;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Sentinel for "no owner / no head".
pub const NO_NODE: u32 = u32::MAX;

/// MOESI cacheline states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MhsldCacheState {
    Invalid = 0,
    Shared = 1,
    Exclusive = 2,
    Modified = 3,
    Owned = 4,
}

impl MhsldCacheState {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Shared,
            2 => Self::Exclusive,
            3 => Self::Modified,
            4 => Self::Owned,
            _ => Self::Invalid,
        }
    }
}

/// One cacheline's directory record. Always manipulated under its lock.
#[derive(Debug)]
pub struct DirectoryEntry {
    pub cacheline_addr: u64,
    pub state: MhsldCacheState,
    pub owner_node: u32,
    pub owner_head: u32,
    pub sharer_nodes: BTreeSet<u32>,
    pub version: u32,
    pub last_access_time: u64,
    pub has_dirty_data: bool,
}

impl DirectoryEntry {
    fn new(cacheline_addr: u64) -> Self {
        Self {
            cacheline_addr,
            state: MhsldCacheState::Invalid,
            owner_node: NO_NODE,
            owner_head: NO_NODE,
            sharer_nodes: BTreeSet::new(),
            version: 0,
            last_access_time: 0,
            has_dirty_data: false,
        }
    }

    pub fn clear_owner(&mut self) {
        self.owner_node = NO_NODE;
        self.owner_head = NO_NODE;
    }

    pub fn snapshot(&self) -> DirectoryEntrySnapshot {
        DirectoryEntrySnapshot {
            cacheline_addr: self.cacheline_addr,
            state: self.state,
            owner_node: self.owner_node,
            owner_head: self.owner_head,
            sharer_nodes: self.sharer_nodes.clone(),
            version: self.version,
            last_access_time: self.last_access_time,
            has_dirty_data: self.has_dirty_data,
        }
    }

    /// Capture the fields a failed transition must restore.
    pub(crate) fn rollback_point(&self) -> RollbackPoint {
        RollbackPoint {
            state: self.state,
            owner_node: self.owner_node,
            owner_head: self.owner_head,
            sharer_nodes: self.sharer_nodes.clone(),
            version: self.version,
            has_dirty_data: self.has_dirty_data,
        }
    }

    pub(crate) fn restore(&mut self, point: RollbackPoint) {
        self.state = point.state;
        self.owner_node = point.owner_node;
        self.owner_head = point.owner_head;
        self.sharer_nodes = point.sharer_nodes;
        self.version = point.version;
        self.has_dirty_data = point.has_dirty_data;
    }
}

pub(crate) struct RollbackPoint {
    state: MhsldCacheState,
    owner_node: u32,
    owner_head: u32,
    sharer_nodes: BTreeSet<u32>,
    version: u32,
    has_dirty_data: bool,
}

/// Consistent copy of an entry, for statistics, DIR_QUERY and tests.
#[derive(Debug, Clone)]
pub struct DirectoryEntrySnapshot {
    pub cacheline_addr: u64,
    pub state: MhsldCacheState,
    pub owner_node: u32,
    pub owner_head: u32,
    pub sharer_nodes: BTreeSet<u32>,
    pub version: u32,
    pub last_access_time: u64,
    pub has_dirty_data: bool,
}

impl DirectoryEntrySnapshot {
    /// Verify the per-state structural invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        use MhsldCacheState::*;
        let has_owner = self.owner_node != NO_NODE;
        match self.state {
            Invalid => {
                if has_owner || !self.sharer_nodes.is_empty() {
                    return Err(format!(
                        "Invalid line 0x{:x} has owner={} sharers={:?}",
                        self.cacheline_addr, self.owner_node, self.sharer_nodes
                    ));
                }
            }
            Modified => {
                if !self.sharer_nodes.is_empty() || !has_owner || !self.has_dirty_data {
                    return Err(format!(
                        "Modified line 0x{:x} violates M invariants (owner={}, sharers={:?}, dirty={})",
                        self.cacheline_addr, self.owner_node, self.sharer_nodes, self.has_dirty_data
                    ));
                }
            }
            Exclusive => {
                if !self.sharer_nodes.is_empty() || !has_owner || self.has_dirty_data {
                    return Err(format!(
                        "Exclusive line 0x{:x} violates E invariants (owner={}, sharers={:?}, dirty={})",
                        self.cacheline_addr, self.owner_node, self.sharer_nodes, self.has_dirty_data
                    ));
                }
            }
            Owned => {
                if !has_owner || !self.has_dirty_data {
                    return Err(format!(
                        "Owned line 0x{:x} violates O invariants (owner={}, dirty={})",
                        self.cacheline_addr, self.owner_node, self.has_dirty_data
                    ));
                }
            }
            Shared => {
                if has_owner || self.sharer_nodes.is_empty() {
                    return Err(format!(
                        "Shared line 0x{:x} violates S invariants (owner={}, sharers={:?})",
                        self.cacheline_addr, self.owner_node, self.sharer_nodes
                    ));
                }
            }
        }
        if has_owner && self.sharer_nodes.contains(&self.owner_node) {
            return Err(format!(
                "line 0x{:x}: node {} is both owner and sharer",
                self.cacheline_addr, self.owner_node
            ));
        }
        Ok(())
    }
}

struct DirectoryInner {
    index: HashMap<u64, usize>,
    slab: Vec<Arc<Mutex<DirectoryEntry>>>,
}

pub struct Directory {
    inner: RwLock<DirectoryInner>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(DirectoryInner {
                index: HashMap::new(),
                slab: Vec::new(),
            }),
        }
    }

    /// Fetch the entry for `addr`'s cacheline, creating it lazily.
    ///
    /// The rw-lock is held only for the lookup/insert; the caller locks the
    /// returned entry itself.
    pub fn get_or_create(&self, addr: u64) -> Arc<Mutex<DirectoryEntry>> {
        let cl_addr = cacheline_addr(addr);
        {
            let inner = self.inner.read();
            if let Some(&slot) = inner.index.get(&cl_addr) {
                return Arc::clone(&inner.slab[slot]);
            }
        }

        let mut inner = self.inner.write();
        if let Some(&slot) = inner.index.get(&cl_addr) {
            return Arc::clone(&inner.slab[slot]);
        }
        let entry = Arc::new(Mutex::new(DirectoryEntry::new(cl_addr)));
        let slot = inner.slab.len();
        inner.slab.push(Arc::clone(&entry));
        inner.index.insert(cl_addr, slot);
        entry
    }

    /// Fetch an existing entry without creating one.
    pub fn lookup(&self, addr: u64) -> Option<Arc<Mutex<DirectoryEntry>>> {
        let cl_addr = cacheline_addr(addr);
        let inner = self.inner.read();
        inner
            .index
            .get(&cl_addr)
            .map(|&slot| Arc::clone(&inner.slab[slot]))
    }

    pub fn len(&self) -> usize {
        self.inner.read().slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot a single entry.
    pub fn entry_snapshot(&self, addr: u64) -> Option<DirectoryEntrySnapshot> {
        self.lookup(addr).map(|entry| entry.lock().snapshot())
    }

    /// Snapshot every entry; each entry is internally consistent (taken
    /// under its lock) though the set is not a global atomic cut.
    pub fn snapshots(&self) -> Vec<DirectoryEntrySnapshot> {
        let entries: Vec<_> = {
            let inner = self.inner.read();
            inner.slab.iter().map(Arc::clone).collect()
        };
        entries.iter().map(|e| e.lock().snapshot()).collect()
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_creation_and_alignment() {
        let dir = Directory::new();
        assert!(dir.lookup(0x1000).is_none());

        let entry = dir.get_or_create(0x1028); // mid-line address
        assert_eq!(entry.lock().cacheline_addr, 0x1000);
        assert_eq!(dir.len(), 1);

        // Same cacheline, same entry.
        let again = dir.get_or_create(0x103F);
        assert!(Arc::ptr_eq(&entry, &again));
        assert_eq!(dir.len(), 1);

        let other = dir.get_or_create(0x1040);
        assert!(!Arc::ptr_eq(&entry, &other));
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn test_invariant_checker_catches_violations() {
        let dir = Directory::new();
        let entry = dir.get_or_create(0x2000);
        {
            let mut e = entry.lock();
            e.state = MhsldCacheState::Modified;
            e.owner_node = 1;
            e.has_dirty_data = true;
        }
        assert!(dir.entry_snapshot(0x2000).unwrap().check_invariants().is_ok());

        {
            let mut e = entry.lock();
            e.sharer_nodes.insert(2); // M with sharers is illegal
        }
        assert!(dir.entry_snapshot(0x2000).unwrap().check_invariants().is_err());
    }

    #[test]
    fn test_rollback_restores_fields() {
        let dir = Directory::new();
        let entry = dir.get_or_create(0x3000);
        let mut e = entry.lock();
        e.state = MhsldCacheState::Shared;
        e.sharer_nodes.insert(1);
        e.version = 4;

        let point = e.rollback_point();
        e.state = MhsldCacheState::Modified;
        e.owner_node = 2;
        e.sharer_nodes.clear();
        e.version = 5;
        e.has_dirty_data = true;

        e.restore(point);
        assert_eq!(e.state, MhsldCacheState::Shared);
        assert_eq!(e.owner_node, NO_NODE);
        assert!(e.sharer_nodes.contains(&1));
        assert_eq!(e.version, 4);
        assert!(!e.has_dirty_data);
    }
}
