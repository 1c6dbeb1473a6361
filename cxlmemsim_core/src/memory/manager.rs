//! Per-node shared memory manager.
//!
//! Owns one shared segment holding the node's cacheline data area. The layout
//! is a small header followed by `num_cachelines * 64` bytes of data. When the
//! configured base address is 0 the manager accepts any address and maps it
//! modulo the number of cachelines (address-agnostic test mode); otherwise
//! addresses must fall inside `[base_addr, base_addr + capacity)`.
//!
//! Cacheline bytes carry no locks of their own: exclusive access is the
//! coherency directory's job, the data area only moves bytes.

use crate::error::{CxlError, CxlResult};
use crate::memory::shm_region::ShmRegion;
use crate::util::{cacheline_addr, CACHELINE_SIZE};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{fence, AtomicU64, Ordering};

const SMM_MAGIC: u64 = 0x43584C4D454D5348; // "CXLMEMSH"
const SMM_VERSION: u64 = 1;

/// Environment variable naming a node's memory base address.
/// `0` (or unset) means "accept any address" via modulo mapping.
pub const CXL_BASE_ADDR_ENV: &str = "CXL_BASE_ADDR";

#[repr(C)]
struct SmmHeader {
    magic: u64,
    version: u64,
    total_size: u64,
    data_offset: u64,
    num_cachelines: u64,
    base_addr: u64,
}

/// Summary of a data segment, exchanged with peers at registration.
#[derive(Debug, Clone)]
pub struct SharedMemoryInfo {
    pub shm_name: String,
    pub size: usize,
    pub base_addr: u64,
    pub num_cachelines: u64,
}

#[derive(Debug, Clone, Copy)]
struct MemoryRegion {
    base_addr: u64,
    size: usize,
    allocated: bool,
}

/// Memory usage statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub total_capacity: usize,
    pub used_memory: usize,
    pub num_cachelines: u64,
    pub active_cachelines: u64,
}

pub struct SharedMemoryManager {
    region: ShmRegion,
    shm_name: String,
    regions: Mutex<Vec<MemoryRegion>>,
}

unsafe impl Send for SharedMemoryManager {}
unsafe impl Sync for SharedMemoryManager {}

/// Parse `CXL_BASE_ADDR` (hex with `0x` prefix or decimal).
pub fn base_addr_from_env() -> CxlResult<u64> {
    match std::env::var(CXL_BASE_ADDR_ENV) {
        Err(_) => Ok(0),
        Ok(raw) => {
            let raw = raw.trim();
            let parsed = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16)
            } else {
                raw.parse::<u64>()
            };
            parsed.map_err(|e| {
                CxlError::config(format!("bad {} value '{}': {}", CXL_BASE_ADDR_ENV, raw, e))
            })
        }
    }
}

impl SharedMemoryManager {
    /// Create or reuse a POSIX segment of `capacity_mb` megabytes.
    ///
    /// The base address comes from `base_addr` when given, otherwise from
    /// `CXL_BASE_ADDR`. An existing segment with a valid header is reused
    /// with its data preserved.
    pub fn new(capacity_mb: usize, shm_name: &str, base_addr: Option<u64>) -> CxlResult<Self> {
        if capacity_mb == 0 {
            return Err(CxlError::config("SMM capacity must be non-zero"));
        }
        let size = capacity_mb * 1024 * 1024;
        let region = ShmRegion::create_or_open(shm_name, size)?;
        Self::finish_init(region, shm_name, size, base_addr)
    }

    /// File-backed variant: the data area persists in a regular file.
    pub fn with_file_backing<P: AsRef<Path>>(
        capacity_mb: usize,
        path: P,
        base_addr: Option<u64>,
    ) -> CxlResult<Self> {
        if capacity_mb == 0 {
            return Err(CxlError::config("SMM capacity must be non-zero"));
        }
        let size = capacity_mb * 1024 * 1024;
        let name = path.as_ref().display().to_string();
        let region = ShmRegion::create_file(path, size)?;
        Self::finish_init(region, &name, size, base_addr)
    }

    fn finish_init(
        region: ShmRegion,
        name: &str,
        size: usize,
        base_addr: Option<u64>,
    ) -> CxlResult<Self> {
        let base = match base_addr {
            Some(b) => b,
            None => base_addr_from_env()?,
        };

        let header = region.as_ptr() as *mut SmmHeader;
        let data_offset = std::mem::size_of::<SmmHeader>() as u64;
        let num_cachelines = (size as u64 - data_offset) / CACHELINE_SIZE;

        unsafe {
            if (*header).magic == SMM_MAGIC && (*header).version == SMM_VERSION {
                log::info!("SMM '{}' already initialized, keeping existing data", name);
            } else {
                (*header).magic = SMM_MAGIC;
                (*header).version = SMM_VERSION;
                (*header).total_size = size as u64;
                (*header).data_offset = data_offset;
                (*header).num_cachelines = num_cachelines;
                (*header).base_addr = base;
                log::info!(
                    "SMM '{}' initialized: base 0x{:x}, {} cachelines",
                    name,
                    base,
                    num_cachelines
                );
            }
        }

        let smm = Self {
            region,
            shm_name: name.to_string(),
            regions: Mutex::new(Vec::new()),
        };
        smm.regions.lock().push(MemoryRegion {
            base_addr: smm.base_addr(),
            size: (smm.num_cachelines() * CACHELINE_SIZE) as usize,
            allocated: false,
        });
        Ok(smm)
    }

    fn header(&self) -> &SmmHeader {
        unsafe { &*(self.region.as_ptr() as *const SmmHeader) }
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().add(self.header().data_offset as usize) }
    }

    pub fn base_addr(&self) -> u64 {
        self.header().base_addr
    }

    pub fn num_cachelines(&self) -> u64 {
        self.header().num_cachelines
    }

    pub fn get_shm_info(&self) -> SharedMemoryInfo {
        SharedMemoryInfo {
            shm_name: self.shm_name.clone(),
            size: self.region.size(),
            base_addr: self.base_addr(),
            num_cachelines: self.num_cachelines(),
        }
    }

    /// Whether this segment can serve `addr`.
    pub fn contains(&self, addr: u64) -> bool {
        let base = self.base_addr();
        if base == 0 {
            return true;
        }
        addr >= base && addr < base + self.num_cachelines() * CACHELINE_SIZE
    }

    fn cacheline_index(&self, cl_addr: u64) -> Option<u64> {
        let hdr = self.header();
        if hdr.base_addr == 0 {
            return Some((cl_addr / CACHELINE_SIZE) % hdr.num_cachelines);
        }
        if cl_addr < hdr.base_addr {
            return None;
        }
        let index = (cl_addr - hdr.base_addr) / CACHELINE_SIZE;
        if index >= hdr.num_cachelines {
            return None;
        }
        Some(index)
    }

    /// Raw pointer to a cacheline's bytes, or None when unmapped.
    pub fn get_cacheline_data(&self, cl_addr: u64) -> Option<*mut u8> {
        let index = self.cacheline_index(cacheline_addr(cl_addr))?;
        Some(unsafe { self.data_ptr().add((index * CACHELINE_SIZE) as usize) })
    }

    /// Copy bytes out of the data area.
    ///
    /// Modulo mode allows reads spanning cachelines; with a fixed base a read
    /// must stay inside one cacheline.
    pub fn read_cacheline(&self, addr: u64, buf: &mut [u8]) -> CxlResult<()> {
        if self.base_addr() == 0 {
            let mut done = 0usize;
            while done < buf.len() {
                let cur = addr + done as u64;
                let cl = cacheline_addr(cur);
                let offset = (cur - cl) as usize;
                let chunk = (buf.len() - done).min(CACHELINE_SIZE as usize - offset);
                let src = self
                    .get_cacheline_data(cl)
                    .ok_or_else(|| CxlError::shm(format!("unmapped cacheline 0x{:x}", cl)))?;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.add(offset),
                        buf.as_mut_ptr().add(done),
                        chunk,
                    );
                }
                done += chunk;
            }
            return Ok(());
        }

        let cl = cacheline_addr(addr);
        let offset = (addr - cl) as usize;
        if offset + buf.len() > CACHELINE_SIZE as usize {
            return Err(CxlError::invalid_input(format!(
                "read crosses cacheline boundary: addr=0x{:x} size={}",
                addr,
                buf.len()
            )));
        }
        let src = self
            .get_cacheline_data(cl)
            .ok_or_else(|| CxlError::shm(format!("invalid cacheline address 0x{:x}", cl)))?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy bytes into the data area and flush them to the segment.
    pub fn write_cacheline(&self, addr: u64, data: &[u8]) -> CxlResult<()> {
        if self.base_addr() == 0 {
            let mut done = 0usize;
            while done < data.len() {
                let cur = addr + done as u64;
                let cl = cacheline_addr(cur);
                let offset = (cur - cl) as usize;
                let chunk = (data.len() - done).min(CACHELINE_SIZE as usize - offset);
                let dst = self
                    .get_cacheline_data(cl)
                    .ok_or_else(|| CxlError::shm(format!("unmapped cacheline 0x{:x}", cl)))?;
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr().add(done), dst.add(offset), chunk);
                }
                done += chunk;
            }
            fence(Ordering::SeqCst);
            return self.sync_span(addr, data.len());
        }

        let cl = cacheline_addr(addr);
        let offset = (addr - cl) as usize;
        if offset + data.len() > CACHELINE_SIZE as usize {
            return Err(CxlError::invalid_input(format!(
                "write crosses cacheline boundary: addr=0x{:x} size={}",
                addr,
                data.len()
            )));
        }
        let dst = self
            .get_cacheline_data(cl)
            .ok_or_else(|| CxlError::shm(format!("invalid cacheline address 0x{:x}", cl)))?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst.add(offset), data.len());
        }
        fence(Ordering::SeqCst);
        self.sync_span(addr, data.len())
    }

    fn sync_span(&self, addr: u64, len: usize) -> CxlResult<()> {
        let cl = cacheline_addr(addr);
        let Some(index) = self.cacheline_index(cl) else {
            return Ok(());
        };
        let start = self.header().data_offset as usize + (index * CACHELINE_SIZE) as usize;
        let span = (addr - cl) as usize + len;
        let span = span.min(self.region.size() - start);
        self.region.sync_range(start, span.max(1))
    }

    fn atomic_word(&self, addr: u64) -> CxlResult<&AtomicU64> {
        if addr % 8 != 0 {
            return Err(CxlError::invalid_input(format!(
                "atomic address 0x{:x} is not 8-byte aligned",
                addr
            )));
        }
        let cl = cacheline_addr(addr);
        let ptr = self
            .get_cacheline_data(cl)
            .ok_or_else(|| CxlError::shm(format!("invalid cacheline address 0x{:x}", cl)))?;
        let offset = (addr - cl) as usize;
        Ok(unsafe { &*(ptr.add(offset) as *const AtomicU64) })
    }

    /// Sequentially consistent fetch-add on the word at `addr`; returns old.
    pub fn fetch_add_u64(&self, addr: u64, value: u64) -> CxlResult<u64> {
        Ok(self.atomic_word(addr)?.fetch_add(value, Ordering::SeqCst))
    }

    /// Sequentially consistent compare-and-swap; returns the observed value.
    pub fn compare_exchange_u64(&self, addr: u64, expected: u64, desired: u64) -> CxlResult<u64> {
        match self.atomic_word(addr)?.compare_exchange(
            expected,
            desired,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(old) => Ok(old),
            Err(observed) => Ok(observed),
        }
    }

    /// Mark `[addr, addr + size)` as allocated in the region tracking.
    pub fn allocate_region(&self, addr: u64, size: usize) -> bool {
        let mut regions = self.regions.lock();
        for region in regions.iter_mut() {
            if addr >= region.base_addr
                && addr as u128 + size as u128 <= region.base_addr as u128 + region.size as u128
                && !region.allocated
            {
                region.allocated = true;
                log::debug!("Allocated region addr=0x{:x} size={}", addr, size);
                return true;
            }
        }
        false
    }

    pub fn deallocate_region(&self, addr: u64) -> bool {
        let mut regions = self.regions.lock();
        for region in regions.iter_mut() {
            if region.base_addr == addr && region.allocated {
                region.allocated = false;
                return true;
            }
        }
        false
    }

    pub fn is_valid_address(&self, addr: u64) -> bool {
        self.contains(addr)
    }

    pub fn get_stats(&self) -> MemoryStats {
        let regions = self.regions.lock();
        let used: usize = regions.iter().filter(|r| r.allocated).map(|r| r.size).sum();
        MemoryStats {
            total_capacity: self.region.size(),
            used_memory: used,
            num_cachelines: self.num_cachelines(),
            active_cachelines: used as u64 / CACHELINE_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/cxlsmm_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_modulo_mode_roundtrip() {
        let smm = SharedMemoryManager::new(1, &unique_name("mod"), Some(0)).unwrap();
        let pattern = [0xA5u8; 64];
        smm.write_cacheline(0xDEAD_BEEF_000, &pattern).unwrap();
        let mut out = [0u8; 64];
        smm.read_cacheline(0xDEAD_BEEF_000, &mut out).unwrap();
        assert_eq!(out, pattern);
    }

    #[test]
    fn test_modulo_mode_spans_cachelines() {
        let smm = SharedMemoryManager::new(1, &unique_name("span"), Some(0)).unwrap();
        let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        smm.write_cacheline(32, &data).unwrap();
        let mut out = vec![0u8; 200];
        smm.read_cacheline(32, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_based_mode_bounds() {
        let base = 0x1_0000_0000u64;
        let smm = SharedMemoryManager::new(1, &unique_name("based"), Some(base)).unwrap();
        assert!(smm.contains(base));
        assert!(!smm.contains(base - 64));

        let pattern = [0x3Cu8; 64];
        smm.write_cacheline(base, &pattern).unwrap();
        let mut out = [0u8; 64];
        smm.read_cacheline(base, &mut out).unwrap();
        assert_eq!(out, pattern);

        // Below-base addresses are unmapped.
        assert!(smm.write_cacheline(base - 64, &pattern).is_err());
        // Reads may not straddle a cacheline in based mode.
        let mut big = [0u8; 64];
        assert!(smm.read_cacheline(base + 32, &mut big).is_err());
    }

    #[test]
    fn test_atomic_faa_and_cas() {
        let smm = SharedMemoryManager::new(1, &unique_name("atomic"), Some(0)).unwrap();
        let addr = 0x400u64;
        smm.write_cacheline(addr, &0u64.to_le_bytes()).unwrap();

        assert_eq!(smm.fetch_add_u64(addr, 5).unwrap(), 0);
        assert_eq!(smm.fetch_add_u64(addr, 3).unwrap(), 5);

        // CAS success then failure
        assert_eq!(smm.compare_exchange_u64(addr, 8, 100).unwrap(), 8);
        assert_eq!(smm.compare_exchange_u64(addr, 8, 200).unwrap(), 100);

        assert!(smm.fetch_add_u64(addr + 4, 1).is_err());
    }

    #[test]
    fn test_region_tracking() {
        let smm = SharedMemoryManager::new(1, &unique_name("regions"), Some(0)).unwrap();
        assert!(smm.allocate_region(0, 4096));
        assert!(!smm.allocate_region(0, 4096));
        assert!(smm.get_stats().used_memory > 0);
        assert!(smm.deallocate_region(0));
        assert_eq!(smm.get_stats().used_memory, 0);
    }

    #[test]
    fn test_file_backing_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smm.dat");
        {
            let smm = SharedMemoryManager::with_file_backing(1, &path, Some(0)).unwrap();
            smm.write_cacheline(128, &[9u8; 64]).unwrap();
        }
        let smm = SharedMemoryManager::with_file_backing(1, &path, Some(0)).unwrap();
        let mut out = [0u8; 64];
        smm.read_cacheline(128, &mut out).unwrap();
        assert_eq!(out, [9u8; 64]);
    }
}
