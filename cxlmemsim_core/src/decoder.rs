//! HDM (Host-managed Device Memory) decoder.
//!
//! Maps a global address to its home node and local offset under range-based,
//! interleaved, or hybrid decoding. Ranges and the interleave set are
//! configured at topology setup; `decode` is pure and safe for concurrent
//! readers.

use crate::error::{CxlError, CxlResult};
use parking_lot::RwLock;

/// Sentinel target id meaning "unmapped".
pub const NO_TARGET: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdmDecoderMode {
    Interleaved,
    RangeBased,
    Hybrid,
}

/// CXL-defined interleave granularities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum InterleaveGranularity {
    Cacheline64B = 64,
    Cacheline256B = 256,
    Page4K = 4096,
    Page2M = 2_097_152,
    Page1G = 1_073_741_824,
}

impl InterleaveGranularity {
    pub fn bytes(self) -> u64 {
        self as u64
    }

    pub fn from_bytes(bytes: u64) -> Option<Self> {
        match bytes {
            64 => Some(Self::Cacheline64B),
            256 => Some(Self::Cacheline256B),
            4096 => Some(Self::Page4K),
            2_097_152 => Some(Self::Page2M),
            1_073_741_824 => Some(Self::Page1G),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HdmRange {
    pub base_addr: u64,
    pub size: u64,
    pub target_id: u32,
    pub is_remote: bool,
}

#[derive(Debug, Clone, Default)]
struct InterleaveConfig {
    granularity: u64,
    target_ids: Vec<u32>,
    base_addr: u64,
    total_size: u64,
}

/// Result of decoding a global address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeResult {
    pub target_id: u32,
    /// Offset within the target's memory.
    pub local_offset: u64,
    pub is_remote: bool,
    pub hop_count: u32,
}

impl DecodeResult {
    pub const UNMAPPED: DecodeResult = DecodeResult {
        target_id: NO_TARGET,
        local_offset: 0,
        is_remote: false,
        hop_count: 0,
    };

    pub fn is_mapped(&self) -> bool {
        self.target_id != NO_TARGET
    }
}

pub struct HdmDecoder {
    mode: HdmDecoderMode,
    // Kept sorted by base address so decode can binary-search.
    ranges: RwLock<Vec<HdmRange>>,
    interleave: RwLock<InterleaveConfig>,
}

impl HdmDecoder {
    pub fn new(mode: HdmDecoderMode) -> Self {
        Self {
            mode,
            ranges: RwLock::new(Vec::new()),
            interleave: RwLock::new(InterleaveConfig::default()),
        }
    }

    pub fn mode(&self) -> HdmDecoderMode {
        self.mode
    }

    pub fn num_ranges(&self) -> usize {
        self.ranges.read().len()
    }

    /// Register a target's address range. Overlapping ranges are a
    /// configuration error reported here, never at decode time.
    pub fn add_range(
        &self,
        base: u64,
        size: u64,
        target_id: u32,
        is_remote: bool,
    ) -> CxlResult<()> {
        if size == 0 {
            return Err(CxlError::config("HDM range size must be non-zero"));
        }
        let end = base
            .checked_add(size)
            .ok_or_else(|| CxlError::config("HDM range wraps the address space"))?;

        let mut ranges = self.ranges.write();
        for r in ranges.iter() {
            let r_end = r.base_addr + r.size;
            if base < r_end && r.base_addr < end {
                return Err(CxlError::config(format!(
                    "HDM range 0x{:x}+0x{:x} overlaps existing range 0x{:x}+0x{:x} (target {})",
                    base, size, r.base_addr, r.size, r.target_id
                )));
            }
        }
        let pos = ranges.partition_point(|r| r.base_addr < base);
        ranges.insert(
            pos,
            HdmRange {
                base_addr: base,
                size,
                target_id,
                is_remote,
            },
        );
        log::debug!(
            "HDM range added: 0x{:x}+0x{:x} -> target {} (remote={})",
            base,
            size,
            target_id,
            is_remote
        );
        Ok(())
    }

    pub fn configure_interleave(
        &self,
        granularity: InterleaveGranularity,
        targets: &[u32],
        base: u64,
        total_size: u64,
    ) -> CxlResult<()> {
        if targets.is_empty() {
            return Err(CxlError::config("interleave target set is empty"));
        }
        if total_size == 0 || total_size % granularity.bytes() != 0 {
            return Err(CxlError::config(format!(
                "interleave size 0x{:x} is not a multiple of granularity {}",
                total_size,
                granularity.bytes()
            )));
        }
        let mut cfg = self.interleave.write();
        cfg.granularity = granularity.bytes();
        cfg.target_ids = targets.to_vec();
        cfg.base_addr = base;
        cfg.total_size = total_size;
        Ok(())
    }

    pub fn decode(&self, addr: u64) -> DecodeResult {
        match self.mode {
            HdmDecoderMode::RangeBased => self.decode_range(addr),
            HdmDecoderMode::Interleaved => self.decode_interleaved(addr),
            HdmDecoderMode::Hybrid => {
                let result = self.decode_range(addr);
                if result.is_mapped() {
                    result
                } else {
                    self.decode_interleaved(addr)
                }
            }
        }
    }

    fn decode_range(&self, addr: u64) -> DecodeResult {
        let ranges = self.ranges.read();
        if ranges.is_empty() {
            return DecodeResult::UNMAPPED;
        }

        // Last range starting at or below addr is the only candidate.
        let idx = ranges.partition_point(|r| r.base_addr <= addr);
        if idx == 0 {
            return DecodeResult::UNMAPPED;
        }
        let range = &ranges[idx - 1];
        if addr >= range.base_addr + range.size {
            return DecodeResult::UNMAPPED;
        }
        DecodeResult {
            target_id: range.target_id,
            local_offset: addr - range.base_addr,
            is_remote: range.is_remote,
            hop_count: if range.is_remote { 1 } else { 0 },
        }
    }

    fn decode_interleaved(&self, addr: u64) -> DecodeResult {
        let cfg = self.interleave.read();
        if cfg.target_ids.is_empty() {
            return DecodeResult::UNMAPPED;
        }
        if addr < cfg.base_addr || addr >= cfg.base_addr + cfg.total_size {
            return DecodeResult::UNMAPPED;
        }

        let relative = addr - cfg.base_addr;
        let block_index = relative / cfg.granularity;
        let num_targets = cfg.target_ids.len() as u64;
        let target_id = cfg.target_ids[(block_index % num_targets) as usize];

        let target_block = block_index / num_targets;
        let intra = relative % cfg.granularity;
        let local_offset = target_block * cfg.granularity + intra;

        // Remoteness is inherited from a configured range for the target.
        let is_remote = self
            .ranges
            .read()
            .iter()
            .find(|r| r.target_id == target_id)
            .map(|r| r.is_remote)
            .unwrap_or(false);

        DecodeResult {
            target_id,
            local_offset,
            is_remote,
            hop_count: if is_remote { 1 } else { 0 },
        }
    }

    pub fn get_home_node(&self, addr: u64) -> u32 {
        self.decode(addr).target_id
    }

    pub fn is_local(&self, addr: u64, local_node_id: u32) -> bool {
        let result = self.decode(addr);
        result.target_id == local_node_id && !result.is_remote
    }
}
