//! Small shared utilities.

use once_cell::sync::Lazy;
use std::time::Instant;

static CLOCK_BASE: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic timestamp in nanoseconds since process start.
///
/// All latency accounting and heartbeat stamps use this clock, so timestamps
/// are comparable across threads but not across processes.
pub fn now_ns() -> u64 {
    CLOCK_BASE.elapsed().as_nanos() as u64
}

/// Cacheline size of the simulated fabric, in bytes.
pub const CACHELINE_SIZE: u64 = 64;

/// Align a byte address down to its cacheline address.
#[inline]
pub fn cacheline_addr(addr: u64) -> u64 {
    addr & !(CACHELINE_SIZE - 1)
}
