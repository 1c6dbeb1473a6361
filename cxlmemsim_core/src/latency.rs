//! LogP network cost model and per-peer fabric link traversal.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// LogP parameters in nanoseconds: fixed latency, sender overhead, receiver
/// overhead, inter-message gap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogPConfig {
    pub l: f64,
    pub o_s: f64,
    pub o_r: f64,
    pub g: f64,
}

impl Default for LogPConfig {
    /// Defaults for a typical CXL switch hop: 150 ns latency, 20 ns
    /// send/receive overhead, 4 ns gap (250 MHz message rate).
    fn default() -> Self {
        Self {
            l: 150.0,
            o_s: 20.0,
            o_r: 20.0,
            g: 4.0,
        }
    }
}

impl LogPConfig {
    pub fn new(l: f64, o_s: f64, o_r: f64, g: f64) -> Self {
        Self { l, o_s, o_r, g }
    }

    pub fn is_valid(&self) -> bool {
        self.l >= 0.0 && self.o_s >= 0.0 && self.o_r >= 0.0 && self.g >= 0.0
    }
}

/// Measured LogP parameters for one peer, e.g. from a ping-pong calibration.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalibrationResult {
    pub l: f64,
    pub o_s: f64,
    pub o_r: f64,
    pub g: f64,
    pub samples: u64,
    pub valid: bool,
}

/// LogP latency model with optional per-peer calibrated overrides.
///
/// Reads are lock-light and concurrency-safe; calibration updates are rare.
pub struct LogPModel {
    config: LogPConfig,
    overrides: RwLock<HashMap<u32, LogPConfig>>,
}

impl LogPModel {
    pub fn new(config: LogPConfig) -> Self {
        Self {
            config,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> LogPConfig {
        self.config
    }

    fn config_for(&self, peer: u32) -> LogPConfig {
        self.overrides
            .read()
            .get(&peer)
            .copied()
            .unwrap_or(self.config)
    }

    /// One-way message latency to `peer` at timestamp `_ts`: `L + o_s + o_r`.
    pub fn message_latency(&self, _ts: u64, peer: u32) -> f64 {
        let cfg = self.config_for(peer);
        cfg.l + cfg.o_s + cfg.o_r
    }

    /// Inter-message gap on the link to `peer`.
    pub fn gap(&self, peer: u32) -> f64 {
        self.config_for(peer).g
    }

    /// Serialization penalty charged to atomics: `o_s + o_r`.
    pub fn serialization_overhead(&self) -> f64 {
        self.config.o_s + self.config.o_r
    }

    /// Install calibrated parameters for `peer`. Invalid or empty
    /// calibrations are ignored; returns whether the values were applied.
    pub fn apply_calibration(&self, peer: u32, result: &CalibrationResult) -> bool {
        if !result.valid || result.samples == 0 {
            log::debug!("Ignoring invalid calibration for peer {}", peer);
            return false;
        }
        let cfg = LogPConfig::new(result.l, result.o_s, result.o_r, result.g);
        if !cfg.is_valid() {
            log::warn!("Calibration for peer {} has negative parameters, ignored", peer);
            return false;
        }
        self.overrides.write().insert(peer, cfg);
        log::info!(
            "LogP calibration for peer {}: L={:.1} o_s={:.1} o_r={:.1} g={:.1} ({} samples)",
            peer,
            cfg.l,
            cfg.o_s,
            cfg.o_r,
            cfg.g,
            result.samples
        );
        true
    }
}

/// Per-peer link traversal parameters.
#[derive(Debug, Clone, Copy)]
pub struct FabricLinkConfig {
    pub hop_latency_ns: f64,
    pub bandwidth_gbps: f64,
    pub credits: u32,
}

impl Default for FabricLinkConfig {
    fn default() -> Self {
        Self {
            hop_latency_ns: 100.0,
            bandwidth_gbps: 25.0,
            credits: 32,
        }
    }
}

/// Bandwidth/credit traversal model for one peer link.
///
/// Each message serializes at the link bandwidth behind the previous
/// departure; the credit window caps how much backlog a message can queue
/// behind.
pub struct FabricLink {
    config: FabricLinkConfig,
    last_depart: Mutex<f64>,
}

impl FabricLink {
    pub fn new(config: FabricLinkConfig) -> Self {
        Self {
            config,
            last_depart: Mutex::new(0.0),
        }
    }

    pub fn config(&self) -> FabricLinkConfig {
        self.config
    }

    /// Delay for `bytes` entering the link at time `ts` (ns).
    pub fn traversal_latency(&self, ts: u64, bytes: u64) -> f64 {
        let ts = ts as f64;
        // GB/s is numerically bytes-per-ns.
        let serialize = bytes as f64 / self.config.bandwidth_gbps;
        let mut last = self.last_depart.lock();

        let backlog = (*last - ts).max(0.0);
        let backlog = backlog.min(self.config.credits as f64 * serialize);
        let depart = ts + backlog;
        *last = depart + serialize;

        backlog + serialize + self.config.hop_latency_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_latency() {
        let model = LogPModel::new(LogPConfig::default());
        assert!((model.message_latency(0, 1) - 190.0).abs() < 1e-9);
        assert!((model.gap(1) - 4.0).abs() < 1e-9);
        assert!((model.serialization_overhead() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_calibration_applied_per_peer() {
        let model = LogPModel::new(LogPConfig::default());
        let cal = CalibrationResult {
            l: 300.0,
            o_s: 10.0,
            o_r: 15.0,
            g: 2.0,
            samples: 1000,
            valid: true,
        };
        assert!(model.apply_calibration(3, &cal));
        assert!((model.message_latency(0, 3) - 325.0).abs() < 1e-9);
        assert!((model.gap(3) - 2.0).abs() < 1e-9);
        // Other peers keep defaults
        assert!((model.message_latency(0, 4) - 190.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_calibration_ignored() {
        let model = LogPModel::new(LogPConfig::default());
        let mut cal = CalibrationResult {
            l: 300.0,
            o_s: 10.0,
            o_r: 15.0,
            g: 2.0,
            samples: 0,
            valid: true,
        };
        assert!(!model.apply_calibration(3, &cal));
        cal.samples = 10;
        cal.valid = false;
        assert!(!model.apply_calibration(3, &cal));
        cal.valid = true;
        cal.l = -1.0;
        assert!(!model.apply_calibration(3, &cal));
        assert!((model.message_latency(0, 3) - 190.0).abs() < 1e-9);
    }

    #[test]
    fn test_link_serialization_and_queueing() {
        let link = FabricLink::new(FabricLinkConfig {
            hop_latency_ns: 100.0,
            bandwidth_gbps: 1.0, // 1 byte/ns
            credits: 32,
        });

        // First message: 64 bytes at 1 byte/ns + 100ns hop
        let first = link.traversal_latency(0, 64);
        assert!((first - 164.0).abs() < 1e-9);

        // Immediately-following message queues behind the first departure.
        let second = link.traversal_latency(0, 64);
        assert!((second - 228.0).abs() < 1e-9);

        // After the link drains, no queueing delay remains.
        let later = link.traversal_latency(10_000, 64);
        assert!((later - 164.0).abs() < 1e-9);
    }
}
