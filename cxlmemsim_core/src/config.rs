//! Cluster topology configuration.
//!
//! A TOML file describes the fabric name, decoder mode, the per-node memory
//! layout, the optional interleave set, and the latency model parameters.
//! Validation happens at load: overlapping ranges, out-of-range node ids and
//! unsupported granularities refuse to start rather than misroute at decode
//! time.
//!
//! ```toml
//! [cluster]
//! shm_name = "/cxlmemsim_dist"
//! decoder_mode = "range"
//!
//! [[node]]
//! id = 0
//! capacity_mb = 64
//! memory_base = 0x100000000
//!
//! [[node]]
//! id = 1
//! capacity_mb = 64
//! memory_base = 0x200000000
//!
//! [logp]
//! l = 150.0
//! o_s = 20.0
//! o_r = 20.0
//! g = 4.0
//! ```

use crate::decoder::{HdmDecoder, HdmDecoderMode, InterleaveGranularity};
use crate::error::{CxlError, CxlResult};
use crate::fabric::MAX_NODES;
use crate::latency::{FabricLinkConfig, LogPConfig};
use crate::server::NodeServerConfig;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSection {
    #[serde(default = "default_shm_name")]
    pub shm_name: String,
    #[serde(default = "default_decoder_mode")]
    pub decoder_mode: String,
}

fn default_shm_name() -> String {
    crate::fabric::DEFAULT_FABRIC_SHM.to_string()
}

fn default_decoder_mode() -> String {
    "range".to_string()
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            shm_name: default_shm_name(),
            decoder_mode: default_decoder_mode(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    pub id: u32,
    #[serde(default = "default_capacity_mb")]
    pub capacity_mb: usize,
    #[serde(default)]
    pub memory_base: u64,
    #[serde(default)]
    pub hostname: Option<String>,
}

fn default_capacity_mb() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterleaveSection {
    pub granularity: u64,
    pub targets: Vec<u32>,
    pub base: u64,
    pub total_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogPSection {
    pub l: f64,
    pub o_s: f64,
    pub o_r: f64,
    pub g: f64,
}

impl From<&LogPSection> for LogPConfig {
    fn from(section: &LogPSection) -> Self {
        LogPConfig::new(section.l, section.o_s, section.o_r, section.g)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkSection {
    pub hop_latency_ns: f64,
    pub bandwidth_gbps: f64,
    #[serde(default = "default_credits")]
    pub credits: u32,
}

fn default_credits() -> u32 {
    32
}

impl From<&LinkSection> for FabricLinkConfig {
    fn from(section: &LinkSection) -> Self {
        FabricLinkConfig {
            hop_latency_ns: section.hop_latency_ns,
            bandwidth_gbps: section.bandwidth_gbps,
            credits: section.credits,
        }
    }
}

/// Parsed and validated cluster description.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeSection>,
    #[serde(default)]
    pub interleave: Option<InterleaveSection>,
    #[serde(default)]
    pub logp: Option<LogPSection>,
    #[serde(default)]
    pub link: Option<LinkSection>,
}

impl ClusterConfig {
    pub fn from_str(raw: &str) -> CxlResult<Self> {
        let config: ClusterConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> CxlResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_str(&raw)
    }

    pub fn decoder_mode(&self) -> CxlResult<HdmDecoderMode> {
        match self.cluster.decoder_mode.as_str() {
            "range" | "range_based" => Ok(HdmDecoderMode::RangeBased),
            "interleaved" => Ok(HdmDecoderMode::Interleaved),
            "hybrid" => Ok(HdmDecoderMode::Hybrid),
            other => Err(CxlError::config(format!("unknown decoder mode '{}'", other))),
        }
    }

    pub fn logp_config(&self) -> LogPConfig {
        self.logp.as_ref().map(Into::into).unwrap_or_default()
    }

    pub fn link_config(&self) -> FabricLinkConfig {
        self.link.as_ref().map(Into::into).unwrap_or_default()
    }

    fn validate(&self) -> CxlResult<()> {
        for node in &self.nodes {
            if node.id as usize >= MAX_NODES {
                return Err(CxlError::config(format!(
                    "node id {} out of range (max {})",
                    node.id,
                    MAX_NODES - 1
                )));
            }
            if node.capacity_mb == 0 {
                return Err(CxlError::config(format!(
                    "node {} has zero capacity",
                    node.id
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id) {
                return Err(CxlError::config(format!("duplicate node id {}", node.id)));
            }
        }

        // Non-zero bases must not overlap.
        let mut ranges: Vec<(u64, u64, u32)> = self
            .nodes
            .iter()
            .filter(|n| n.memory_base != 0)
            .map(|n| (n.memory_base, n.capacity_mb as u64 * 1024 * 1024, n.id))
            .collect();
        ranges.sort_by_key(|&(base, _, _)| base);
        for pair in ranges.windows(2) {
            let (base_a, size_a, id_a) = pair[0];
            let (base_b, _, id_b) = pair[1];
            if base_a + size_a > base_b {
                return Err(CxlError::config(format!(
                    "memory ranges of nodes {} and {} overlap",
                    id_a, id_b
                )));
            }
        }

        if let Some(interleave) = &self.interleave {
            if InterleaveGranularity::from_bytes(interleave.granularity).is_none() {
                return Err(CxlError::config(format!(
                    "unsupported interleave granularity {}",
                    interleave.granularity
                )));
            }
            if interleave.targets.is_empty() {
                return Err(CxlError::config("interleave target set is empty"));
            }
        }

        if let Some(logp) = &self.logp {
            let cfg: LogPConfig = logp.into();
            if !cfg.is_valid() {
                return Err(CxlError::config("LogP parameters must be non-negative"));
            }
        }

        self.decoder_mode()?;
        Ok(())
    }

    /// Build a decoder covering every configured node range plus the
    /// interleave set, as seen from `local_node`.
    pub fn build_decoder(&self, local_node: u32) -> CxlResult<HdmDecoder> {
        let decoder = HdmDecoder::new(self.decoder_mode()?);
        for node in &self.nodes {
            if node.memory_base == 0 {
                continue;
            }
            decoder.add_range(
                node.memory_base,
                node.capacity_mb as u64 * 1024 * 1024,
                node.id,
                node.id != local_node,
            )?;
        }
        if let Some(interleave) = &self.interleave {
            let granularity = InterleaveGranularity::from_bytes(interleave.granularity)
                .expect("granularity validated at load");
            decoder.configure_interleave(
                granularity,
                &interleave.targets,
                interleave.base,
                interleave.total_size,
            )?;
        }
        Ok(decoder)
    }

    /// Server configuration for one configured node.
    pub fn node_server_config(&self, node_id: u32) -> CxlResult<NodeServerConfig> {
        let node = self
            .nodes
            .iter()
            .find(|n| n.id == node_id)
            .ok_or_else(|| CxlError::config(format!("node {} not in cluster config", node_id)))?;

        let mut config = NodeServerConfig::new(node_id, &self.cluster.shm_name);
        config.capacity_mb = node.capacity_mb;
        config.memory_base = Some(node.memory_base);
        config.decoder_mode = self.decoder_mode()?;
        config.logp = self.logp_config();
        if let Some(hostname) = &node.hostname {
            config.hostname = hostname.clone();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [cluster]
        shm_name = "/cxltest_cfg"
        decoder_mode = "range"

        [[node]]
        id = 0
        capacity_mb = 64
        memory_base = 0x100000000

        [[node]]
        id = 1
        capacity_mb = 64
        memory_base = 0x200000000
        hostname = "expander1"

        [logp]
        l = 150.0
        o_s = 20.0
        o_r = 20.0
        g = 4.0

        [link]
        hop_latency_ns = 100.0
        bandwidth_gbps = 25.0
    "#;

    #[test]
    fn test_parse_and_build() {
        let config = ClusterConfig::from_str(SAMPLE).unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.cluster.shm_name, "/cxltest_cfg");
        assert_eq!(config.logp_config().l, 150.0);
        assert_eq!(config.link_config().credits, 32);

        let decoder = config.build_decoder(0).unwrap();
        let local = decoder.decode(0x1_0000_0000);
        assert_eq!(local.target_id, 0);
        assert!(!local.is_remote);
        let remote = decoder.decode(0x2_0000_0000);
        assert_eq!(remote.target_id, 1);
        assert!(remote.is_remote);

        let server_config = config.node_server_config(1).unwrap();
        assert_eq!(server_config.hostname, "expander1");
        assert_eq!(server_config.memory_base, Some(0x2_0000_0000));
    }

    #[test]
    fn test_overlap_rejected() {
        let raw = r#"
            [[node]]
            id = 0
            capacity_mb = 64
            memory_base = 0x100000000

            [[node]]
            id = 1
            capacity_mb = 64
            memory_base = 0x101000000
        "#;
        assert!(ClusterConfig::from_str(raw).is_err());
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(ClusterConfig::from_str("[[node]]\nid = 16\n").is_err());
        assert!(ClusterConfig::from_str("[[node]]\nid = 0\ncapacity_mb = 0\n").is_err());
        assert!(ClusterConfig::from_str(
            "[interleave]\ngranularity = 128\ntargets = [0]\nbase = 0\ntotal_size = 4096\n"
        )
        .is_err());
        assert!(ClusterConfig::from_str("[cluster]\ndecoder_mode = \"banana\"\n").is_err());
        assert!(ClusterConfig::from_str("[logp]\nl = -1.0\no_s = 0.0\no_r = 0.0\ng = 0.0\n").is_err());
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let raw = r#"
            [[node]]
            id = 0
            [[node]]
            id = 0
        "#;
        assert!(ClusterConfig::from_str(raw).is_err());
    }

    #[test]
    fn test_interleaved_mode() {
        let raw = r#"
            [cluster]
            decoder_mode = "interleaved"

            [interleave]
            granularity = 256
            targets = [0, 1]
            base = 0x40000000
            total_size = 0x100000
        "#;
        let config = ClusterConfig::from_str(raw).unwrap();
        let decoder = config.build_decoder(0).unwrap();
        assert_eq!(decoder.decode(0x4000_0000).target_id, 0);
        assert_eq!(decoder.decode(0x4000_0100).target_id, 1);
    }
}
