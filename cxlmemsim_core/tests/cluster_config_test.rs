//! Building a cluster from a TOML description end to end.

use anyhow::Result;
use cxlmemsim_core::config::ClusterConfig;
use cxlmemsim_core::server::NodeServer;
use std::time::Duration;

#[test]
fn test_cluster_from_toml() -> Result<()> {
    let shm = format!("/cxl_toml_{}", std::process::id());
    let raw = format!(
        r#"
        [cluster]
        shm_name = "{shm}"
        decoder_mode = "range"

        [[node]]
        id = 0
        capacity_mb = 16
        memory_base = 0x100000000

        [[node]]
        id = 1
        capacity_mb = 16
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
        "#
    );
    let config = ClusterConfig::from_str(&raw)?;

    let server0 = NodeServer::new(config.node_server_config(0)?)?;
    server0.start()?;
    let server1 = NodeServer::new(config.node_server_config(1)?)?;
    server1.start()?;
    std::thread::sleep(Duration::from_millis(200));

    // Each server learns the full topology from the shared config.
    for node in &config.nodes {
        let size = node.capacity_mb as u64 * 1024 * 1024;
        if node.id != 0 {
            server0.decoder().add_range(node.memory_base, size, node.id, true)?;
        }
        if node.id != 1 {
            server1.decoder().add_range(node.memory_base, size, node.id, true)?;
        }
        if node.id != 0 {
            server0.register_fabric_link(node.id, config.link_config());
        }
    }

    // Node 1's hostname came from the config.
    assert_eq!(config.node_server_config(1)?.hostname, "expander1");

    // Cross-node traffic works over the configured topology.
    let mut out = [0u8; 64];
    server0.write(0x2_0000_0000, &[0x5A; 64])?;
    server1.read(0x2_0000_0000, &mut out)?;
    assert_eq!(out, [0x5A; 64]);

    server1.stop();
    server0.stop();
    Ok(())
}
