//! Two distributed memory servers on one host, communicating through the
//! shared-memory message fabric. Verifies cluster formation, local and
//! cross-node reads/writes, coherency traffic and latency reporting.

use cxlmemsim_core::fabric::NodeState;
use cxlmemsim_core::server::{NodeServer, NodeServerConfig, PeerInfo};
use std::sync::Arc;
use std::time::Duration;

const NODE0_BASE: u64 = 0x1_0000_0000;
const NODE1_BASE: u64 = 0x2_0000_0000;
const CAPACITY_MB: usize = 64;

fn server(shm: &str, node_id: u32, base: u64) -> Arc<NodeServer> {
    let mut config = NodeServerConfig::new(node_id, shm);
    config.capacity_mb = CAPACITY_MB;
    config.memory_base = Some(base);
    config.request_timeout_ms = 5000;
    let server = NodeServer::new(config).unwrap();
    server.start().unwrap();
    server
}

#[test]
fn test_two_node_cluster() {
    let shm = format!("/cxl_s1_{}", std::process::id());

    let server0 = server(&shm, 0, NODE0_BASE);
    let server1 = server(&shm, 1, NODE1_BASE);

    assert_eq!(server0.node_id(), 0);
    assert_eq!(server1.node_id(), 1);
    assert_eq!(server0.node_state(), NodeState::Ready);
    assert_eq!(server1.node_state(), NodeState::Ready);
    assert!(server0.fabric().is_coordinator());
    assert!(!server1.fabric().is_coordinator());

    // Give the message workers a moment to drain the join traffic.
    std::thread::sleep(Duration::from_millis(200));

    // Teach each node about the other's range.
    let size = CAPACITY_MB as u64 * 1024 * 1024;
    server0.decoder().add_range(NODE1_BASE, size, 1, true).unwrap();
    server1.decoder().add_range(NODE0_BASE, size, 0, true).unwrap();

    // Local write + read-back on node 0.
    let mut out = [0u8; 64];
    let latency = server0.write(NODE0_BASE, &[0xAA; 64]).unwrap();
    assert!(latency > 0);
    let latency = server0.read(NODE0_BASE, &mut out).unwrap();
    assert!(latency > 0);
    assert_eq!(out, [0xAA; 64]);

    // Local write + read-back on node 1.
    server1.write(NODE1_BASE, &[0xBB; 64]).unwrap();
    server1.read(NODE1_BASE, &mut out).unwrap();
    assert_eq!(out, [0xBB; 64]);

    // Node 0 writes into node 1's range; verified locally on node 1.
    let latency = server0.write(NODE1_BASE + 64, &[0xCC; 64]).unwrap();
    assert!(latency > 0);
    server1.read(NODE1_BASE + 64, &mut out).unwrap();
    assert_eq!(out, [0xCC; 64]);

    // Node 1 writes into node 0's range; verified locally on node 0.
    server1.write(NODE0_BASE + 128, &[0xDD; 64]).unwrap();
    server0.read(NODE0_BASE + 128, &mut out).unwrap();
    assert_eq!(out, [0xDD; 64]);

    // Node 0 reads what node 1 wrote locally earlier.
    let latency = server0.read(NODE1_BASE, &mut out).unwrap();
    assert_eq!(out, [0xBB; 64]);
    // Remote latency includes the home-side cost plus LogP transit.
    assert!(latency >= 190);

    let stats0 = server0.get_stats();
    let stats1 = server1.get_stats();
    assert!(stats0.local_reads >= 1);
    assert!(stats0.local_writes >= 1);
    assert!(stats1.local_reads >= 1);
    assert!(stats1.local_writes >= 1);
    assert!(stats0.forwarded_requests > 0);
    assert!(stats0.remote_reads >= 1);
    assert!(stats0.remote_writes >= 1);

    // The fabric moved real messages.
    let fabric_stats = server0.fabric().get_stats();
    assert!(fabric_stats.messages_sent > 0);
    assert!(fabric_stats.messages_received > 0);

    server1.stop();
    server0.stop();
}

#[test]
fn test_cross_node_data_integrity_patterns() {
    let shm = format!("/cxl_integrity_{}", std::process::id());

    let server0 = server(&shm, 0, NODE0_BASE);
    let server1 = server(&shm, 1, NODE1_BASE);
    std::thread::sleep(Duration::from_millis(200));

    let size = CAPACITY_MB as u64 * 1024 * 1024;
    server0.decoder().add_range(NODE1_BASE, size, 1, true).unwrap();
    server1.decoder().add_range(NODE0_BASE, size, 0, true).unwrap();

    // A writes varied patterns into B's range and B observes them, and
    // symmetrically in the other direction.
    for i in 0..16u64 {
        let addr = NODE1_BASE + 0x1000 + i * 64;
        let pattern: Vec<u8> = (0..64u32).map(|b| (b as u64 * 7 + i) as u8).collect();
        server0.write(addr, &pattern).unwrap();

        let mut out = [0u8; 64];
        server1.read(addr, &mut out).unwrap();
        assert_eq!(&out[..], &pattern[..], "pattern {} mismatch B-side", i);
    }
    for i in 0..16u64 {
        let addr = NODE0_BASE + 0x2000 + i * 64;
        let pattern: Vec<u8> = (0..64u32).map(|b| (b as u64 * 13 + i) as u8).collect();
        server1.write(addr, &pattern).unwrap();

        let mut out = [0u8; 64];
        server0.read(addr, &mut out).unwrap();
        assert_eq!(&out[..], &pattern[..], "pattern {} mismatch A-side", i);
    }

    server1.stop();
    server0.stop();
}

#[test]
fn test_unmapped_and_offline_peers_fail_fast() {
    let shm = format!("/cxl_failfast_{}", std::process::id());

    let server0 = server(&shm, 0, NODE0_BASE);
    std::thread::sleep(Duration::from_millis(100));

    // Unmapped address.
    let mut out = [0u8; 64];
    let err = server0.read(0x9_0000_0000, &mut out).unwrap_err();
    assert!(err.is_address());

    // Known-offline peer fails fast without waiting for a timeout.
    server0
        .decoder()
        .add_range(0x3_0000_0000, 0x100_0000, 3, true)
        .unwrap();
    server0.add_remote_node(PeerInfo {
        node_id: 3,
        hostname: "node3".into(),
        state: NodeState::Offline,
        memory_base: 0x3_0000_0000,
        memory_size: 0x100_0000,
        last_heartbeat: 0,
    });
    let start = std::time::Instant::now();
    let err = server0.read(0x3_0000_0000, &mut out).unwrap_err();
    assert!(err.is_peer_offline());
    assert!(start.elapsed() < Duration::from_millis(100));

    server0.stop();
}

#[test]
fn test_heartbeats_populate_peer_table() {
    let shm = format!("/cxl_heartbeat_{}", std::process::id());

    let server0 = server(&shm, 0, NODE0_BASE);
    let server1 = server(&shm, 1, NODE1_BASE);

    // Heartbeats are broadcast once per second; each side should learn the
    // other within a couple of periods.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let peers0 = server0.get_cluster_nodes();
        let peers1 = server1.get_cluster_nodes();
        let zero_knows_one = peers0.iter().any(|p| p.node_id == 1 && p.last_heartbeat > 0);
        let one_knows_zero = peers1.iter().any(|p| p.node_id == 0 && p.last_heartbeat > 0);
        if zero_knows_one && one_knows_zero {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "peers never learned each other via heartbeats"
        );
        std::thread::sleep(Duration::from_millis(100));
    }

    // Heartbeat stamps also land in the shared header.
    assert!(server0.fabric().node_last_heartbeat(0) > 0);
    assert!(server0.fabric().node_last_heartbeat(1) > 0);

    server1.stop();
    server0.stop();
}

#[test]
fn test_dir_query_roundtrip() {
    let shm = format!("/cxl_dirq_{}", std::process::id());

    let server0 = server(&shm, 0, NODE0_BASE);
    let server1 = server(&shm, 1, NODE1_BASE);
    std::thread::sleep(Duration::from_millis(200));

    let size = CAPACITY_MB as u64 * 1024 * 1024;
    server1.decoder().add_range(NODE0_BASE, size, 0, true).unwrap();

    // Prime a directory entry at node 0's home.
    server0.write(NODE0_BASE + 0x40, &[1u8; 64]).unwrap();

    use cxlmemsim_core::coherency::MhsldCacheState;
    use cxlmemsim_core::fabric::{CoherencyPayload, Envelope, MsgType};

    let mut env = Envelope::new(
        MsgType::DirQuery,
        server1.fabric().generate_msg_id(),
        1,
        0,
    );
    let mut query = CoherencyPayload::default();
    query.cacheline_addr = NODE0_BASE + 0x40;
    query.requesting_node = 1;
    env.set_coherency_payload(&query);

    let resp = server1.fabric().send_and_wait(0, &env, 2000).unwrap();
    assert_eq!(resp.header.msg_type, MsgType::DirResponse as u32);
    let dir = resp.coherency_payload();
    assert_eq!(dir.cacheline_addr, NODE0_BASE + 0x40);
    assert_eq!(dir.owner_node, 0);
    assert_eq!(
        MhsldCacheState::from_u8(dir.current_state),
        MhsldCacheState::Modified
    );
    assert!(dir.version >= 1);

    server1.stop();
    server0.stop();
}

#[test]
fn test_controller_routes_and_aggregates() {
    use cxlmemsim_core::server::CxlController;

    let shm = format!("/cxl_ctrl_{}", std::process::id());
    let server0 = server(&shm, 0, NODE0_BASE);
    let server1 = server(&shm, 1, NODE1_BASE);
    std::thread::sleep(Duration::from_millis(200));

    let size = CAPACITY_MB as u64 * 1024 * 1024;
    server0.decoder().add_range(NODE1_BASE, size, 1, true).unwrap();
    server1.decoder().add_range(NODE0_BASE, size, 0, true).unwrap();

    let controller = CxlController::new(0);
    controller.register_server(Arc::clone(&server0));
    controller.register_server(Arc::clone(&server1));

    // Ops on either node's range route to the owning server in-process.
    let mut out = [0u8; 64];
    controller.write(NODE0_BASE + 0x300, &[0x11; 64]).unwrap();
    controller.write(NODE1_BASE + 0x300, &[0x22; 64]).unwrap();
    controller.read(NODE0_BASE + 0x300, &mut out).unwrap();
    assert_eq!(out, [0x11; 64]);
    controller.read(NODE1_BASE + 0x300, &mut out).unwrap();
    assert_eq!(out, [0x22; 64]);

    let (old, _) = controller.atomic_faa(NODE0_BASE + 0x400, 5).unwrap();
    assert_eq!(old, 0);
    let (old, _) = controller.atomic_faa(NODE0_BASE + 0x400, 3).unwrap();
    assert_eq!(old, 5);
    let (observed, _) = controller.atomic_cas(NODE0_BASE + 0x400, 8, 100).unwrap();
    assert_eq!(observed, 8);

    controller.fence().unwrap();

    let stats = controller.aggregate_stats();
    assert!(stats.local_reads >= 2);
    assert!(stats.local_writes >= 2);
    assert!(server0.fabric().system_ready());

    server1.stop();
    server0.stop();
}
