//! Concurrent atomics: two remote clients hammer one home-node counter with
//! fetch-add, and CAS settles cross-node races deterministically.

use cxlmemsim_core::server::{NodeServer, NodeServerConfig};
use std::sync::Arc;
use std::time::Duration;

const NODE0_BASE: u64 = 0x1_0000_0000;
const NODE1_BASE: u64 = 0x2_0000_0000;
const NODE2_BASE: u64 = 0x3_0000_0000;
const CAPACITY_MB: usize = 16;

fn server(shm: &str, node_id: u32, base: u64) -> Arc<NodeServer> {
    let mut config = NodeServerConfig::new(node_id, shm);
    config.capacity_mb = CAPACITY_MB;
    config.memory_base = Some(base);
    config.request_timeout_ms = 10_000;
    let server = NodeServer::new(config).unwrap();
    server.start().unwrap();
    server
}

#[test]
fn test_concurrent_remote_fetch_add() {
    let shm = format!("/cxl_faa_{}", std::process::id());
    let server0 = server(&shm, 0, NODE0_BASE);
    let server1 = server(&shm, 1, NODE1_BASE);
    let server2 = server(&shm, 2, NODE2_BASE);
    std::thread::sleep(Duration::from_millis(200));

    let size = CAPACITY_MB as u64 * 1024 * 1024;
    server1.decoder().add_range(NODE0_BASE, size, 0, true).unwrap();
    server2.decoder().add_range(NODE0_BASE, size, 0, true).unwrap();

    let counter_addr = NODE0_BASE + 0x100;
    server0.write(counter_addr, &0u64.to_le_bytes()).unwrap();

    const OPS_PER_CLIENT: u64 = 20_000;
    let clients: Vec<_> = [Arc::clone(&server1), Arc::clone(&server2)]
        .into_iter()
        .map(|client| {
            std::thread::spawn(move || {
                for _ in 0..OPS_PER_CLIENT {
                    let (_, latency) = client.atomic_faa(counter_addr, 1).unwrap();
                    assert!(latency > 0);
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    // Final value observed directly in the home node's data area.
    let mut buf = [0u8; 8];
    server0.memory().read_cacheline(counter_addr, &mut buf).unwrap();
    assert_eq!(u64::from_le_bytes(buf), 2 * OPS_PER_CLIENT);

    // Every forwarded atomic was a remote op at the home engine.
    let stats = server0.coherency_stats();
    assert_eq!(stats.remote_ops, 2 * OPS_PER_CLIENT);
    assert!(stats.coherency_messages > 0);

    server2.stop();
    server1.stop();
    server0.stop();
}

#[test]
fn test_remote_cas_single_winner() {
    let shm = format!("/cxl_cas_{}", std::process::id());
    let server0 = server(&shm, 0, NODE0_BASE);
    let server1 = server(&shm, 1, NODE1_BASE);
    std::thread::sleep(Duration::from_millis(200));

    let size = CAPACITY_MB as u64 * 1024 * 1024;
    server1.decoder().add_range(NODE0_BASE, size, 0, true).unwrap();

    let lock_addr = NODE0_BASE + 0x200;
    server0.write(lock_addr, &0u64.to_le_bytes()).unwrap();

    // Both nodes race to claim the word; exactly one CAS observes 0.
    let remote = {
        let server1 = Arc::clone(&server1);
        std::thread::spawn(move || server1.atomic_cas(lock_addr, 0, 111).unwrap().0)
    };
    let local_old = server0.atomic_cas(lock_addr, 0, 222).unwrap().0;
    let remote_old = remote.join().unwrap();

    let winners = [local_old, remote_old]
        .iter()
        .filter(|&&old| old == 0)
        .count();
    assert_eq!(winners, 1, "exactly one CAS must win the race");

    let mut buf = [0u8; 8];
    server0.memory().read_cacheline(lock_addr, &mut buf).unwrap();
    let settled = u64::from_le_bytes(buf);
    assert!(settled == 111 || settled == 222);

    // A CAS with a stale expectation fails and reports the current value.
    let (observed, _) = server1.atomic_cas(lock_addr, 999, 333).unwrap();
    assert_eq!(observed, settled);

    server1.stop();
    server0.stop();
}

#[test]
fn test_atomic_alignment_rejected() {
    let shm = format!("/cxl_align_{}", std::process::id());
    let server0 = server(&shm, 0, NODE0_BASE);
    std::thread::sleep(Duration::from_millis(100));

    assert!(server0.atomic_faa(NODE0_BASE + 0x104 + 3, 1).is_err());
    server0.stop();
}
