//! Invariant 4: every file descriptor allocated during a session's
//! lifetime is released exactly once when the session is destroyed.

mod common;

use std::io::{Read, Write};
use std::time::Duration;

fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd").map(|entries| entries.count()).unwrap_or(0)
}

#[test]
fn no_fd_leak_across_repeated_session_cycles() {
    let (_echo, _relay, _proxy, client_addr) = common::spawn_echo_pair(2);

    // Warm up: the first connection pays for lazily-initialized state
    // (thread pools, allocator arenas) that later cycles don't.
    {
        let mut client = common::connect_client(client_addr);
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"warmup").unwrap();
        let mut got = [0u8; 6];
        client.read_exact(&mut got).unwrap();
    }
    std::thread::sleep(Duration::from_millis(100));
    let baseline = open_fd_count();

    for _ in 0..50 {
        let mut client = common::connect_client(client_addr);
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"ping").unwrap();
        let mut got = [0u8; 4];
        client.read_exact(&mut got).unwrap();
        drop(client);
    }

    // Let the relay and proxy both observe the closes and tear the
    // sessions down.
    std::thread::sleep(Duration::from_millis(300));
    let after = open_fd_count();
    assert!(
        after <= baseline + 2,
        "fd count grew from {baseline} to {after} across 50 create/destroy cycles"
    );
}
