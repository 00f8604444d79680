//! Failure/teardown scenarios (§8: S5, S6), driven directly against a
//! relay's ingress handshake and wire protocol so a malformed "remote" can
//! be injected without going through a well-behaved proxy.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use rotcp_core::{ReactorConfig, Reactor, Role};

use std::net::SocketAddr;

struct RelayUnderTest {
    _echo: common::EchoServer,
    wire_addr: SocketAddr,
    _handle: RelayHandleKeepAlive,
}

struct RelayHandleKeepAlive(std::sync::Arc<std::sync::atomic::AtomicBool>, Option<std::thread::JoinHandle<()>>);

impl Drop for RelayHandleKeepAlive {
    fn drop(&mut self) {
        self.0.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(j) = self.1.take() {
            let _ = j.join();
        }
    }
}

fn spawn_relay_under_test() -> RelayUnderTest {
    let echo = common::EchoServer::spawn();
    let wire_addr = common::free_addr();
    let shutdown = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let dump = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let shutdown_for_thread = std::sync::Arc::clone(&shutdown);
    let config = ReactorConfig {
        role: Role::Relay,
        local_addr: wire_addr,
        remote_addr: echo.addr(),
        backlog: ReactorConfig::DEFAULT_BACKLOG,
        connections: 0,
    };
    let join = std::thread::spawn(move || {
        let mut reactor = Reactor::new(config).expect("reactor construction");
        reactor.run(&shutdown_for_thread, &dump).expect("reactor run");
    });
    std::thread::sleep(Duration::from_millis(50));
    RelayUnderTest { _echo: echo, wire_addr, _handle: RelayHandleKeepAlive(shutdown, Some(join)) }
}

fn complete_ingress_handshake(wire_addr: SocketAddr) -> TcpStream {
    let mut stream = common::connect_client(wire_addr);
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(&0u32.to_be_bytes()).unwrap();
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).unwrap();
    assert_ne!(u32::from_be_bytes(reply), 0, "relay must allocate a non-zero group id");
    stream
}

/// A well-behaved session, used after an injected failure to prove the
/// relay process survived and is still routing correctly.
fn assert_relay_still_healthy(wire_addr: SocketAddr) {
    let mut stream = complete_ingress_handshake(wire_addr);
    let payload = b"still alive";
    let mut header = [0u8; 8];
    header[0..4].copy_from_slice(&1u32.to_be_bytes());
    header[4..8].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    stream.write_all(&header).unwrap();
    stream.write_all(payload).unwrap();

    let mut got = vec![0u8; payload.len()];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(got, payload);
}

/// S5: an injected oversize declared length is a protocol violation; the
/// relay tears the offending session down within one callback (observed
/// here as the socket closing) without taking the process down.
#[test]
fn oversize_length_header_tears_down_only_that_session() {
    let relay = spawn_relay_under_test();
    let mut bad = complete_ingress_handshake(relay.wire_addr);

    let mut header = [0u8; 8];
    header[0..4].copy_from_slice(&1u32.to_be_bytes());
    header[4..8].copy_from_slice(&(32 * 1024 * 1024u32).to_be_bytes()); // > 16 MiB sanity bound
    bad.write_all(&header).unwrap();

    let mut buf = [0u8; 16];
    let n = bad.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "relay should close the connection on a protocol violation");

    assert_relay_still_healthy(relay.wire_addr);
}

/// S6: the peer closing mid-chunk tears the whole session down; no partial
/// data dribbles through afterward, and unrelated sessions are unaffected.
#[test]
fn peer_close_mid_chunk_tears_down_cleanly() {
    let relay = spawn_relay_under_test();
    let mut doomed = complete_ingress_handshake(relay.wire_addr);

    let mut header = [0u8; 8];
    header[0..4].copy_from_slice(&1u32.to_be_bytes());
    header[4..8].copy_from_slice(&1000u32.to_be_bytes());
    doomed.write_all(&header).unwrap();
    doomed.write_all(&[0xAB; 500]).unwrap();
    drop(doomed); // close mid-chunk, 500 bytes still owed

    std::thread::sleep(Duration::from_millis(100));
    assert_relay_still_healthy(relay.wire_addr);
}
