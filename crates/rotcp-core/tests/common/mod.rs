//! Shared harness for the end-to-end tests: spins up a real proxy/relay
//! reactor pair plus a trivial echo service standing in for "the
//! protected service" on the relay's far side, then drives all the I/O
//! over actual loopback sockets and OS pipes.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rotcp_core::{ReactorConfig, Reactor, Role};

pub fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local_addr")
}

pub struct ReactorHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ReactorHandle {
    fn spawn(config: ReactorConfig) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let dump = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = Arc::clone(&shutdown);
        let join = std::thread::spawn(move || {
            let mut reactor = Reactor::new(config).expect("reactor construction");
            reactor.run(&shutdown_for_thread, &dump).expect("reactor run");
        });
        ReactorHandle { shutdown, join: Some(join) }
    }
}

impl Drop for ReactorHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// A background TCP echo server: every byte read from a connection is
/// written back to it, in order. Stands in for "the protected service"
/// behind the relay.
pub struct EchoServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl EchoServer {
    pub fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind echo listener");
        let addr = listener.local_addr().expect("local_addr");
        listener.set_nonblocking(true).expect("nonblocking");
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = Arc::clone(&shutdown);
        let join = std::thread::spawn(move || {
            while !shutdown_for_thread.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        stream.set_read_timeout(Some(Duration::from_millis(200))).ok();
                        let mut buf = [0u8; 64 * 1024];
                        loop {
                            match stream.read(&mut buf) {
                                Ok(0) => break,
                                Ok(n) => {
                                    if stream.write_all(&buf[..n]).is_err() {
                                        break;
                                    }
                                }
                                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                                Err(_) => break,
                            }
                        }
                    }
                    Err(_) => std::thread::sleep(Duration::from_millis(10)),
                }
            }
        });
        EchoServer { addr, shutdown, join: Some(join) }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Stands up one proxy and one relay reactor wired together, with the
/// relay's upstream pointed at a fresh echo server. Returns the echo
/// server and reactor handles (dropping them tears everything down) plus
/// the address a test client should connect to.
pub fn spawn_echo_pair(connections: usize) -> (EchoServer, ReactorHandle, ReactorHandle, SocketAddr) {
    let echo = EchoServer::spawn();
    let wire_addr = free_addr();
    let client_addr = free_addr();

    let relay = ReactorHandle::spawn(ReactorConfig {
        role: Role::Relay,
        local_addr: wire_addr,
        remote_addr: echo.addr(),
        backlog: ReactorConfig::DEFAULT_BACKLOG,
        connections: 0,
    });
    // Give the relay's listener a moment to bind before the proxy dials it.
    std::thread::sleep(Duration::from_millis(50));
    let proxy = ReactorHandle::spawn(ReactorConfig {
        role: Role::Proxy,
        local_addr: client_addr,
        remote_addr: wire_addr,
        backlog: ReactorConfig::DEFAULT_BACKLOG,
        connections,
    });
    std::thread::sleep(Duration::from_millis(50));

    (echo, relay, proxy, client_addr)
}

pub fn connect_client(addr: SocketAddr) -> TcpStream {
    for _ in 0..20 {
        if let Ok(stream) = TcpStream::connect(addr) {
            return stream;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    TcpStream::connect(addr).expect("client connect")
}

pub fn seeded_payload(len: usize, seed: u64) -> Vec<u8> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random()).collect()
}
