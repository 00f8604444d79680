use std::net::SocketAddr;

/// Which side of the pair this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts one local client connection, opens N outbound connections
    /// to the relay, and stripes the client's stream across them.
    Proxy,
    /// Accepts the N inbound connections from a proxy, assembles them into
    /// a single outbound stream to a local service, and stripes the
    /// reverse stream back.
    Relay,
}

/// Engine-level configuration, constructed once by the CLI crate and
/// passed by reference into the reactor. Carries only what the forwarding
/// engine itself needs; log verbosity and other CLI-only concerns stay in
/// the binary crate's own `Config`.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    pub role: Role,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub backlog: i32,
    pub connections: usize,
}

impl ReactorConfig {
    pub const DEFAULT_BACKLOG: i32 = 20;
    pub const DEFAULT_CONNECTIONS: usize = 4;
}
