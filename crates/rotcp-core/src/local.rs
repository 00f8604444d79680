use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::Token;

/// The single socket carrying the unstriped stream: the client in proxy
/// mode, the upstream server in relay mode.
pub struct LocalEndpoint {
    pub stream: TcpStream,
    pub token: Token,
    pub addr: SocketAddr,
    pub connected: bool,
    pub read_armed: bool,
    pub write_armed: bool,
    /// Whether this socket currently holds a live mio registration. Cleared
    /// when neither interest is armed (the poll registration is dropped
    /// entirely rather than left pointing at a stale interest) and set again
    /// once an armed interest reinstates it.
    pub registered: bool,
    pub stats_in: u64,
    pub stats_out: u64,
}

impl LocalEndpoint {
    pub fn new(stream: TcpStream, token: Token, addr: SocketAddr, connected: bool) -> Self {
        Self {
            stream,
            token,
            addr,
            connected,
            read_armed: true,
            write_armed: false,
            registered: true,
            stats_in: 0,
            stats_out: 0,
        }
    }
}
