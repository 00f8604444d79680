use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::Token;

use crate::header::HEADER_SIZE;

/// One of the N striped sockets belonging to a [`crate::session::Session`].
///
/// The back-reference to the owning session is a non-owning slot index
/// (`SessionId`), never a second owning pointer: a Remote never outlives its
/// Session, but expressing that with a real reference would make this a
/// self-referential structure.
pub struct Remote {
    pub stream: TcpStream,
    pub token: Token,
    pub addr: SocketAddr,

    /// Becomes true once the nonblocking connect completes successfully.
    /// Always true for sockets the relay accepted (inbound).
    pub connected: bool,

    pub read_armed: bool,
    pub write_armed: bool,
    /// Whether this socket currently holds a live mio registration; see
    /// `LocalEndpoint::registered`.
    pub registered: bool,

    /// Inbound header state: bytes received so far (0..=8), counting up.
    pub partial_header: [u8; HEADER_SIZE],
    pub partial_header_bytes: usize,

    /// Serial extracted from `partial_header` once it is complete.
    pub receive_serial: u32,
    /// Body bytes still to splice from this socket for the current chunk.
    pub remaining_recv_bytes: u32,

    pub stats_in: u64,
    pub stats_out: u64,
}

impl Remote {
    pub fn new(stream: TcpStream, token: Token, addr: SocketAddr, connected: bool) -> Self {
        Self {
            stream,
            token,
            addr,
            connected,
            read_armed: true,
            write_armed: false,
            registered: true,
            partial_header: [0u8; HEADER_SIZE],
            partial_header_bytes: 0,
            receive_serial: 0,
            remaining_recv_bytes: 0,
            stats_in: 0,
            stats_out: 0,
        }
    }

    pub fn header_complete(&self) -> bool {
        self.partial_header_bytes == HEADER_SIZE
    }

    pub fn reset_header(&mut self) {
        self.partial_header_bytes = 0;
    }
}
