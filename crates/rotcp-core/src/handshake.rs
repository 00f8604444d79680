//! Relay-only ingress handshake: the 4-byte big-endian group-id preamble
//! that binds a freshly accepted socket to a new or existing session.

use std::collections::HashSet;
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::Token;

/// Small-integer allocator for group ids: a monotonic counter that skips
/// ids currently held by a live session. Not a literal free-list — 32-bit
/// wraparound is not a practical concern at realistic session counts — but
/// released ids are returned to the skip-set so they can be reused once
/// the counter wraps back around to them.
#[derive(Debug, Default)]
pub struct GroupIdAllocator {
    next: u32,
    in_use: HashSet<u32>,
}

impl GroupIdAllocator {
    pub fn new() -> Self {
        Self { next: 1, in_use: HashSet::new() }
    }

    /// Allocates the next id not currently held by a live session. Id 0 is
    /// reserved for "not yet assigned" and is never handed out.
    pub fn allocate(&mut self) -> u32 {
        loop {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);
            if self.next == 0 {
                self.next = 1;
            }
            if candidate != 0 && self.in_use.insert(candidate) {
                return candidate;
            }
        }
    }

    pub fn release(&mut self, id: u32) {
        self.in_use.remove(&id);
    }

    pub fn is_live(&self, id: u32) -> bool {
        self.in_use.contains(&id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    ReadingGroupId,
    /// The 4-byte request has been read; waiting on the reactor to decide
    /// (via [`PendingIngress::set_echo`]) whether to allocate, attach, or
    /// reject before the echo can be written.
    AwaitingResolution,
    WritingGroupId,
}

/// An accepted socket that has not yet been bound to a session: still
/// exchanging the 4-byte group-id preamble.
pub struct PendingIngress {
    pub stream: TcpStream,
    pub token: Token,
    pub addr: SocketAddr,
    state: HandshakeState,
    read_buf: [u8; 4],
    read_have: usize,
    write_buf: [u8; 4],
    write_have: usize,
    resolved_group_id: Option<u32>,
}

/// Result of driving a `PendingIngress` one step.
pub enum HandshakeOutcome {
    /// Still waiting on more I/O; re-armed and returned to the reactor.
    Pending,
    /// The echo was written; `group_id` is what the client asked for (0
    /// means "allocate a fresh session"), already resolved if it was 0.
    Done { group_id: u32 },
    Failed(&'static str),
}

impl PendingIngress {
    pub fn new(stream: TcpStream, token: Token, addr: SocketAddr) -> Self {
        Self {
            stream,
            token,
            addr,
            state: HandshakeState::ReadingGroupId,
            read_buf: [0u8; 4],
            read_have: 0,
            write_buf: [0u8; 4],
            write_have: 0,
            resolved_group_id: None,
        }
    }

    /// Drives the read half. Call on read readiness while in
    /// `ReadingGroupId`.
    pub fn drive_read(&mut self) -> HandshakeOutcome {
        use std::io::Read;
        if self.state != HandshakeState::ReadingGroupId {
            return HandshakeOutcome::Pending;
        }
        loop {
            match self.stream.read(&mut self.read_buf[self.read_have..]) {
                Ok(0) => return HandshakeOutcome::Failed("handshake: peer closed before sending group id"),
                Ok(n) => {
                    self.read_have += n;
                    if self.read_have == 4 {
                        let requested = u32::from_be_bytes(self.read_buf);
                        self.resolved_group_id = Some(requested);
                        self.state = HandshakeState::AwaitingResolution;
                        return HandshakeOutcome::Pending;
                    }
                }
                Err(e) if crate::error::is_transient(&e) => return HandshakeOutcome::Pending,
                Err(_) => return HandshakeOutcome::Failed("handshake: read error"),
            }
        }
    }

    /// Called by the caller once it has decided what id to echo back
    /// (either the requested id, echoed as-is, or a freshly allocated one,
    /// or 0 to reject an unknown id).
    pub fn set_echo(&mut self, group_id: u32) {
        self.resolved_group_id = Some(group_id);
        self.write_buf = group_id.to_be_bytes();
        self.write_have = 0;
        self.state = HandshakeState::WritingGroupId;
    }

    /// `Some(requested_id)` once the 4-byte request has been read and is
    /// waiting on the reactor to resolve it via [`Self::set_echo`].
    pub fn requested_group_id(&self) -> Option<u32> {
        if self.state == HandshakeState::AwaitingResolution {
            self.resolved_group_id
        } else {
            None
        }
    }

    /// Drives the write half. Call on write readiness while in
    /// `WritingGroupId`.
    pub fn drive_write(&mut self) -> HandshakeOutcome {
        use std::io::Write;
        if self.state != HandshakeState::WritingGroupId {
            return HandshakeOutcome::Pending;
        }
        loop {
            match self.stream.write(&self.write_buf[self.write_have..]) {
                Ok(0) => return HandshakeOutcome::Failed("handshake: write returned 0"),
                Ok(n) => {
                    self.write_have += n;
                    if self.write_have == 4 {
                        return HandshakeOutcome::Done { group_id: self.resolved_group_id.unwrap_or(0) };
                    }
                }
                Err(e) if crate::error::is_transient(&e) => return HandshakeOutcome::Pending,
                Err(_) => return HandshakeOutcome::Failed("handshake: write error"),
            }
        }
    }

    pub fn is_writing(&self) -> bool {
        self.state == HandshakeState::WritingGroupId
    }
}

/// Proxy-side (client) handshake: write the requested group id (0 to
/// request a new session, the already-allocated id for every connection
/// after the first), then read back the relay's reply. A reply of 0 means
/// the relay rejected the request (unknown group id); the proxy aborts
/// cleanly on it instead of treating 0 as a valid degenerate group.
pub struct PendingEgress {
    pub stream: TcpStream,
    pub token: Token,
    pub addr: SocketAddr,
    pub connected: bool,
    write_buf: [u8; 4],
    write_have: usize,
    read_buf: [u8; 4],
    read_have: usize,
    writing: bool,
}

impl PendingEgress {
    pub fn new(stream: TcpStream, token: Token, addr: SocketAddr, requested_group_id: u32, already_connected: bool) -> Self {
        Self {
            stream,
            token,
            addr,
            connected: already_connected,
            write_buf: requested_group_id.to_be_bytes(),
            write_have: 0,
            read_buf: [0u8; 4],
            read_have: 0,
            writing: true,
        }
    }

    /// Call on writable readiness. Handles connect-completion detection
    /// (`SO_ERROR`) the first time, then drives the handshake write.
    pub fn on_writable(&mut self) -> HandshakeOutcome {
        use std::io::Write;
        if !self.connected {
            match crate::endpoint::take_socket_error(&self.stream) {
                Ok(()) => self.connected = true,
                Err(_) => return HandshakeOutcome::Failed("connect failed"),
            }
        }
        if !self.writing {
            return HandshakeOutcome::Pending;
        }
        loop {
            match self.stream.write(&self.write_buf[self.write_have..]) {
                Ok(0) => return HandshakeOutcome::Failed("handshake: write returned 0"),
                Ok(n) => {
                    self.write_have += n;
                    if self.write_have == 4 {
                        self.writing = false;
                        return HandshakeOutcome::Pending;
                    }
                }
                Err(e) if crate::error::is_transient(&e) => return HandshakeOutcome::Pending,
                Err(_) => return HandshakeOutcome::Failed("handshake: write error"),
            }
        }
    }

    /// Call on readable readiness once `on_writable` has finished writing.
    pub fn on_readable(&mut self) -> HandshakeOutcome {
        use std::io::Read;
        if self.writing {
            return HandshakeOutcome::Pending;
        }
        loop {
            match self.stream.read(&mut self.read_buf[self.read_have..]) {
                Ok(0) => return HandshakeOutcome::Failed("handshake: peer closed before replying"),
                Ok(n) => {
                    self.read_have += n;
                    if self.read_have == 4 {
                        let reply = u32::from_be_bytes(self.read_buf);
                        if reply == 0 {
                            return HandshakeOutcome::Failed("handshake: rejected by peer");
                        }
                        return HandshakeOutcome::Done { group_id: reply };
                    }
                }
                Err(e) if crate::error::is_transient(&e) => return HandshakeOutcome::Pending,
                Err(_) => return HandshakeOutcome::Failed("handshake: read error"),
            }
        }
    }

    pub fn wants_write(&self) -> bool {
        !self.connected || self.writing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_skips_live_ids_and_never_returns_zero() {
        let mut a = GroupIdAllocator::new();
        let first = a.allocate();
        let second = a.allocate();
        assert_ne!(first, 0);
        assert_ne!(second, 0);
        assert_ne!(first, second);
        assert!(a.is_live(first));
        a.release(first);
        assert!(!a.is_live(first));
    }

    #[test]
    fn allocator_reuses_released_ids_after_wraparound() {
        let mut a = GroupIdAllocator { next: u32::MAX, in_use: HashSet::new() };
        let id = a.allocate();
        assert_eq!(id, u32::MAX);
        assert_eq!(a.next, 1);
    }
}
