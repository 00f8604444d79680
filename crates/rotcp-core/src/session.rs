//! The per-session striping scheduler and reassembly engine.
//!
//! A session's operations are strictly cooperative within a single reactor
//! thread: scheduler and reassembler share state directly because the
//! reactor serializes every callback that touches it. No lock is taken
//! anywhere in this module.

use std::os::fd::AsFd;

use flux_utils::safe_assert;
use tracing::{trace, warn};

use crate::error::{is_transient, SessionError};
use crate::header::{ChunkHeader, HEADER_SIZE, MAX_CHUNK_SLICE};
use crate::local::LocalEndpoint;
use crate::pipe::Conduit;
use crate::remote::Remote;

/// Typical Linux pipe capacity (`/proc/sys/fs/pipe-max-size` default is much
/// larger, but the unconfigured per-pipe size is 16 pages on a 4 KiB-page
/// host).
pub const PIPE_CAPACITY: usize = 65_536;
/// Disable read interest once a pipe holds this many bytes.
pub const HIGH_WATER: usize = PIPE_CAPACITY * 3 / 4;
/// Re-enable read interest once a pipe drains below this.
pub const LOW_WATER: usize = PIPE_CAPACITY / 4;

pub struct Session {
    pub group_id: u32,
    pub local: LocalEndpoint,
    pub remotes: Vec<Remote>,

    pub pipe_out: Conduit,
    pub pipe_in: Conduit,

    pub send_serial: u32,
    pub receive_serial: u32,

    pub current_send_remote: Option<usize>,
    pub remaining_send_bytes: u32,
    pub partial_header_bytes: usize,
    send_header_buf: [u8; HEADER_SIZE],

    /// Not in the formal data model; carried over from the original
    /// implementation's `current_receive_remote` so a drained pipe only
    /// has to wake the remote that is actually mid-chunk instead of every
    /// remote in the session.
    pub current_receive_remote: Option<usize>,

    /// Scoped to this session's group id and peer address so concurrent
    /// sessions' log lines stay attributable; entered by the reactor
    /// around every callback that touches this session.
    pub span: tracing::Span,
}

pub enum PumpOutcome {
    Idle,
    Progressed,
    Failed(SessionError),
}

impl Session {
    pub fn new(group_id: u32, local: LocalEndpoint) -> std::io::Result<Self> {
        let span = tracing::info_span!("session", group_id, peer = %local.addr);
        Ok(Self {
            group_id,
            local,
            remotes: Vec::new(),
            pipe_out: Conduit::new()?,
            pipe_in: Conduit::new()?,
            send_serial: 0,
            receive_serial: 0,
            current_send_remote: None,
            remaining_send_bytes: 0,
            partial_header_bytes: 0,
            send_header_buf: [0u8; HEADER_SIZE],
            current_receive_remote: None,
            span,
        })
    }

    /// Records the group id once it is known (relay: allocated at
    /// handshake time; proxy: resolved from the first remote's echo). The
    /// span was opened with a placeholder id at construction, before
    /// either side necessarily knows it.
    pub fn record_group_id(&mut self, group_id: u32) {
        self.group_id = group_id;
        self.span.record("group_id", group_id);
    }

    pub fn add_remote(&mut self, remote: Remote) -> usize {
        self.remotes.push(remote);
        self.remotes.len() - 1
    }

    // ---- local -> pipe_out -------------------------------------------

    /// Pulls bytes from the client/upstream socket into `pipe_out`. Called
    /// on read readiness for `local.stream`.
    pub fn pump_local_read(&mut self) -> PumpOutcome {
        if self.pipe_out.fill_level() >= HIGH_WATER {
            self.local.read_armed = false;
            return PumpOutcome::Idle;
        }
        let max = HIGH_WATER.saturating_sub(self.pipe_out.fill_level()).min(MAX_CHUNK_SLICE);
        let outcome = self.pipe_out.fill_from(self.local.stream.as_fd(), max);
        if outcome.unsupported {
            return PumpOutcome::Failed(transfer_unsupported());
        }
        if outcome.closed {
            return PumpOutcome::Failed(SessionError::PeerClosed);
        }
        if outcome.would_block {
            return PumpOutcome::Idle;
        }
        self.local.stats_in += outcome.moved as u64;
        safe_assert!(self.pipe_out.fill_level() <= PIPE_CAPACITY, "pipe_out grew past its capacity");
        if self.pipe_out.fill_level() >= HIGH_WATER {
            self.local.read_armed = false;
        }
        PumpOutcome::Progressed
    }

    // ---- pipe_in -> local ----------------------------------------------

    /// Pushes bytes from `pipe_in` to the client/upstream socket. Called on
    /// write readiness for `local.stream`, or after reassembly makes
    /// progress.
    pub fn pump_local_write(&mut self) -> PumpOutcome {
        let avail = self.pipe_in.fill_level();
        if avail == 0 {
            self.local.write_armed = false;
            return PumpOutcome::Idle;
        }
        let outcome = self.pipe_in.drain_to(self.local.stream.as_fd(), avail);
        if outcome.unsupported {
            return PumpOutcome::Failed(transfer_unsupported());
        }
        if outcome.closed {
            return PumpOutcome::Failed(SessionError::PeerClosed);
        }
        if outcome.would_block {
            self.local.write_armed = true;
            return PumpOutcome::Idle;
        }
        self.local.stats_out += outcome.moved as u64;
        if self.pipe_in.fill_level() < LOW_WATER {
            self.rearm_all_remote_reads();
        }
        PumpOutcome::Progressed
    }

    fn rearm_all_remote_reads(&mut self) {
        for (idx, r) in self.remotes.iter_mut().enumerate() {
            // An off-serial remote stays paused even below the water mark;
            // it is re-armed explicitly at turn end (§4.4 step 5).
            if self.current_receive_remote.is_none() || self.current_receive_remote == Some(idx) {
                r.read_armed = true;
            }
        }
    }

    // ---- Striping scheduler (§4.3) -------------------------------------

    /// Drives the outgoing scheduler for one remote's write readiness, or
    /// to open a new chunk after `pump_local_read` staged bytes.
    pub fn pump_schedule(&mut self) -> PumpOutcome {
        if self.remaining_send_bytes == 0 && self.partial_header_bytes == 0 {
            if self.pipe_out.fill_level() == 0 {
                return PumpOutcome::Idle;
            }
            safe_assert!(self.current_send_remote.is_none(), "opened a new chunk with a remote still selected");
            match self.select_next_remote() {
                Some(idx) => self.open_chunk(idx),
                None => return PumpOutcome::Failed(SessionError::NoRoutableRemote),
            }
        }

        let Some(idx) = self.current_send_remote else { return PumpOutcome::Idle };

        if self.partial_header_bytes > 0 {
            match self.write_header(idx) {
                Ok(true) => {}
                Ok(false) => return PumpOutcome::Idle,
                Err(e) => return PumpOutcome::Failed(e),
            }
        }

        if self.remaining_send_bytes > 0 {
            return match self.write_body(idx) {
                Ok(()) => PumpOutcome::Progressed,
                Err(e) => PumpOutcome::Failed(e),
            };
        }
        PumpOutcome::Progressed
    }

    /// Advances `current_send_remote`, skipping disconnected remotes,
    /// wrapping to the head. Fails after two full loops with no connected
    /// remote (carried over verbatim from the original implementation).
    fn select_next_remote(&self) -> Option<usize> {
        if self.remotes.is_empty() {
            return None;
        }
        let start = self.current_send_remote.map_or(0, |i| (i + 1) % self.remotes.len());
        let mut loops = 0usize;
        let mut idx = start;
        loop {
            if self.remotes[idx].connected {
                return Some(idx);
            }
            idx = (idx + 1) % self.remotes.len();
            if idx == start {
                loops += 1;
                if loops >= 2 {
                    return None;
                }
            }
        }
    }

    fn open_chunk(&mut self, idx: usize) {
        self.current_send_remote = Some(idx);
        let nr = self.pipe_out.fill_level() as u32;
        self.remaining_send_bytes = nr;
        self.send_serial += 1;
        self.send_header_buf = ChunkHeader::new(self.send_serial, nr).encode();
        self.partial_header_bytes = HEADER_SIZE;
        set_cork(&self.remotes[idx].stream, true);
    }

    /// Returns `Ok(true)` once the header is fully written, `Ok(false)` if
    /// write would block (interest armed).
    fn write_header(&mut self, idx: usize) -> Result<bool, SessionError> {
        use std::io::Write;
        loop {
            let written_already = HEADER_SIZE - self.partial_header_bytes;
            let header_buf = self.send_header_buf;
            let remote = &mut self.remotes[idx];
            match remote.stream.write(&header_buf[written_already..]) {
                Ok(0) => return Err(SessionError::PeerClosed),
                Ok(n) => {
                    self.partial_header_bytes -= n;
                    if self.partial_header_bytes == 0 {
                        return Ok(true);
                    }
                }
                Err(e) if is_transient(&e) => {
                    remote.write_armed = true;
                    return Ok(false);
                }
                Err(e) => return Err(SessionError::Io(e)),
            }
        }
    }

    /// Drains the chunk body to `remotes[idx]` until the chunk is fully
    /// sent or the socket itself blocks; a single `drain_to` call only
    /// moves one bounded slice; stopping after one would leave bytes
    /// sitting in `pipe_out` with no further readiness edge to prompt a
    /// retry once the socket is edge-triggered.
    fn write_body(&mut self, idx: usize) -> Result<(), SessionError> {
        loop {
            let remote = &mut self.remotes[idx];
            let max = (self.remaining_send_bytes as usize).min(MAX_CHUNK_SLICE);
            let outcome = self.pipe_out.drain_to(remote.stream.as_fd(), max);
            if outcome.unsupported {
                return Err(transfer_unsupported());
            }
            if outcome.closed {
                return Err(SessionError::PeerClosed);
            }
            if outcome.would_block {
                remote.write_armed = true;
                return Ok(());
            }
            remote.stats_out += outcome.moved as u64;
            self.remaining_send_bytes -= outcome.moved as u32;
            if self.pipe_out.fill_level() < LOW_WATER {
                self.local.read_armed = true;
            }
            if self.remaining_send_bytes == 0 {
                set_cork(&remote.stream, false);
                self.current_send_remote = None;
                return Ok(());
            }
        }
    }

    // ---- Reassembly engine (§4.4) --------------------------------------

    /// Drives reassembly for one remote's read readiness.
    pub fn pump_reassembly(&mut self, idx: usize) -> PumpOutcome {
        if !self.remotes[idx].header_complete() {
            match self.read_header(idx) {
                Ok(true) => {}
                Ok(false) => return PumpOutcome::Idle,
                Err(e) => return PumpOutcome::Failed(e),
            }
        }

        let serial = self.remotes[idx].receive_serial;
        if serial != self.receive_serial + 1 {
            // Off-serial: hold this remote's data until its turn.
            self.remotes[idx].read_armed = false;
            return PumpOutcome::Idle;
        }

        self.promote(idx);
        self.body_phase(idx)
    }

    fn read_header(&mut self, idx: usize) -> Result<bool, SessionError> {
        use std::io::Read;
        loop {
            let remote = &mut self.remotes[idx];
            let have = remote.partial_header_bytes;
            match remote.stream.read(&mut remote.partial_header[have..]) {
                Ok(0) => return Err(SessionError::PeerClosed),
                Ok(n) => {
                    remote.partial_header_bytes += n;
                    if remote.partial_header_bytes == HEADER_SIZE {
                        let header = ChunkHeader::decode(&remote.partial_header);
                        header.validate()?;
                        if header.serial <= remote.receive_serial && remote.receive_serial != 0 {
                            return Err(SessionError::SerialRegression {
                                expected: remote.receive_serial + 1,
                                got: header.serial,
                            });
                        }
                        remote.receive_serial = header.serial;
                        remote.remaining_recv_bytes = header.length;
                        return Ok(true);
                    }
                }
                Err(e) if is_transient(&e) => return Ok(false),
                Err(e) => return Err(SessionError::Io(e)),
            }
        }
    }

    fn promote(&mut self, idx: usize) {
        self.receive_serial += 1;
        self.current_receive_remote = Some(idx);
        trace!(serial = self.receive_serial, remote = idx, "promoted remote for reassembly");
    }

    /// Fills `pipe_in` from `remotes[idx]` until the chunk is fully
    /// received, the socket blocks, or the high-water mark is hit; see
    /// `write_body` for why one `fill_from` call per callback isn't enough.
    fn body_phase(&mut self, idx: usize) -> PumpOutcome {
        loop {
            let remote = &mut self.remotes[idx];
            let max = (remote.remaining_recv_bytes as usize).min(MAX_CHUNK_SLICE);
            let outcome = self.pipe_in.fill_from(remote.stream.as_fd(), max);
            if outcome.unsupported {
                return PumpOutcome::Failed(transfer_unsupported());
            }
            if outcome.closed {
                return PumpOutcome::Failed(SessionError::PeerClosed);
            }
            if outcome.would_block {
                return PumpOutcome::Idle;
            }
            let remote = &mut self.remotes[idx];
            remote.stats_in += outcome.moved as u64;
            remote.remaining_recv_bytes -= outcome.moved as u32;

            safe_assert!(self.pipe_in.fill_level() <= PIPE_CAPACITY, "pipe_in grew past its capacity");
            if self.pipe_in.fill_level() >= HIGH_WATER {
                self.remotes[idx].read_armed = false;
                return PumpOutcome::Progressed;
            }

            if self.remotes[idx].remaining_recv_bytes == 0 {
                self.remotes[idx].reset_header();
                self.current_receive_remote = None;
                if let Some(next) = self.find_ready_remote() {
                    self.promote(next);
                    return self.body_phase(next);
                }
                self.rearm_all_remote_reads();
                return PumpOutcome::Progressed;
            }
        }
    }

    /// Turn-end scan: any remote whose header is already fully buffered
    /// and whose serial is exactly next.
    fn find_ready_remote(&self) -> Option<usize> {
        self.remotes.iter().position(|r| r.header_complete() && r.receive_serial == self.receive_serial + 1)
    }
}

/// This session's conduit just hit `ENOSYS`/`EINVAL` on `splice(2)`; the
/// process-wide flag is already downgraded for sessions created from now
/// on, but this one can make no further progress and must be torn down.
fn transfer_unsupported() -> SessionError {
    SessionError::TransferUnsupported(std::io::Error::from(std::io::ErrorKind::Unsupported))
}

/// `TCP_CORK` around a chunk's header+body, or a local no-op where
/// unsupported.
fn set_cork(stream: &mio::net::TcpStream, on: bool) {
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::AsRawFd;
        let value: libc::c_int = i32::from(on);
        let rc = unsafe {
            libc::setsockopt(
                stream.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_CORK,
                std::ptr::addr_of!(value).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            warn!(error = %std::io::Error::last_os_error(), "TCP_CORK setsockopt failed");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (stream, on);
    }
}
