//! Zero-copy page transfer between sockets and a per-session staging pipe,
//! with a buffered fallback for kernels or platforms that lack `splice(2)`.
//!
//! `splice(2)` moves pages between a socket and a pipe without a user-space
//! copy. Where it is unavailable the first time it is attempted
//! (`ENOSYS`/`EINVAL`), the whole process is downgraded to the buffered
//! strategy for every session created afterwards: the kernel's capability
//! does not change at runtime, so there is no point re-probing per session.
//! The session whose splice call actually failed is still torn down per
//! the fatal "host/kernel missing feature" path; only *new* sessions pick
//! up the buffered conduit from then on. All byte counters (`nr`, `nw`,
//! high/low water marks) behave identically in both modes.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::fcntl::{splice, SpliceFFlags};
use nix::unistd;

use crate::header::MAX_CHUNK_SLICE;

/// Flipped once, process-wide, the first time a splice call fails with
/// `ENOSYS`/`EINVAL`. Read by every new session at construction time.
static SPLICE_SUPPORTED: AtomicBool = AtomicBool::new(cfg!(target_os = "linux"));

pub fn splice_supported() -> bool {
    SPLICE_SUPPORTED.load(Ordering::Relaxed)
}

fn mark_splice_unsupported() {
    if SPLICE_SUPPORTED.swap(false, Ordering::Relaxed) {
        tracing::warn!(
            "splice(2) unsupported on this host; falling back to buffered transfer for new sessions"
        );
    }
}

/// Outcome of a single transfer attempt, uniform across the splice and
/// buffered paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub moved: usize,
    pub would_block: bool,
    pub closed: bool,
    /// `splice(2)` just failed with `ENOSYS`/`EINVAL` on this session's
    /// conduit. The process-wide flag has already been downgraded for
    /// future sessions; this one can make no further progress and must be
    /// torn down by its caller.
    pub unsupported: bool,
}

impl TransferOutcome {
    const fn would_block() -> Self {
        Self { moved: 0, would_block: true, closed: false, unsupported: false }
    }

    const fn closed() -> Self {
        Self { moved: 0, would_block: false, closed: true, unsupported: false }
    }

    const fn unsupported() -> Self {
        Self { moved: 0, would_block: false, closed: false, unsupported: true }
    }

    const fn moved(n: usize) -> Self {
        Self { moved: n, would_block: false, closed: n == 0, unsupported: false }
    }
}

/// A session's zero-copy staging buffer for one direction: either a real OS
/// pipe spliced to/from sockets, or an in-memory fallback with identical
/// external behaviour.
pub enum Conduit {
    Pipe { read_end: OwnedFd, write_end: OwnedFd },
    Buffered(VecDeque<u8>),
}

impl Conduit {
    /// Builds the best conduit available on this host, consulting (and
    /// possibly updating) the process-wide splice-support flag.
    pub fn new() -> std::io::Result<Self> {
        if splice_supported() {
            let (read_end, write_end) = unistd::pipe2(
                nix::fcntl::OFlag::O_NONBLOCK | nix::fcntl::OFlag::O_CLOEXEC,
            )
            .map_err(std::io::Error::from)?;
            Ok(Conduit::Pipe { read_end, write_end })
        } else {
            Ok(Conduit::Buffered(VecDeque::new()))
        }
    }

    /// Bytes currently resident (`nr`/`nw` in the data model).
    pub fn fill_level(&self) -> usize {
        match self {
            Conduit::Pipe { read_end, .. } => pipe_fill_level(read_end),
            Conduit::Buffered(buf) => buf.len(),
        }
    }

    /// Moves up to `max` bytes from `from` (a readable socket) into this
    /// conduit.
    pub fn fill_from(&mut self, from: BorrowedFd, max: usize) -> TransferOutcome {
        match self {
            Conduit::Pipe { write_end, .. } => {
                match try_splice(from, write_end.as_fd(), max) {
                    Ok(n) => TransferOutcome::moved(n),
                    Err(SpliceError::WouldBlock) => TransferOutcome::would_block(),
                    Err(SpliceError::Closed) => TransferOutcome::closed(),
                    Err(SpliceError::Unsupported) => {
                        mark_splice_unsupported();
                        TransferOutcome::unsupported()
                    }
                }
            }
            Conduit::Buffered(buf) => read_into_buffer(from, buf, max),
        }
    }

    /// Moves up to `max` bytes from this conduit to `to` (a writable
    /// socket).
    pub fn drain_to(&mut self, to: BorrowedFd, max: usize) -> TransferOutcome {
        match self {
            Conduit::Pipe { read_end, .. } => {
                match try_splice(read_end.as_fd(), to, max) {
                    Ok(n) => TransferOutcome::moved(n),
                    Err(SpliceError::WouldBlock) => TransferOutcome::would_block(),
                    Err(SpliceError::Closed) => TransferOutcome::closed(),
                    Err(SpliceError::Unsupported) => {
                        mark_splice_unsupported();
                        TransferOutcome::unsupported()
                    }
                }
            }
            Conduit::Buffered(buf) => write_from_buffer(buf, to, max),
        }
    }
}

enum SpliceError {
    WouldBlock,
    Closed,
    Unsupported,
}

fn try_splice(from: BorrowedFd, to: BorrowedFd, max: usize) -> Result<usize, SpliceError> {
    if max == 0 {
        return Ok(0);
    }
    match splice(
        from,
        None,
        to,
        None,
        max,
        SpliceFFlags::SPLICE_F_MOVE | SpliceFFlags::SPLICE_F_NONBLOCK,
    ) {
        Ok(0) => Err(SpliceError::Closed),
        Ok(n) => Ok(n),
        Err(nix::errno::Errno::EAGAIN) => Err(SpliceError::WouldBlock),
        Err(nix::errno::Errno::ENOSYS | nix::errno::Errno::EINVAL) => Err(SpliceError::Unsupported),
        Err(_) => Err(SpliceError::Closed),
    }
}

fn read_into_buffer(from: BorrowedFd, buf: &mut VecDeque<u8>, max: usize) -> TransferOutcome {
    let cap = max.min(MAX_CHUNK_SLICE);
    if cap == 0 {
        return TransferOutcome::moved(0);
    }
    let mut scratch = vec![0u8; cap];
    match unistd::read(from.as_raw_fd(), &mut scratch) {
        Ok(0) => TransferOutcome::closed(),
        Ok(n) => {
            buf.extend(&scratch[..n]);
            TransferOutcome::moved(n)
        }
        Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => TransferOutcome::would_block(),
        Err(_) => TransferOutcome::closed(),
    }
}

fn write_from_buffer(buf: &mut VecDeque<u8>, to: BorrowedFd, max: usize) -> TransferOutcome {
    let n = max.min(buf.len());
    if n == 0 {
        return TransferOutcome::moved(0);
    }
    let (head, tail) = buf.as_slices();
    let chunk: std::borrow::Cow<[u8]> = if head.len() >= n {
        std::borrow::Cow::Borrowed(&head[..n])
    } else {
        let mut v = Vec::with_capacity(n);
        v.extend_from_slice(head);
        v.extend_from_slice(&tail[..n - head.len()]);
        std::borrow::Cow::Owned(v)
    };
    match unistd::write(to, &chunk) {
        Ok(0) => TransferOutcome::closed(),
        Ok(written) => {
            buf.drain(..written);
            TransferOutcome::moved(written)
        }
        Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => TransferOutcome::would_block(),
        Err(_) => TransferOutcome::closed(),
    }
}

fn pipe_fill_level(read_end: &OwnedFd) -> usize {
    let mut n: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(read_end.as_raw_fd(), libc::FIONREAD, &mut n) };
    if rc == 0 {
        n.max(0) as usize
    } else {
        0
    }
}

impl std::fmt::Debug for Conduit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Conduit::Pipe { .. } => write!(f, "Conduit::Pipe"),
            Conduit::Buffered(buf) => write!(f, "Conduit::Buffered({} bytes)", buf.len()),
        }
    }
}
