use std::io;

use thiserror::Error;

/// Cause of a single session's teardown.
///
/// Every variant here destroys at most the one session that raised it; the
/// taxonomy mirrors the transient/peer-close/protocol/fatal split used
/// throughout the reassembly and scheduler code so that callers can decide,
/// at a single match site, whether to log at `debug` or `warn`.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("declared chunk length {0} exceeds sanity bound of {1} bytes")]
    OversizeLength(u32, u32),

    #[error("chunk length is zero")]
    ZeroLength,

    #[error("serial regression on remote: expected {expected}, got {got}")]
    SerialRegression { expected: u32, got: u32 },

    #[error("no connected remote after two full scheduling loops")]
    NoRoutableRemote,

    #[error("zero-copy transfer unsupported by the kernel: {0}")]
    TransferUnsupported(io::Error),

    #[error("resource exhaustion during setup: {0}")]
    ResourceExhausted(io::Error),
}

impl SessionError {
    /// True for errors that should be logged quietly (peer hung up on us,
    /// nothing actionable) rather than as a warning.
    pub fn is_quiet(&self) -> bool {
        matches!(self, SessionError::PeerClosed)
            || matches!(self, SessionError::Io(e) if is_peer_close(e))
    }
}

fn is_peer_close(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    )
}

/// Transient, locally-recoverable condition: re-arm interest and return to
/// the reactor. Never escapes the callback that observed it.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
