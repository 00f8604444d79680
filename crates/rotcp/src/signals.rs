//! Signal handling. `SIGINT`/`SIGTERM` request a clean shutdown, `SIGUSR1`
//! requests a non-destructive session dump, and `SIGHUP`/`SIGPIPE` are
//! ignored at startup — mirroring `event_configure` in the original
//! implementation's reactor setup.

use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub struct SignalFlags {
    pub shutdown: Arc<AtomicBool>,
    pub dump: Arc<AtomicBool>,
}

/// Registers flag-based handlers for `SIGINT`/`SIGTERM`/`SIGUSR1` and
/// ignores `SIGHUP`/`SIGPIPE`. The flags are polled from the reactor's
/// event loop rather than acted on inside the signal handler itself, which
/// keeps every action here async-signal-safe.
pub fn install() -> io::Result<SignalFlags> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let dump = Arc::new(AtomicBool::new(false));

    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGUSR1, Arc::clone(&dump))?;

    ignore(libc::SIGHUP);
    ignore(libc::SIGPIPE);

    Ok(SignalFlags { shutdown, dump })
}

fn ignore(signum: libc::c_int) {
    unsafe {
        libc::signal(signum, libc::SIG_IGN);
    }
}
