//! Socket lifecycle: nonblocking connect over a resolved address list,
//! accept, and the `SO_ERROR` dance used to detect connect completion.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;

use mio::net::{TcpListener, TcpStream};

/// Iterates `addrs`, attempting a nonblocking connect on each in turn.
/// Per-family failures (the historical `EINPROGRESS`-tolerant loop) move on
/// to the next address; an error is returned only once every address is
/// exhausted.
pub fn connect_any(addrs: &[SocketAddr]) -> io::Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(*addr) {
            Ok(stream) => return Ok((stream, *addr)),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses to try")))
}

pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    // mio's TcpListener::bind always uses a kernel-default backlog; the
    // configured value is applied with a raw `listen(2)` call on the same
    // fd to honour the historical default of 20.
    let listener = TcpListener::bind(addr)?;
    let rc = unsafe { libc::listen(listener.as_raw_fd(), backlog) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(listener)
}

/// Consults the socket's pending error. `Ok(())` means the nonblocking
/// connect completed successfully (`pending -> connected`); `Err` carries
/// the connect failure (`pending -> failed`, session torn down).
pub fn take_socket_error(stream: &TcpStream) -> io::Result<()> {
    match stream.take_error()? {
        None => Ok(()),
        Some(e) => Err(e),
    }
}
