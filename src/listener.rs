//! Listening socket acquisition and hand-off across restarts.
//!
//! A server takes its socket from the first source that has one:
//!
//! 1. a descriptor inherited from a restarting parent (Unix, `PORTICO_LISTEN_FD`),
//! 2. a listener bound by the caller,
//! 3. a fresh bind of `0.0.0.0:<port>` with `SO_REUSEADDR`.
//!
//! On restart the parent duplicates its listening descriptor without
//! close-on-exec and starts a new copy of the current executable with the
//! same arguments. Both processes accept on the same socket until the parent
//! stops accepting and drains, so no connection attempt is refused.

use std::io;
use std::net::{SocketAddr, TcpListener};

use socket2::{Domain, Protocol, Socket, Type};

/// Environment variable naming the inherited listening descriptor.
pub const LISTEN_FD_ENV: &str = "PORTICO_LISTEN_FD";

const BACKLOG: i32 = 1024;

/// Resolves the listening socket, ready for tokio.
pub(crate) fn acquire(port: u16, prebound: Option<TcpListener>) -> io::Result<TcpListener> {
    if let Some(listener) = inherited()? {
        tracing::info!(addr = ?listener.local_addr().ok(), "using inherited listener");
        return Ok(listener);
    }

    let listener = match prebound {
        Some(listener) => listener,
        None => bind_shared(port)?,
    };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Binds `0.0.0.0:port` with address reuse, so a restarted process can bind
/// while connections of the old one linger in `TIME_WAIT`.
pub(crate) fn bind_shared(port: u16) -> io::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

#[cfg(unix)]
fn inherited() -> io::Result<Option<TcpListener>> {
    match std::env::var(LISTEN_FD_ENV) {
        Ok(raw) => adopt(&raw).map(Some),
        Err(_) => Ok(None),
    }
}

#[cfg(not(unix))]
fn inherited() -> io::Result<Option<TcpListener>> {
    Ok(None)
}

/// Takes ownership of the descriptor named by `raw`.
#[cfg(unix)]
fn adopt(raw: &str) -> io::Result<TcpListener> {
    use std::os::fd::{FromRawFd, RawFd};

    let fd: RawFd = raw.trim().parse().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("{LISTEN_FD_ENV}={raw:?} is not a descriptor"))
    })?;
    if fd < 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("{LISTEN_FD_ENV}={fd} is negative")));
    }

    // SAFETY: the restarting parent passed this descriptor to us for exactly
    // this purpose and nothing else in the process owns it.
    let listener = unsafe { TcpListener::from_raw_fd(fd) };
    // Fails with ENOTSOCK if the descriptor is not a socket.
    listener.local_addr()?;
    socket2::SockRef::from(&listener).set_cloexec(true)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Starts a copy of this executable that inherits `listener`.
///
/// The child receives the same arguments plus [`LISTEN_FD_ENV`].
#[cfg(unix)]
pub(crate) fn spawn_successor(listener: &tokio::net::TcpListener) -> io::Result<std::process::Child> {
    use std::os::fd::{AsFd, AsRawFd};

    let dup = listener.as_fd().try_clone_to_owned()?;
    socket2::SockRef::from(&dup).set_cloexec(false)?;

    let child = std::process::Command::new(std::env::current_exe()?)
        .args(std::env::args_os().skip(1))
        .env(LISTEN_FD_ENV, dup.as_raw_fd().to_string())
        .spawn()?;
    // The child holds its own copy now.
    drop(dup);
    Ok(child)
}
