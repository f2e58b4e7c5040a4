//! TCP socket construction: bind with fallback retries, nonblocking
//! connect initiation.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

use crate::errors::{NmError, NmResult};
use crate::metrics::BIND_RETRIES;

fn new_stream_socket(addr: SocketAddr) -> io::Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

#[cfg(target_os = "linux")]
fn set_freebind(socket: &Socket) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_FREEBIND,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_freebind(_socket: &Socket) -> io::Result<()> {
    Ok(())
}

fn try_bind_listen(
    iface: SocketAddr,
    backlog: u32,
    reuse: bool,
    freebind: bool,
) -> io::Result<std::net::TcpListener> {
    let socket = new_stream_socket(iface)?;
    if reuse {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
    }
    if freebind {
        set_freebind(&socket)?;
    }
    socket.bind(&iface.into())?;
    socket.listen(backlog as i32)?;
    // Bind errors can be delayed; probing the local name surfaces them.
    socket.local_addr()?;
    Ok(socket.into())
}

/// Bind and listen on `iface`.
///
/// The first attempt binds plainly. `EADDRINUSE` retries with
/// SO_REUSEADDR and SO_REUSEPORT; `EADDRNOTAVAIL` retries with
/// IP_FREEBIND. A retry that still fails surfaces the original error
/// kind.
pub(crate) fn bind_listen(iface: SocketAddr, backlog: u32) -> NmResult<std::net::TcpListener> {
    match try_bind_listen(iface, backlog, false, false) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            BIND_RETRIES.increment();
            tracing::debug!(%iface, "bind: address in use, retrying with reuse options");
            try_bind_listen(iface, backlog, true, false).map_err(|_| NmError::AddrInUse)
        }
        Err(e) if e.kind() == io::ErrorKind::AddrNotAvailable => {
            BIND_RETRIES.increment();
            tracing::debug!(%iface, "bind: address not available, retrying with freebind");
            try_bind_listen(iface, backlog, false, true).map_err(|_| NmError::AddrNotAvail)
        }
        Err(e) => Err(NmError::from_io(&e)),
    }
}

/// Start a nonblocking connect, optionally binding `local` first.
///
/// Completion (or failure) is observed through writability and
/// `SO_ERROR` on the poll loop.
pub(crate) fn connect_start(
    local: Option<SocketAddr>,
    peer: SocketAddr,
) -> io::Result<std::net::TcpStream> {
    let socket = new_stream_socket(peer)?;
    if let Some(local) = local {
        socket.bind(&local.into())?;
    }
    match socket.connect(&peer.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}
