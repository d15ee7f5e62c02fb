//! Linux backend: `SOCK_NONBLOCK`/`SOCK_CLOEXEC` at creation, `accept4`,
//! `MSG_NOSIGNAL` on send.

use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

/// Suppresses `SIGPIPE` on send to a disconnected peer.
pub(crate) const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;

/// Create a non-blocking, close-on-exec stream socket.
pub(crate) fn socket_nonblocking(family: libc::c_int) -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// One non-blocking accept attempt; the new fd arrives non-blocking and
/// close-on-exec without extra fcntl round-trips.
pub(crate) fn accept_nonblocking(
    fd: RawFd,
) -> io::Result<(OwnedFd, libc::sockaddr_storage)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let accepted = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if accepted < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((unsafe { OwnedFd::from_raw_fd(accepted) }, storage))
}

/// Enable `SO_REUSEPORT` so multiple listeners can share an address.
pub(crate) fn set_reuse_port(fd: RawFd) -> io::Result<()> {
    let optval: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The fixed errno set accept retries internally: dead-on-arrival
/// connections, signal interrupts, and link/route-level failures that
/// poison a single pending connection, not the listener.
pub(crate) fn is_transient_accept_error(raw: i32) -> bool {
    matches!(
        raw,
        libc::ECONNABORTED
            | libc::EINTR
            | libc::ENETDOWN
            | libc::EPROTO
            | libc::ENOPROTOOPT
            | libc::EHOSTDOWN
            | libc::ENONET
            | libc::EHOSTUNREACH
            | libc::EOPNOTSUPP
            | libc::ENETUNREACH
    )
}
