//! BSD-family backend (macOS and friends): no `SOCK_NONBLOCK`/`accept4`,
//! so flags are applied with fcntl; `SO_NOSIGPIPE` replaces `MSG_NOSIGNAL`.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub(crate) const SEND_FLAGS: libc::c_int = 0;

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nosigpipe(fd: RawFd) -> io::Result<()> {
    let optval: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create a non-blocking, close-on-exec stream socket with `SIGPIPE`
/// suppressed at the socket level.
pub(crate) fn socket_nonblocking(family: libc::c_int) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    set_nonblocking_cloexec(owned.as_raw_fd())?;
    set_nosigpipe(owned.as_raw_fd())?;
    Ok(owned)
}

/// One non-blocking accept attempt; flags are applied after the fact.
pub(crate) fn accept_nonblocking(
    fd: RawFd,
) -> io::Result<(OwnedFd, libc::sockaddr_storage)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let accepted = unsafe {
        libc::accept(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if accepted < 0 {
        return Err(io::Error::last_os_error());
    }
    let owned = unsafe { OwnedFd::from_raw_fd(accepted) };
    set_nonblocking_cloexec(owned.as_raw_fd())?;
    set_nosigpipe(owned.as_raw_fd())?;
    Ok((owned, storage))
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

/// The transient-retry set, minus `ENONET` which BSD does not define.
pub(crate) fn is_transient_accept_error(raw: i32) -> bool {
    matches!(
        raw,
        libc::ECONNABORTED
            | libc::EINTR
            | libc::ENETDOWN
            | libc::EPROTO
            | libc::ENOPROTOOPT
            | libc::EHOSTDOWN
            | libc::EHOSTUNREACH
            | libc::EOPNOTSUPP
            | libc::ENETUNREACH
    )
}
