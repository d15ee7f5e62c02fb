//! Platform abstraction for socket flag and errno differences.
//!
//! Exactly one backend is selected at build time; the rest of the crate
//! contains no per-OS conditionals.
//!
//! Backend surface:
//! - `socket_nonblocking(family)` — stream socket, non-blocking + cloexec
//! - `accept_nonblocking(fd)` — accepted fd arrives non-blocking + cloexec
//! - `set_reuse_port(fd)` — best-effort load-balanced listeners
//! - `SEND_FLAGS` — keeps a peer disconnect an `EPIPE` error instead of a
//!   process-level `SIGPIPE`
//! - `is_transient_accept_error(raw)` — the fixed errno set that accept
//!   retries internally

use std::io;
use std::os::unix::io::{OwnedFd, RawFd};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux as backend;

#[cfg(not(target_os = "linux"))]
mod bsd;
#[cfg(not(target_os = "linux"))]
use bsd as backend;

pub(crate) use backend::{is_transient_accept_error, set_reuse_port, socket_nonblocking, SEND_FLAGS};

/// One non-blocking accept attempt.
///
/// In test builds a per-fd injected errno takes precedence over the real
/// syscall, so error-handling paths can be driven deterministically.
pub(crate) fn accept_nonblocking(fd: RawFd) -> io::Result<(OwnedFd, libc::sockaddr_storage)> {
    #[cfg(test)]
    if let Some(raw) = fault::take_accept_errno(fd) {
        return Err(io::Error::from_raw_os_error(raw));
    }
    backend::accept_nonblocking(fd)
}
