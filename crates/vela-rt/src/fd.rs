use std::future::poll_fn;
use std::io;
use std::os::unix::io::RawFd;
use std::task::{Context, Poll};

use crate::reactor;

/// A file descriptor registered with the reactor for async readiness.
///
/// `AsyncFd` does NOT own the descriptor — it only manages the reactor
/// registration. The caller is responsible for closing the fd (e.g. via
/// `OwnedFd`) after this wrapper is dropped, never before.
pub struct AsyncFd {
    handle: u64,
    fd: RawFd,
}

impl AsyncFd {
    /// Register a non-blocking file descriptor with the reactor.
    pub fn new(fd: RawFd) -> io::Result<Self> {
        let handle = reactor::get().io_register(fd);
        Ok(AsyncFd { handle, fd })
    }

    /// The underlying raw file descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Poll-level read readiness, for callers racing readiness against
    /// timers or cancellation in a hand-written future.
    pub fn poll_readable(&self, cx: &mut Context<'_>) -> Poll<()> {
        reactor::get().io_poll_readable(self.handle, cx.waker().clone())
    }

    /// Poll-level write readiness.
    pub fn poll_writable(&self, cx: &mut Context<'_>) -> Poll<()> {
        reactor::get().io_poll_writable(self.handle, cx.waker().clone())
    }

    /// Wait until the fd is readable.
    ///
    /// Readiness may be spurious: if the following read reports
    /// `WouldBlock`, call `readable()` again.
    pub async fn readable(&self) {
        poll_fn(|cx| self.poll_readable(cx)).await
    }

    /// Wait until the fd is writable.
    pub async fn writable(&self) {
        poll_fn(|cx| self.poll_writable(cx)).await
    }
}

impl Drop for AsyncFd {
    fn drop(&mut self) {
        reactor::get().io_deregister(self.handle);
    }
}
