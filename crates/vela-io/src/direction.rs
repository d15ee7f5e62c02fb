use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use vela_rt::{AsyncFd, CancelGuard, CancelToken, Deadline, Timer};
use vela_sync::WaitOutcome;

use crate::error::IoError;

/// The read half or the write half of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirKind {
    Read,
    Write,
}

impl fmt::Display for DirKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirKind::Read => f.write_str("read"),
            DirKind::Write => f.write_str("write"),
        }
    }
}

/// Single-owner-at-a-time enforcement for one socket half.
///
/// Invariant: at most one task performs a given direction's IO at a time.
/// A second concurrent attempt is a caller bug and is rejected
/// immediately, never queued.
pub(crate) struct Direction {
    kind: DirKind,
    busy: AtomicBool,
}

impl Direction {
    pub(crate) fn new(kind: DirKind) -> Self {
        Direction {
            kind,
            busy: AtomicBool::new(false),
        }
    }

    /// Claim the direction for one operation, or fail fast.
    pub(crate) fn lock(&self) -> Result<DirGuard<'_>, IoError> {
        if self.busy.swap(true, Ordering::Acquire) {
            return Err(IoError::DirectionBusy(self.kind));
        }
        Ok(DirGuard { dir: self })
    }
}

pub(crate) struct DirGuard<'a> {
    dir: &'a Direction,
}

impl Drop for DirGuard<'_> {
    fn drop(&mut self) {
        self.dir.busy.store(false, Ordering::Release);
    }
}

/// Suspend until the fd is ready in the given direction, the deadline
/// elapses, or the task is cancelled — reporting exactly one outcome.
pub(crate) fn wait_ready<'a>(
    afd: &'a AsyncFd,
    kind: DirKind,
    deadline: Deadline,
    cancel: &'a CancelToken,
) -> ReadyFuture<'a> {
    ReadyFuture {
        afd,
        kind,
        deadline,
        cancel,
        cancel_guard: None,
        timer: None,
    }
}

pub(crate) struct ReadyFuture<'a> {
    afd: &'a AsyncFd,
    kind: DirKind,
    deadline: Deadline,
    cancel: &'a CancelToken,
    cancel_guard: Option<CancelGuard>,
    timer: Option<Timer>,
}

impl Future for ReadyFuture<'_> {
    type Output = WaitOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WaitOutcome> {
        let this = self.get_mut();

        if this.cancel.is_cancelled() {
            return Poll::Ready(WaitOutcome::Cancelled);
        }
        if this.deadline.passed() {
            return Poll::Ready(WaitOutcome::TimedOut);
        }

        let readiness = match this.kind {
            DirKind::Read => this.afd.poll_readable(cx),
            DirKind::Write => this.afd.poll_writable(cx),
        };
        if readiness.is_ready() {
            return Poll::Ready(WaitOutcome::Signaled);
        }

        match &mut this.cancel_guard {
            Some(guard) => guard.refresh(cx.waker()),
            guard @ None => *guard = Some(this.cancel.register(cx.waker())),
        }

        if this.timer.is_none() {
            if let Some(instant) = this.deadline.instant() {
                this.timer = Some(Timer::at(instant));
            }
        }
        if let Some(timer) = &mut this.timer {
            if Pin::new(timer).poll(cx).is_ready() {
                return Poll::Ready(WaitOutcome::TimedOut);
            }
        }

        Poll::Pending
    }
}
