use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use vela_rt::{CancelGuard, CancelToken, Deadline, Timer};

/// Why a suspended task was resumed. Exactly one is reported per wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Another task called [`Waiter::signal`].
    Signaled,
    /// The deadline elapsed first.
    TimedOut,
    /// The owning task was cancelled.
    Cancelled,
}

/// A single-slot suspension primitive.
///
/// At most one task waits at a time; [`signal`](Waiter::signal) may be
/// called from any task or thread. A signal arriving while nobody waits is
/// remembered and consumed by the next [`wait`](Waiter::wait) — there is no
/// window in which a wakeup can be lost between a state check and going to
/// sleep.
///
/// Clones share the same slot.
#[derive(Clone, Default)]
pub struct Waiter {
    slot: Arc<Mutex<Slot>>,
}

#[derive(Default)]
struct Slot {
    signaled: bool,
    waker: Option<Waker>,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the registered waiter, or remember the signal for the next wait.
    pub fn signal(&self) {
        let waker = {
            let mut slot = self.slot.lock().unwrap();
            slot.signaled = true;
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Suspend until signaled, the deadline elapses, or the task is
    /// cancelled, reporting which.
    ///
    /// An already-elapsed deadline reports [`WaitOutcome::TimedOut`] without
    /// suspending and without consuming a pending signal; an
    /// already-cancelled token likewise reports [`WaitOutcome::Cancelled`]
    /// immediately.
    pub fn wait<'a>(&'a self, deadline: Deadline, cancel: &'a CancelToken) -> WaitFuture<'a> {
        WaitFuture {
            waiter: self,
            deadline,
            cancel,
            cancel_guard: None,
            timer: None,
        }
    }
}

pub struct WaitFuture<'a> {
    waiter: &'a Waiter,
    deadline: Deadline,
    cancel: &'a CancelToken,
    cancel_guard: Option<CancelGuard>,
    timer: Option<Timer>,
}

impl Future for WaitFuture<'_> {
    type Output = WaitOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WaitOutcome> {
        let this = self.get_mut();

        if this.cancel.is_cancelled() {
            return Poll::Ready(WaitOutcome::Cancelled);
        }
        if this.deadline.passed() {
            return Poll::Ready(WaitOutcome::TimedOut);
        }

        {
            let mut slot = this.waiter.slot.lock().unwrap();
            if slot.signaled {
                slot.signaled = false;
                return Poll::Ready(WaitOutcome::Signaled);
            }
            slot.waker = Some(cx.waker().clone());
        }

        match &mut this.cancel_guard {
            Some(guard) => guard.refresh(cx.waker()),
            guard @ None => *guard = Some(this.cancel.register(cx.waker())),
        }

        // The timer exists only to wake us; the outcome checks above decide.
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
