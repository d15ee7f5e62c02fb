use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::reactor;

/// A one-shot timer future.
///
/// Resolves once its deadline has passed; a deadline already in the past
/// resolves on the first poll. The reactor entry is cancelled on drop if
/// the timer has not fired.
pub struct Timer {
    id: u64,
    fired: bool,
}

impl Timer {
    /// A timer firing after the given duration.
    pub fn after(duration: Duration) -> Self {
        Self::at(Instant::now() + duration)
    }

    /// A timer firing at the given instant.
    pub fn at(deadline: Instant) -> Self {
        Timer {
            id: reactor::get().timer_create(deadline),
            fired: false,
        }
    }
}

impl Future for Timer {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.fired {
            return Poll::Ready(());
        }
        match reactor::get().timer_poll(self.id, cx.waker().clone()) {
            Poll::Ready(()) => {
                self.fired = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if !self.fired {
            reactor::get().timer_cancel(self.id);
        }
    }
}
