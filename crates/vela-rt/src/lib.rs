//! vela-rt: the task-suspension collaborator of the vela concurrency core.
//!
//! A process-global reactor (IO readiness + timers) and a minimal executor
//! drive cooperative tasks on the thread that calls [`block_on`]. Suspending
//! never blocks the driving thread — a pending future parks its waker with
//! the reactor and yields back to the scheduler.
//!
//! Higher layers build on four things exported here:
//!
//! - [`Deadline`] — an absolute point in time (or "never") bounding a wait
//! - [`CancelToken`] — an explicit cancellation handle checked at
//!   cancellation points and while suspended
//! - [`Timer`] — a one-shot future resolving at a deadline
//! - [`AsyncFd`] — readiness futures for a non-blocking file descriptor
//!
//! # Quick start
//!
//! ```ignore
//! use std::time::Duration;
//! use vela_rt::{block_on, spawn, sleep};
//!
//! block_on(async {
//!     spawn(async {
//!         sleep(Duration::from_millis(100)).await;
//!     });
//! });
//! ```

mod cancel;
mod deadline;
mod executor;
mod fd;
mod reactor;
mod timer;

pub use cancel::{CancelGuard, CancelToken};
pub use deadline::Deadline;
pub use fd::AsyncFd;
pub use timer::Timer;

use std::future::Future;
use std::io;
use std::time::Duration;

/// Spawn a future onto the shared executor.
///
/// The future is polled by whoever calls [`try_tick`] or [`block_on`].
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    executor::get().spawn(future);
}

/// Block the current thread until the future completes, driving both the
/// executor (spawned tasks) and the reactor (IO + timers).
pub fn block_on<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    executor::get().block_on(future);
}

/// Poll one ready task from the executor queue.
///
/// Returns `true` if a task was polled, `false` if the queue was empty.
pub fn try_tick() -> bool {
    executor::get().try_tick()
}

/// Run the reactor once: fire expired timers, poll the OS for IO events.
pub fn react(timeout: Option<Duration>) -> io::Result<()> {
    reactor::get().react(timeout)
}

/// Suspend the current task for the given duration.
pub async fn sleep(duration: Duration) {
    Timer::after(duration).await
}

/// Yield once to the scheduler, letting other ready tasks run.
pub async fn yield_now() {
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<()> {
            if self.yielded {
                std::task::Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                std::task::Poll::Pending
            }
        }
    }

    YieldNow { yielded: false }.await
}
