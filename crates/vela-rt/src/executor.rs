use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use async_task::Runnable;
use concurrent_queue::ConcurrentQueue;

use crate::reactor;

/// The global task executor.
///
/// Intentionally minimal: a ready queue drained by whichever thread calls
/// [`try_tick`](Executor::try_tick) or [`block_on`](Executor::block_on).
/// Thread-pool tuning and work stealing are out of scope — the core only
/// needs a scheduler that suspends and resumes cooperative tasks.
pub(crate) struct Executor {
    queue: ConcurrentQueue<Runnable>,
}

static EXECUTOR: OnceLock<Executor> = OnceLock::new();

pub(crate) fn get() -> &'static Executor {
    EXECUTOR.get_or_init(|| Executor {
        queue: ConcurrentQueue::unbounded(),
    })
}

/// Schedule function for async-task. `Fn(Runnable) + Send + Sync` — wakers
/// may fire from any thread.
fn schedule(runnable: Runnable) {
    get().queue.push(runnable).unwrap();
}

impl Executor {
    /// Spawn a future; it is polled by `try_tick`/`block_on` callers.
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (runnable, task) = async_task::spawn(future, schedule);
        task.detach();
        runnable.schedule();
    }

    /// Pop one ready task and poll it. Returns true if a task was polled.
    pub(crate) fn try_tick(&self) -> bool {
        match self.queue.pop() {
            Ok(runnable) => {
                runnable.run();
                true
            }
            Err(_) => false,
        }
    }

    /// Drive executor and reactor until the given future completes.
    pub(crate) fn block_on<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (runnable, task) = async_task::spawn(future, schedule);
        runnable.schedule();

        let reactor = reactor::get();

        loop {
            if task.is_finished() {
                break;
            }

            let mut did_work = false;
            while self.try_tick() {
                did_work = true;
                if task.is_finished() {
                    return;
                }
            }

            // Non-blocking reactor pass if tasks just ran (their wakers may
            // produce more work), a short wait otherwise.
            let timeout = if did_work {
                Some(Duration::ZERO)
            } else {
                Some(Duration::from_millis(10))
            };
            let _ = reactor.react(timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    /// The global executor queue is shared across test threads; tests that
    /// inspect queue state must not interleave.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn test_guard() -> std::sync::MutexGuard<'static, ()> {
        let guard = TEST_LOCK.lock().unwrap();
        // Drain leftovers so each test starts with an empty queue.
        while get().try_tick() {}
        guard
    }

    #[test]
    fn spawn_and_tick() {
        let _g = test_guard();
        let executor = get();
        let counter = Arc::new(AtomicU64::new(0));
        let counter_clone = counter.clone();

        executor.spawn(async move {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(executor.try_tick(), "should have had a task to run");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn try_tick_empty_queue() {
        let _g = test_guard();
        assert!(!get().try_tick(), "no tasks should be in queue");
    }

    #[test]
    fn block_on_immediate() {
        let _g = test_guard();
        let counter = Arc::new(AtomicU64::new(0));
        let counter_clone = counter.clone();

        get().block_on(async move {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn block_on_with_timer() {
        let _g = test_guard();
        let start = Instant::now();

        get().block_on(async {
            crate::sleep(Duration::from_millis(20)).await;
        });

        assert!(
            start.elapsed() >= Duration::from_millis(20),
            "timer fired too early: {:?}",
            start.elapsed()
        );
    }
}
