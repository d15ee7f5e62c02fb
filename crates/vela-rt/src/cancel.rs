use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;

use slab::Slab;

/// Explicit task-cancellation handle.
///
/// Every suspending operation in the core takes a `&CancelToken` instead of
/// reading an ambient per-task flag. Cloning is cheap; clones share the same
/// flag. [`cancel`](Self::cancel) is sticky — once set it never resets — and
/// wakes every task currently suspended on this token, so a cancellation is
/// never lost between a flag check and going to sleep.
///
/// The waker registry only tracks currently-suspended calls: each
/// registration is scoped by a [`CancelGuard`] that removes its entry when
/// the suspended future completes or is dropped. A long-lived token passed
/// through many short-lived operations holds no state for the finished ones.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    wakers: Mutex<Slab<Waker>>,
}

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake all suspended waiters.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let wakers: Vec<Waker> = {
            let mut slab = self.inner.wakers.lock().unwrap();
            slab.drain().collect()
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Cancellation-point check: `true` means the caller must abort.
    pub fn checkpoint(&self) -> bool {
        self.is_cancelled()
    }

    /// Register a waker to be fired on cancellation.
    ///
    /// Called from `poll` on the first suspension; re-polls go through
    /// [`CancelGuard::refresh`]. Dropping the guard removes the entry.
    /// An already-cancelled token wakes the waker immediately.
    pub fn register(&self, waker: &Waker) -> CancelGuard {
        let key = {
            // The flag is read under the registry lock: cancel() sets it
            // before draining, so an entry inserted here is always seen by
            // a concurrent drain.
            let mut wakers = self.inner.wakers.lock().unwrap();
            if self.is_cancelled() {
                None
            } else {
                Some(wakers.insert(waker.clone()))
            }
        };
        if key.is_none() {
            waker.wake_by_ref();
        }
        CancelGuard {
            inner: self.inner.clone(),
            key,
        }
    }
}

/// One suspended call's slot in a token's waker registry.
///
/// Held by the suspending future for as long as it may be woken by
/// cancellation; dropping it deregisters, so completed operations leave
/// nothing behind on the token.
#[must_use = "dropping the guard deregisters the waker"]
pub struct CancelGuard {
    inner: Arc<Inner>,
    key: Option<usize>,
}

impl CancelGuard {
    /// Replace the stored waker on re-poll.
    ///
    /// Wakes the new waker immediately if the token was cancelled since
    /// registration.
    pub fn refresh(&mut self, waker: &Waker) {
        let mut wakers = self.inner.wakers.lock().unwrap();
        if self.inner.cancelled.load(Ordering::SeqCst) {
            // cancel() drained the registry; the slot is gone.
            self.key = None;
            drop(wakers);
            waker.wake_by_ref();
            return;
        }
        match self.key {
            Some(key) if wakers.contains(key) => wakers[key].clone_from(waker),
            _ => self.key = Some(wakers.insert(waker.clone())),
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut wakers = self.inner.wakers.lock().unwrap();
            if wakers.contains(key) {
                wakers.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::{waker, ArcWake};
    use std::sync::atomic::AtomicUsize;

    struct CountingWake(Arc<AtomicUsize>);

    impl ArcWake for CountingWake {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_waker(count: Arc<AtomicUsize>) -> Waker {
        waker(Arc::new(CountingWake(count)))
    }

    #[test]
    fn starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(!token.checkpoint());
    }

    #[test]
    fn cancel_is_sticky_and_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_wakes_registered_waker() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let _guard = token.register(&counting_waker(count.clone()));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        token.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_after_cancel_wakes_immediately() {
        let token = CancelToken::new();
        token.cancel();
        let count = Arc::new(AtomicUsize::new(0));
        let _guard = token.register(&counting_waker(count.clone()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_registrations_are_removed() {
        let token = CancelToken::new();

        // A long-lived token threaded through many short-lived operations:
        // each registration is dropped when its operation finishes.
        let finished = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            drop(token.register(&counting_waker(finished.clone())));
        }

        let suspended = Arc::new(AtomicUsize::new(0));
        let _guard = token.register(&counting_waker(suspended.clone()));

        token.cancel();
        assert_eq!(
            finished.load(Ordering::SeqCst),
            0,
            "completed operations must not be woken"
        );
        assert_eq!(suspended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refresh_replaces_waker_in_place() {
        let token = CancelToken::new();
        let old = Arc::new(AtomicUsize::new(0));
        let new = Arc::new(AtomicUsize::new(0));

        let mut guard = token.register(&counting_waker(old.clone()));
        guard.refresh(&counting_waker(new.clone()));

        token.cancel();
        assert_eq!(old.load(Ordering::SeqCst), 0);
        assert_eq!(new.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refresh_after_cancel_wakes_immediately() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let mut guard = token.register(&counting_waker(count.clone()));

        token.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        guard.refresh(&counting_waker(count.clone()));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
