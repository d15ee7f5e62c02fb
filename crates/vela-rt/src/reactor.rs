use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

use polling::{Event, Events, Poller};
use slab::Slab;

/// A file descriptor registered with the reactor.
///
/// Readiness is edge-consumed: `react()` sets the ready flag when the OS
/// reports an event, and the next `poll_readable`/`poll_writable` clears it.
struct Source {
    raw_fd: i32,
    key: usize,
    /// Whether poller.add() has been called for this fd yet.
    registered: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    read_ready: bool,
    write_ready: bool,
}

/// Pending timers: ordered map for expiry scanning, reverse map for
/// cancel/poll by id.
struct Timers {
    by_deadline: BTreeMap<(Instant, u64), Waker>,
    deadlines: HashMap<u64, Instant>,
}

/// The global reactor: OS poller, IO sources and the timer heap.
pub(crate) struct Reactor {
    poller: Poller,
    sources: Mutex<Slab<Source>>,
    timers: Mutex<Timers>,
    next_timer_id: AtomicU64,
    events: Mutex<Events>,
}

static REACTOR: OnceLock<Reactor> = OnceLock::new();

pub(crate) fn get() -> &'static Reactor {
    REACTOR.get_or_init(|| Reactor {
        poller: Poller::new().expect("failed to create OS poller"),
        sources: Mutex::new(Slab::new()),
        timers: Mutex::new(Timers {
            by_deadline: BTreeMap::new(),
            deadlines: HashMap::new(),
        }),
        next_timer_id: AtomicU64::new(0),
        events: Mutex::new(Events::new()),
    })
}

impl Reactor {
    // ── IO sources ──────────────────────────────────────────────────

    /// Register a file descriptor. Returns an opaque handle.
    ///
    /// The fd is added to the OS poller lazily, on the first readiness poll.
    pub(crate) fn io_register(&self, fd: i32) -> u64 {
        let mut sources = self.sources.lock().unwrap();
        let entry = sources.vacant_entry();
        let key = entry.key();
        entry.insert(Source {
            raw_fd: fd,
            key,
            registered: false,
            read_waker: None,
            write_waker: None,
            read_ready: false,
            write_ready: false,
        });
        key as u64
    }

    /// Remove an IO source, deleting it from the OS poller if registered.
    ///
    /// Must run before the fd itself is closed.
    pub(crate) fn io_deregister(&self, handle: u64) {
        let mut sources = self.sources.lock().unwrap();
        let key = handle as usize;
        if sources.contains(key) {
            let source = sources.remove(key);
            if source.registered {
                let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(source.raw_fd) };
                let _ = self.poller.delete(&borrowed);
            }
        }
    }

    /// Poll read readiness: consume a pending ready flag, or park the waker.
    pub(crate) fn io_poll_readable(&self, handle: u64, waker: Waker) -> Poll<()> {
        let mut sources = self.sources.lock().unwrap();
        let source = &mut sources[handle as usize];

        if source.read_ready {
            source.read_ready = false;
            return Poll::Ready(());
        }

        source.read_waker = Some(waker);
        self.update_interest(source);
        Poll::Pending
    }

    /// Poll write readiness: consume a pending ready flag, or park the waker.
    pub(crate) fn io_poll_writable(&self, handle: u64, waker: Waker) -> Poll<()> {
        let mut sources = self.sources.lock().unwrap();
        let source = &mut sources[handle as usize];

        if source.write_ready {
            source.write_ready = false;
            return Poll::Ready(());
        }

        source.write_waker = Some(waker);
        self.update_interest(source);
        Poll::Pending
    }

    /// Bring the OS poller's interest set in line with the parked wakers.
    fn update_interest(&self, source: &mut Source) {
        let interest = Event::new(
            source.key,
            source.read_waker.is_some(),
            source.write_waker.is_some(),
        );

        if source.registered {
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(source.raw_fd) };
            // modify() re-arms oneshot interest after each delivery.
            let _ = self.poller.modify(&borrowed, interest);
        } else {
            // add() is unsafe: the contract is io_deregister before fd close.
            unsafe {
                let _ = self.poller.add(source.raw_fd, interest);
            }
            source.registered = true;
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Arm a one-shot timer expiring at `deadline`. Returns its id.
    ///
    /// The waker is attached on the first `timer_poll`, not here.
    pub(crate) fn timer_create(&self, deadline: Instant) -> u64 {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.timers.lock().unwrap();
        timers.deadlines.insert(id, deadline);
        id
    }

    /// Cancel a pending timer; a parked waker is dropped, not woken.
    pub(crate) fn timer_cancel(&self, id: u64) {
        let mut timers = self.timers.lock().unwrap();
        if let Some(deadline) = timers.deadlines.remove(&id) {
            timers.by_deadline.remove(&(deadline, id));
        }
    }

    /// Poll a timer: Ready once the deadline has passed or the id is gone.
    pub(crate) fn timer_poll(&self, id: u64, waker: Waker) -> Poll<()> {
        let mut timers = self.timers.lock().unwrap();
        let deadline = match timers.deadlines.get(&id) {
            Some(&deadline) => deadline,
            None => return Poll::Ready(()), // already fired or cancelled
        };

        if Instant::now() >= deadline {
            timers.deadlines.remove(&id);
            timers.by_deadline.remove(&(deadline, id));
            return Poll::Ready(());
        }

        timers.by_deadline.insert((deadline, id), waker);
        Poll::Pending
    }

    // ── Event loop step ─────────────────────────────────────────────

    /// One reactor step: fire expired timers, poll the OS for IO events
    /// (waiting at most `timeout`, clamped by the next timer deadline),
    /// and wake everything that became ready.
    pub(crate) fn react(&self, timeout: Option<Duration>) -> io::Result<()> {
        let mut wakers = Vec::new();

        let until_next_timer = {
            let now = Instant::now();
            let mut timers = self.timers.lock().unwrap();
            loop {
                match timers.by_deadline.keys().next().copied() {
                    Some((deadline, id)) if deadline <= now => {
                        let waker = timers.by_deadline.remove(&(deadline, id)).unwrap();
                        timers.deadlines.remove(&id);
                        wakers.push(waker);
                    }
                    Some((deadline, _)) => break Some(deadline.duration_since(now)),
                    None => break None,
                }
            }
        };

        let effective_timeout = match (timeout, until_next_timer) {
            (None, None) => None,
            (Some(t), None) | (None, Some(t)) => Some(t),
            (Some(a), Some(b)) => Some(a.min(b)),
        };

        let fired: Vec<(usize, bool, bool)> = {
            let mut events = self.events.lock().unwrap();
            events.clear();
            self.poller.wait(&mut events, effective_timeout)?;
            events
                .iter()
                .map(|ev| (ev.key, ev.readable, ev.writable))
                .collect()
        };

        {
            let mut sources = self.sources.lock().unwrap();
            for (key, readable, writable) in fired {
                if let Some(source) = sources.get_mut(key) {
                    if readable {
                        source.read_ready = true;
                        if let Some(waker) = source.read_waker.take() {
                            wakers.push(waker);
                        }
                    }
                    if writable {
                        source.write_ready = true;
                        if let Some(waker) = source.write_waker.take() {
                            wakers.push(waker);
                        }
                    }
                }
            }
        }

        // Wake outside the locks — waking re-enters the executor queue.
        for waker in wakers {
            waker.wake();
        }

        Ok(())
    }
}
