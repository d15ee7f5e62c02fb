use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use vela_rt::{CancelGuard, CancelToken, Deadline, Timer};

use crate::waiter::{WaitOutcome, Waiter};

/// A bounded multi-producer / single-consumer queue.
///
/// Entries pop in the exact order they were admitted, across all producers.
/// The capacity limit is dynamic: [`set_max_len`](Self::set_max_len) takes
/// effect for every currently and subsequently blocked push. Handle
/// destruction drives the liveness transitions: dropping the last
/// [`Producer`] wakes a blocked pop so it can observe "no more data will
/// ever arrive", and dropping the [`Consumer`] permanently fails all pushes.
///
/// Handles share ownership of the queue, so the backing storage outlives
/// any individual holder; whatever is still buffered when the last owner
/// goes away is dropped exactly once.
///
/// ```ignore
/// let queue = MpscQueue::create();
/// let producer = queue.get_producer();
/// let consumer = queue.get_consumer();
///
/// producer.push(1, Deadline::never(), &cancel).await;
/// assert_eq!(consumer.pop(Deadline::never(), &cancel).await, Some(1));
/// ```
pub struct MpscQueue<T> {
    state: Mutex<State<T>>,
    /// Wakes the single blocked pop; lives outside the lock so producers
    /// can signal after releasing it.
    consumer_waiter: Waiter,
}

struct State<T> {
    buffer: VecDeque<T>,
    max_len: usize,
    producer_handles: usize,
    /// Distinguishes "no producer yet" (data may still arrive) from
    /// "all producers gone" (terminal).
    producer_ever_created: bool,
    consumer_created: bool,
    consumer_alive: bool,
    /// Blocked pushes, FIFO by the order they first blocked. Entries are
    /// removed only by their own future; waking leaves them in place so a
    /// woken push that loses the race keeps its position.
    push_waiters: VecDeque<PushWaiter>,
    next_ticket: u64,
}

struct PushWaiter {
    ticket: u64,
    /// Per-call admission limit for override pushes, `None` for the
    /// queue-wide limit (re-read at every evaluation).
    limit: Option<usize>,
    waker: Option<Waker>,
}

impl<T> State<T> {
    /// Collect wakers of blocked pushes whose admission test passes now,
    /// front to back, accounting for the slots earlier wakes will fill.
    fn admissible_wakers(&mut self) -> Vec<Waker> {
        let mut projected = self.buffer.len();
        let mut wakers = Vec::new();
        for entry in self.push_waiters.iter_mut() {
            let limit = entry.limit.unwrap_or(self.max_len);
            if projected < limit {
                if let Some(waker) = entry.waker.take() {
                    wakers.push(waker);
                }
                projected += 1;
            }
        }
        wakers
    }

    fn take_all_push_wakers(&mut self) -> Vec<Waker> {
        self.push_waiters
            .iter_mut()
            .filter_map(|entry| entry.waker.take())
            .collect()
    }

    fn remove_push_waiter(&mut self, ticket: u64) {
        self.push_waiters.retain(|entry| entry.ticket != ticket);
    }
}

impl<T> MpscQueue<T> {
    /// Create a queue with an effectively unbounded limit.
    pub fn create() -> Arc<Self> {
        Self::create_with_max_len(usize::MAX)
    }

    /// Create a queue admitting at most `max_len` buffered entries.
    pub fn create_with_max_len(max_len: usize) -> Arc<Self> {
        Arc::new(MpscQueue {
            state: Mutex::new(State {
                buffer: VecDeque::new(),
                max_len,
                producer_handles: 0,
                producer_ever_created: false,
                consumer_created: false,
                consumer_alive: true,
                push_waiters: VecDeque::new(),
                next_ticket: 0,
            }),
            consumer_waiter: Waiter::new(),
        })
    }

    /// Obtain a producer handle. Handles are cloneable; each clone counts
    /// towards producer liveness.
    pub fn get_producer(self: &Arc<Self>) -> Producer<T> {
        let mut state = self.lock();
        state.producer_handles += 1;
        state.producer_ever_created = true;
        drop(state);
        Producer {
            queue: self.clone(),
        }
    }

    /// Obtain the consumer handle. The queue is single-consumer: at most
    /// one handle may exist over the queue's lifetime.
    pub fn get_consumer(self: &Arc<Self>) -> Consumer<T> {
        let mut state = self.lock();
        debug_assert!(!state.consumer_created, "queue is single-consumer");
        state.consumer_created = true;
        drop(state);
        Consumer {
            queue: self.clone(),
        }
    }

    /// Replace the capacity limit, waking every blocked push whose
    /// admission test passes under the new limit, in FIFO order.
    pub fn set_max_len(&self, max_len: usize) {
        let wakers = {
            let mut state = self.lock();
            state.max_len = max_len;
            state.admissible_wakers()
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Current capacity limit.
    pub fn max_len(&self) -> usize {
        self.lock().max_len
    }

    /// Number of buffered entries. A racy snapshot, advisory only.
    pub fn size(&self) -> usize {
        self.lock().buffer.len()
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap()
    }
}

// ── Producer ────────────────────────────────────────────────────────

/// A shared-owner producer handle over an [`MpscQueue`].
pub struct Producer<T> {
    queue: Arc<MpscQueue<T>>,
}

impl<T> Producer<T> {
    /// Append `value`, blocking while the queue is at its limit.
    ///
    /// Returns `false` — consuming the value — if the consumer is gone,
    /// the deadline elapses, or the task is cancelled before a slot opens.
    /// The admission test is re-evaluated under the queue lock on every
    /// wake; blocked pushes are honored FIFO.
    pub fn push<'a>(
        &'a self,
        value: T,
        deadline: Deadline,
        cancel: &'a CancelToken,
    ) -> PushFuture<'a, T> {
        self.push_inner(value, None, deadline, cancel)
    }

    /// [`push`](Self::push) with a per-call admission limit in place of the
    /// queue-wide one: the value is admitted once `size() < max_len`, even
    /// while the queue limit is smaller (including zero).
    ///
    /// The bypass is itself bounded: the override limit is checked against
    /// the current size at every wake, never captured at call time.
    pub fn push_with_limit_override<'a>(
        &'a self,
        value: T,
        max_len: usize,
        deadline: Deadline,
        cancel: &'a CancelToken,
    ) -> PushFuture<'a, T> {
        self.push_inner(value, Some(max_len), deadline, cancel)
    }

    /// Non-suspending push: fails if the consumer is gone or the queue is
    /// at its limit.
    pub fn push_noblock(&self, value: T) -> bool {
        let mut state = self.queue.lock();
        if !state.consumer_alive {
            return false;
        }
        if state.buffer.len() >= state.max_len {
            return false;
        }
        state.buffer.push_back(value);
        drop(state);
        self.queue.consumer_waiter.signal();
        true
    }

    fn push_inner<'a>(
        &'a self,
        value: T,
        limit: Option<usize>,
        deadline: Deadline,
        cancel: &'a CancelToken,
    ) -> PushFuture<'a, T> {
        PushFuture {
            queue: &self.queue,
            value: Some(value),
            limit,
            deadline,
            cancel,
            cancel_guard: None,
            timer: None,
            ticket: None,
        }
    }
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        self.queue.lock().producer_handles += 1;
        Producer {
            queue: self.queue.clone(),
        }
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        let last = {
            let mut state = self.queue.lock();
            state.producer_handles -= 1;
            state.producer_handles == 0
        };
        if last {
            // Let a blocked pop observe that no more data will ever arrive.
            self.queue.consumer_waiter.signal();
        }
    }
}

/// Future returned by [`Producer::push`] and
/// [`Producer::push_with_limit_override`]. Resolves to `true` once the
/// value is admitted.
pub struct PushFuture<'a, T> {
    queue: &'a MpscQueue<T>,
    value: Option<T>,
    limit: Option<usize>,
    deadline: Deadline,
    cancel: &'a CancelToken,
    cancel_guard: Option<CancelGuard>,
    timer: Option<Timer>,
    /// Wait-list ticket while blocked; `None` before blocking and after
    /// completion.
    ticket: Option<u64>,
}

// The future stores its fields by value and never projects a pin.
impl<T> Unpin for PushFuture<'_, T> {}

impl<T> Future for PushFuture<'_, T> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let this = self.get_mut();

        let mut state = this.queue.lock();

        if !state.consumer_alive {
            if let Some(ticket) = this.ticket.take() {
                state.remove_push_waiter(ticket);
            }
            return Poll::Ready(false);
        }

        let limit = this.limit.unwrap_or(state.max_len);
        if state.buffer.len() < limit {
            if let Some(ticket) = this.ticket.take() {
                state.remove_push_waiter(ticket);
            }
            state.buffer.push_back(this.value.take().expect("push polled after completion"));
            drop(state);
            this.queue.consumer_waiter.signal();
            return Poll::Ready(true);
        }

        // Cancellation behaves like deadline expiry for queue operations.
        if this.cancel.is_cancelled() || this.deadline.passed() {
            if let Some(ticket) = this.ticket.take() {
                state.remove_push_waiter(ticket);
            }
            return Poll::Ready(false);
        }

        match this.ticket {
            Some(ticket) => {
                // Keep our FIFO position; just refresh the waker.
                if let Some(entry) = state
                    .push_waiters
                    .iter_mut()
                    .find(|entry| entry.ticket == ticket)
                {
                    entry.waker = Some(cx.waker().clone());
                }
            }
            None => {
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                state.push_waiters.push_back(PushWaiter {
                    ticket,
                    limit: this.limit,
                    waker: Some(cx.waker().clone()),
                });
                this.ticket = Some(ticket);
            }
        }
        drop(state);

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
                let mut state = this.queue.lock();
                if let Some(ticket) = this.ticket.take() {
                    state.remove_push_waiter(ticket);
                }
                return Poll::Ready(false);
            }
        }

        Poll::Pending
    }
}

impl<T> Drop for PushFuture<'_, T> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.queue.lock().remove_push_waiter(ticket);
        }
    }
}

// ── Consumer ────────────────────────────────────────────────────────

/// The single consumer handle over an [`MpscQueue`]. Not cloneable.
pub struct Consumer<T> {
    queue: Arc<MpscQueue<T>>,
}

impl<T> Consumer<T> {
    /// Dequeue the next entry, blocking while the queue is empty and
    /// producers may still push.
    ///
    /// `None` means the deadline elapsed, the task was cancelled, or the
    /// queue is drained and the last producer is gone (no more data ever).
    pub async fn pop(&self, deadline: Deadline, cancel: &CancelToken) -> Option<T> {
        loop {
            {
                let mut state = self.queue.lock();
                if let Some(value) = state.buffer.pop_front() {
                    let wakers = state.admissible_wakers();
                    drop(state);
                    for waker in wakers {
                        waker.wake();
                    }
                    return Some(value);
                }
                if state.producer_ever_created && state.producer_handles == 0 {
                    return None;
                }
            }
            // The waiter remembers signals sent between the check above and
            // the suspension here, so a push is never missed.
            match self.queue.consumer_waiter.wait(deadline, cancel).await {
                WaitOutcome::Signaled => continue,
                WaitOutcome::TimedOut | WaitOutcome::Cancelled => return None,
            }
        }
    }

    /// Non-suspending pop: `None` if the queue is currently empty,
    /// regardless of producer liveness.
    pub fn pop_noblock(&self) -> Option<T> {
        let mut state = self.queue.lock();
        let value = state.buffer.pop_front()?;
        let wakers = state.admissible_wakers();
        drop(state);
        for waker in wakers {
            waker.wake();
        }
        Some(value)
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        let wakers = {
            let mut state = self.queue.lock();
            state.consumer_alive = false;
            // Every blocked push must fail now.
            state.take_all_push_wakers()
        };
        for waker in wakers {
            waker.wake();
        }
    }
}
