//! vela-sync: task-to-task synchronization for the vela concurrency core.
//!
//! Two building blocks live here:
//!
//! - [`Waiter`] — a single-slot, deadline/cancellation-aware suspension
//!   primitive with no-lost-wakeup signaling, reporting exactly one
//!   [`WaitOutcome`] per wait.
//! - [`MpscQueue`] — a bounded, dynamically-resizable multi-producer /
//!   single-consumer queue with backpressure, limit-override pushes, and
//!   reference-counted [`Producer`]/[`Consumer`] handles whose destruction
//!   drives the queue's liveness transitions.

mod mpsc_queue;
mod waiter;

pub use mpsc_queue::{Consumer, MpscQueue, Producer};
pub use waiter::{WaitOutcome, Waiter};
