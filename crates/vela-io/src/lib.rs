//! vela-io: non-blocking socket transport bound to deadlines and
//! cancellation.
//!
//! A [`Socket`] owns one OS file descriptor through a directionally-split
//! control block: the read half and the write half each carry independent
//! suspension state, and each permits at most one in-flight operation —
//! a second concurrent call on the same half is a caller bug and fails
//! fast with [`IoError::DirectionBusy`] instead of being queued.
//!
//! All suspending operations take an explicit [`Deadline`] and
//! [`CancelToken`]; on expiry or cancellation they fail with a typed error
//! without blocking a worker thread. Peer close is not an error: reads
//! report it as a zero/short count so callers can tell "no more data" from
//! failure.
//!
//! ```ignore
//! let listener = Socket::listen("0.0.0.0:8080".parse()?, 128)?;
//! let peer = listener.accept(Deadline::never(), &cancel).await?;
//! let n = peer.recv_some(&mut buf, Deadline::from_duration(timeout), &cancel).await?;
//! ```

mod addr;
mod direction;
mod error;
mod socket;
mod sys;

pub use direction::DirKind;
pub use error::IoError;
pub use socket::Socket;

// Re-exported so transport callers need only this crate.
pub use vela_rt::{CancelToken, Deadline};
pub use vela_sync::WaitOutcome;

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, IoError>;
