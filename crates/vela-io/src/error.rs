use std::io;

use thiserror::Error;

use crate::direction::DirKind;

/// Transport error taxonomy.
///
/// Fatal OS failures carry the error code; expected steady states (peer
/// close, queue liveness) are not represented here — they surface as
/// zero/short reads and boolean results respectively.
#[derive(Debug, Error)]
pub enum IoError {
    /// Connection establishment (connect or accept) ran out of time.
    #[error("connection establishment timed out")]
    ConnectTimeout,

    /// A transfer deadline elapsed; `bytes` were moved before that.
    #[error("transfer timed out after {bytes} bytes")]
    Timeout { bytes: usize },

    /// The calling task was cancelled at a cancellation point or while
    /// suspended.
    #[error("task was cancelled")]
    Cancelled,

    /// Operation on a closed socket. No syscall was attempted.
    #[error("socket is closed")]
    Closed,

    /// A second concurrent operation on the same socket half. Caller bug;
    /// the call is rejected, never queued.
    #[error("{0} half of the socket is already in use")]
    DirectionBusy(DirKind),

    /// The underlying OS call failed outside the transient-retry set.
    #[error(transparent)]
    System(#[from] io::Error),
}

impl IoError {
    /// Whether this error is a deadline expiry of either flavor.
    pub fn is_timeout(&self) -> bool {
        matches!(self, IoError::ConnectTimeout | IoError::Timeout { .. })
    }
}
