use std::cmp::Ordering;
use std::time::{Duration, Instant};

/// An absolute point in time bounding a suspending operation.
///
/// A deadline is either a monotonic instant or [`Deadline::never`], which
/// waits indefinitely. Deadlines are total-ordered: finite deadlines compare
/// by instant, and `never()` is greater than every finite deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never elapses.
    pub const fn never() -> Self {
        Deadline(None)
    }

    /// A deadline at the given instant.
    pub fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    /// A deadline `duration` from now.
    pub fn from_duration(duration: Duration) -> Self {
        Deadline(Some(Instant::now() + duration))
    }

    /// Whether this deadline can ever elapse.
    pub fn is_never(&self) -> bool {
        self.0.is_none()
    }

    /// The underlying instant, or `None` for `never()`.
    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// Whether the deadline has already elapsed.
    pub fn passed(&self) -> bool {
        match self.0 {
            Some(instant) => instant <= Instant::now(),
            None => false,
        }
    }

    /// Time remaining until the deadline, or `None` for `never()`.
    ///
    /// Returns `Some(Duration::ZERO)` for an elapsed deadline.
    pub fn left(&self) -> Option<Duration> {
        self.0.map(|instant| instant.saturating_duration_since(Instant::now()))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0, other.0) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_is_greatest() {
        let soon = Deadline::from_duration(Duration::from_secs(1));
        let later = Deadline::from_duration(Duration::from_secs(3600));
        assert!(soon < later);
        assert!(later < Deadline::never());
        assert_eq!(Deadline::never(), Deadline::never());
    }

    #[test]
    fn never_does_not_pass() {
        assert!(!Deadline::never().passed());
        assert_eq!(Deadline::never().left(), None);
    }

    #[test]
    fn past_instant_has_passed() {
        let deadline = Deadline::at(Instant::now() - Duration::from_millis(1));
        assert!(deadline.passed());
        assert_eq!(deadline.left(), Some(Duration::ZERO));
    }

    #[test]
    fn future_instant_has_not_passed() {
        let deadline = Deadline::from_duration(Duration::from_secs(60));
        assert!(!deadline.passed());
        assert!(deadline.left().unwrap() > Duration::from_secs(59));
    }
}
