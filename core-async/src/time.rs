//! Time-related re-exports.
//!
//! `Instant` is monotonic and is the clock timers are measured against.
//! `sleep` integrates with the resolved runtime's timer wheel and must be
//! polled from a task running on that runtime.

pub use std::time::{Duration, Instant};
pub use tokio::time::{sleep, sleep_until, timeout, Sleep, Timeout};

/// Returns the instant `after` from now, or `None` if it is not representable.
///
/// ```rust
/// use core_async::time::{deadline_after, Duration, Instant};
///
/// let before = Instant::now();
/// let due = deadline_after(Duration::from_millis(10)).unwrap();
/// assert!(due >= before + Duration::from_millis(10));
/// assert!(deadline_after(Duration::MAX).is_none());
/// ```
pub fn deadline_after(after: Duration) -> Option<Instant> {
    Instant::now().checked_add(after)
}
