//! Tasks that complete after a duration.

use std::sync::OnceLock;

use chrono::TimeDelta;
use core_async::time::Duration;

use crate::cancel::CancellationSignal;
use crate::error::ArgumentError;
use crate::state::Task;
use crate::timer::TimerRegistry;

/// A duration accepted by [`delay`].
///
/// `std::time::Duration` cannot be negative; `chrono::TimeDelta` can, and a
/// negative value is rejected before anything is scheduled.
pub trait DelayDuration {
    fn into_delay(self) -> Result<Duration, ArgumentError>;
}

impl DelayDuration for Duration {
    fn into_delay(self) -> Result<Duration, ArgumentError> {
        Ok(self)
    }
}

impl DelayDuration for TimeDelta {
    fn into_delay(self) -> Result<Duration, ArgumentError> {
        self.to_std()
            .map_err(|_| ArgumentError::NegativeDuration(self))
    }
}

static ELAPSED: OnceLock<Task<()>> = OnceLock::new();

/// The pre-completed task every zero-length delay returns.
fn elapsed() -> Task<()> {
    ELAPSED.get_or_init(|| Task::completed(())).clone()
}

impl TimerRegistry {
    /// Returns a task that completes once `duration` has elapsed.
    ///
    /// If `signal` is requested first the task is canceled and the timer is
    /// released. A signal that is already requested yields a canceled task
    /// without arming anything, and a zero duration yields the same completed
    /// task on every call.
    ///
    /// # Errors
    ///
    /// [`ArgumentError::NegativeDuration`] if `duration` is negative.
    pub fn delay(
        &self,
        duration: impl DelayDuration,
        signal: Option<&CancellationSignal>,
    ) -> Result<Task<()>, ArgumentError> {
        let duration = duration.into_delay()?;

        if signal.is_some_and(CancellationSignal::is_requested) {
            return Ok(Task::canceled());
        }
        if duration.is_zero() {
            return Ok(elapsed());
        }
        Ok(self.schedule(duration, signal))
    }
}

/// Returns a task that completes once `duration` has elapsed.
///
/// ```no_run
/// use std::time::Duration;
///
/// # fn example() -> anyhow::Result<()> {
/// let pause = core_tasks::delay(Duration::from_millis(50))?;
/// pause.wait()?;
/// # Ok(())
/// # }
/// ```
pub fn delay(duration: impl DelayDuration) -> Result<Task<()>, ArgumentError> {
    TimerRegistry::global().delay(duration, None)
}

/// Like [`delay`], but canceled early once `signal` is requested.
pub fn delay_with_cancel(
    duration: impl DelayDuration,
    signal: &CancellationSignal,
) -> Result<Task<()>, ArgumentError> {
    TimerRegistry::global().delay(duration, Some(signal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_async::time::Instant;

    #[test]
    fn test_time_delta_conversion() {
        assert_eq!(
            TimeDelta::milliseconds(250).into_delay().unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(TimeDelta::zero().into_delay().unwrap(), Duration::ZERO);
        assert_eq!(
            TimeDelta::milliseconds(-1).into_delay(),
            Err(ArgumentError::NegativeDuration(TimeDelta::milliseconds(-1)))
        );
    }

    #[test]
    fn test_negative_delay_schedules_nothing() {
        let registry = TimerRegistry::new();
        let result = registry.delay(TimeDelta::seconds(-3), None);
        assert!(matches!(result, Err(ArgumentError::NegativeDuration(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_zero_delay_is_shared() {
        let registry = TimerRegistry::new();
        let first = registry.delay(Duration::ZERO, None).unwrap();
        let second = registry.delay(TimeDelta::zero(), None).unwrap();

        assert!(first.is_completed());
        assert!(first.ptr_eq(&second));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_requested_signal_short_circuits() {
        let registry = TimerRegistry::new();
        let signal = CancellationSignal::new();
        signal.cancel();

        let task = registry
            .delay(Duration::from_secs(10), Some(&signal))
            .unwrap();
        assert!(task.is_canceled());
        assert!(registry.is_empty());

        // Cancellation is checked before the zero-length shortcut.
        let zero = registry.delay(Duration::ZERO, Some(&signal)).unwrap();
        assert!(zero.is_canceled());
    }

    #[core_async::test]
    async fn test_delay_waits_at_least_duration() {
        let registry = TimerRegistry::new();
        let start = Instant::now();
        let task = registry.delay(Duration::from_millis(30), None).unwrap();

        task.observe().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(registry.is_empty());
    }
}
