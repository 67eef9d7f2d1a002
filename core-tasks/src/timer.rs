//! Table of armed deferred-completion timers.
//!
//! Every pending delay owns one entry. An entry leaves the table exactly once:
//! its sleeper fires, its cancellation signal is requested, or the executor
//! drops the sleeper unfired (the task is then faulted). Whichever path
//! removes it under the lock settles the target and releases the sleeper; the
//! others find nothing and do nothing.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use core_async::task::AbortHandle;
use core_async::time::{self, Duration, Instant};
use core_runtime::logging::log_exception;
use tracing::{debug, trace};

use crate::cancel::{CancellationRegistration, CancellationSignal};
use crate::error::TaskError;
use crate::state::{CompletionSource, Task};

/// Identifies one entry of a [`TimerRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

pub(crate) struct TimerEntry {
    due: Option<Instant>,
    target: CompletionSource<()>,
    cancellation: Option<CancellationRegistration>,
    sleeper: Option<AbortHandle>,
}

impl TimerEntry {
    fn new(due: Option<Instant>, target: CompletionSource<()>) -> Self {
        Self {
            due,
            target,
            cancellation: None,
            sleeper: None,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    entries: Mutex<HashMap<TimerId, TimerEntry>>,
}

/// Shared table of pending timers.
///
/// Clones refer to the same table. [`TimerRegistry::global`] is the table the
/// free [`delay`](crate::delay()) functions use; independent tables can be
/// created for isolation.
#[derive(Clone, Default)]
pub struct TimerRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

static GLOBAL: OnceLock<TimerRegistry> = OnceLock::new();

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> &'static TimerRegistry {
        GLOBAL.get_or_init(TimerRegistry::new)
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` while `id` is armed.
    pub fn contains(&self, id: TimerId) -> bool {
        self.entries().contains_key(&id)
    }

    /// Deadline of an armed timer.
    pub fn due(&self, id: TimerId) -> Option<Instant> {
        self.entries().get(&id).and_then(|entry| entry.due)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TimerId, TimerEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, entry: TimerEntry) -> TimerId {
        let id = TimerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().insert(id, entry);
        id
    }

    /// Removes an entry; `None` if it was already removed.
    fn remove(&self, id: TimerId) -> Option<TimerEntry> {
        let mut entries = self.entries();
        entries.remove(&id)
    }

    /// Hands the sleeper back if the entry is already gone.
    fn attach_sleeper(&self, id: TimerId, sleeper: AbortHandle) -> Result<(), AbortHandle> {
        match self.entries().get_mut(&id) {
            Some(entry) => {
                entry.sleeper = Some(sleeper);
                Ok(())
            }
            None => Err(sleeper),
        }
    }

    fn attach_cancellation(
        &self,
        id: TimerId,
        registration: CancellationRegistration,
    ) -> Result<(), CancellationRegistration> {
        match self.entries().get_mut(&id) {
            Some(entry) => {
                entry.cancellation = Some(registration);
                Ok(())
            }
            None => Err(registration),
        }
    }

    /// Fire path: the sleeper elapsed.
    fn fire(&self, id: TimerId) {
        let Some(entry) = self.remove(id) else {
            return;
        };
        // Dropping the registration unregisters the cancel callback.
        drop(entry.cancellation);
        if entry.target.try_complete(()) {
            trace!(timer = %id, "timer fired");
        }
    }

    /// Abandon path: the executor dropped the sleeper before it fired.
    fn abandon(&self, id: TimerId) {
        let Some(entry) = self.remove(id) else {
            return;
        };
        drop(entry.cancellation);
        let err = Arc::new(anyhow::anyhow!(
            "{} was dropped by its executor before it fired",
            id
        ));
        if entry.target.try_fault(vec![TaskError::Failed(Arc::clone(&err))]) {
            log_exception(&err);
        }
    }

    /// Cancel path: the signal was requested before the timer fired.
    fn cancel(&self, id: TimerId) {
        let Some(entry) = self.remove(id) else {
            return;
        };
        if let Some(sleeper) = entry.sleeper {
            sleeper.abort();
        }
        if entry.target.try_cancel() {
            debug!(timer = %id, "timer canceled before due");
        }
        // `entry.cancellation` is the registration currently running; dropping
        // it finds nothing left to unregister.
    }

    /// Arms a timer that completes the returned task after `after`, or
    /// cancels it once `signal` is requested, whichever happens first.
    pub(crate) fn schedule(&self, after: Duration, signal: Option<&CancellationSignal>) -> Task<()> {
        let target = CompletionSource::new();
        let task = target.task();
        let id = self.add(TimerEntry::new(
            time::deadline_after(after),
            target.clone(),
        ));

        let executor = match core_async::runtime::current_or_shared() {
            Ok(handle) => handle,
            Err(err) => {
                self.remove(id);
                let err = anyhow::Error::new(err).context("failed to arm timer");
                log_exception(&err);
                target.try_fault(vec![TaskError::from(err)]);
                return task;
            }
        };

        // Created before spawning so that a runtime shutting down before the
        // first poll still releases the entry.
        let guard = SleeperGuard {
            registry: self.clone(),
            id,
            fired: false,
        };
        let sleeper = executor
            .spawn(async move {
                time::sleep(after).await;
                guard.fire();
            })
            .abort_handle();
        if let Err(sleeper) = self.attach_sleeper(id, sleeper) {
            // The sleeper already fired or was dropped.
            sleeper.abort();
            return task;
        }

        if let Some(signal) = signal {
            let registry = self.clone();
            if let Some(registration) = signal.register(move || registry.cancel(id)) {
                // An entry that already fired no longer needs the callback.
                let _ = self.attach_cancellation(id, registration);
            }
        }

        let delay_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
        debug!(timer = %id, delay_ms, "timer armed");
        task
    }
}

/// Owned by the sleeper future. Fires the entry when the sleep elapses and
/// abandons it if the future is dropped first.
struct SleeperGuard {
    registry: TimerRegistry,
    id: TimerId,
    fired: bool,
}

impl SleeperGuard {
    fn fire(mut self) {
        self.fired = true;
        self.registry.fire(self.id);
    }
}

impl Drop for SleeperGuard {
    fn drop(&mut self) {
        if !self.fired {
            // No-op when a cancel already removed the entry and aborted us.
            self.registry.abandon(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[core_async::test]
    async fn test_fire_removes_entry() {
        let registry = TimerRegistry::new();
        let task = registry.schedule(Duration::from_millis(5), None);
        assert_eq!(registry.len(), 1);
        assert!(!task.is_terminal());

        task.observe().await.unwrap();
        assert!(registry.is_empty());
    }

    #[core_async::test]
    async fn test_cancel_removes_entry() {
        let registry = TimerRegistry::new();
        let signal = CancellationSignal::new();
        let task = registry.schedule(Duration::from_secs(60), Some(&signal));
        assert_eq!(registry.len(), 1);
        assert_eq!(signal.registered_callbacks(), 1);

        signal.cancel();
        assert!(task.is_canceled());
        assert!(registry.is_empty());
    }

    #[core_async::test]
    async fn test_fire_unregisters_cancellation() {
        let registry = TimerRegistry::new();
        let signal = CancellationSignal::new();
        let task = registry.schedule(Duration::from_millis(1), Some(&signal));

        task.observe().await.unwrap();
        assert_eq!(signal.registered_callbacks(), 0);

        // Requesting afterwards must not disturb the completed task.
        signal.cancel();
        assert!(task.is_completed());
    }

    #[core_async::test]
    async fn test_remove_is_idempotent() {
        let registry = TimerRegistry::new();
        let id = registry.add(TimerEntry::new(None, CompletionSource::new()));

        assert!(registry.contains(id));
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        registry.fire(id);
        registry.cancel(id);
        assert!(registry.is_empty());
    }

    #[core_async::test]
    async fn test_due_is_recorded() {
        let registry = TimerRegistry::new();
        let before = Instant::now();
        let signal = CancellationSignal::new();
        let _task = registry.schedule(Duration::from_secs(30), Some(&signal));

        let id = TimerId(0);
        let due = registry.due(id).unwrap();
        assert!(due >= before + Duration::from_secs(30));
        signal.cancel();
        assert!(!registry.contains(id));
    }

    #[test]
    fn test_runtime_shutdown_releases_entry() {
        let registry = TimerRegistry::new();
        let task = core_async::runtime::block_on(async {
            registry.schedule(Duration::from_millis(20), None)
        });

        // The runtime that owned the sleeper is gone.
        assert!(registry.is_empty());
        assert!(task.is_faulted());
        let message = task.errors().unwrap()[0].to_string();
        assert!(message.contains("dropped by its executor"));
    }

    #[test]
    fn test_runtime_shutdown_after_cancel_keeps_cancel() {
        let registry = TimerRegistry::new();
        let signal = CancellationSignal::new();
        let task = core_async::runtime::block_on(async {
            let task = registry.schedule(Duration::from_secs(60), Some(&signal));
            signal.cancel();
            task
        });

        assert!(task.is_canceled());
        assert!(registry.is_empty());
        assert_eq!(signal.registered_callbacks(), 0);
    }

    #[test]
    fn test_fire_and_cancel_race_settles_once() {
        use std::sync::atomic::AtomicUsize;

        let registry = TimerRegistry::new();
        for i in 0..200u64 {
            let signal = CancellationSignal::new();
            let task = registry.schedule(Duration::from_micros(500), Some(&signal));

            let settled = Arc::new(AtomicUsize::new(0));
            let counter = settled.clone();
            task.on_terminal(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

            let remote = signal.clone();
            let canceler = std::thread::spawn(move || {
                // Spread the request around the due time.
                std::thread::sleep(Duration::from_micros(300 + (i % 5) * 100));
                remote.cancel();
            });

            let outcome = task.wait();
            canceler.join().unwrap();

            assert!(outcome.is_ok() || outcome.unwrap_err().is_canceled());
            assert_eq!(settled.load(Ordering::SeqCst), 1);
            assert!(task.is_completed() != task.is_canceled());
            assert!(registry.is_empty());
            assert_eq!(signal.registered_callbacks(), 0);
        }
    }

    #[test]
    fn test_global_is_singleton() {
        assert!(std::ptr::eq(TimerRegistry::global(), TimerRegistry::global()));
    }
}
