//! Single-assignment completion state and the handles that share it.
//!
//! A [`Task`] is a cloneable handle to one completion state. The state starts
//! out pending and moves exactly once to completed, faulted or canceled. The
//! move is claimed with a compare-and-set on an atomic tag; the winner stores
//! the outcome, publishes the terminal tag and then runs every continuation
//! registered so far. Losers observe the claim and report `false`.
//!
//! Only a [`CompletionSource`] can drive the transition. Handles can observe
//! it: by polling ([`Task::status`], [`Task::result`]), by awaiting
//! ([`Task::observe`]), by blocking ([`Task::wait`]), or by registering a
//! continuation ([`Task::on_terminal`]).

use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::task::{Context, Poll};

use core_runtime::logging::{log_exception, log_line};
use futures::task::AtomicWaker;

use crate::error::{panic_message, ArgumentError, TaskError, TaskFailure};

const PENDING: u8 = 0;
const TRANSITIONING: u8 = 1;
const COMPLETED: u8 = 2;
const FAULTED: u8 = 3;
const CANCELED: u8 = 4;

/// Observable state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Completed,
    Faulted,
    Canceled,
}

impl TaskStatus {
    /// Returns `true` for every state except [`TaskStatus::Pending`].
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
            TaskStatus::Faulted => "faulted",
            TaskStatus::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

pub(crate) enum Outcome<T> {
    Completed(T),
    Faulted(Vec<TaskError>),
    Canceled,
}

impl<T> Outcome<T> {
    fn tag(&self) -> u8 {
        match self {
            Outcome::Completed(_) => COMPLETED,
            Outcome::Faulted(_) => FAULTED,
            Outcome::Canceled => CANCELED,
        }
    }
}

type Continuation<T> = Box<dyn FnOnce(&Task<T>) + Send>;

struct CompletionState<T> {
    tag: AtomicU8,
    outcome: OnceLock<Outcome<T>>,
    next_continuation: AtomicU64,
    /// `None` once the winning transition drained the list.
    continuations: Mutex<Option<Vec<(u64, Continuation<T>)>>>,
}

impl<T> CompletionState<T> {
    fn continuations(&self) -> MutexGuard<'_, Option<Vec<(u64, Continuation<T>)>>> {
        self.continuations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the eventual outcome of a unit of work.
///
/// Clones share the same state; equality is identity.
pub struct Task<T> {
    inner: Arc<CompletionState<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> PartialEq for Task<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T> Eq for Task<T> {}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<T> Task<T> {
    fn pending() -> Self {
        Self {
            inner: Arc::new(CompletionState {
                tag: AtomicU8::new(PENDING),
                outcome: OnceLock::new(),
                next_continuation: AtomicU64::new(0),
                continuations: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    fn settled(outcome: Outcome<T>) -> Self {
        Self {
            inner: Arc::new(CompletionState {
                tag: AtomicU8::new(outcome.tag()),
                outcome: OnceLock::from(outcome),
                next_continuation: AtomicU64::new(0),
                continuations: Mutex::new(None),
            }),
        }
    }

    /// An already completed task.
    pub fn completed(value: T) -> Self {
        Self::settled(Outcome::Completed(value))
    }

    /// An already canceled task.
    pub fn canceled() -> Self {
        Self::settled(Outcome::Canceled)
    }

    /// An already faulted task carrying `error`.
    pub fn from_error(error: impl Into<TaskError>) -> Self {
        Self::settled(Outcome::Faulted(vec![error.into()]))
    }

    /// An already faulted task carrying `errors`, in order.
    pub fn faulted(errors: Vec<TaskError>) -> Result<Self, ArgumentError> {
        if errors.is_empty() {
            return Err(ArgumentError::EmptyErrorSet);
        }
        Ok(Self::settled(Outcome::Faulted(errors)))
    }

    /// Returns `true` if both handles refer to the same state.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn status(&self) -> TaskStatus {
        match self.inner.tag.load(Ordering::Acquire) {
            COMPLETED => TaskStatus::Completed,
            FAULTED => TaskStatus::Faulted,
            CANCELED => TaskStatus::Canceled,
            _ => TaskStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_completed(&self) -> bool {
        self.status() == TaskStatus::Completed
    }

    pub fn is_faulted(&self) -> bool {
        self.status() == TaskStatus::Faulted
    }

    pub fn is_canceled(&self) -> bool {
        self.status() == TaskStatus::Canceled
    }

    pub(crate) fn outcome(&self) -> Option<&Outcome<T>> {
        match self.inner.tag.load(Ordering::Acquire) {
            PENDING | TRANSITIONING => None,
            _ => self.inner.outcome.get(),
        }
    }

    /// The full ordered fault set, if the task faulted.
    pub fn errors(&self) -> Option<Vec<TaskError>> {
        match self.outcome() {
            Some(Outcome::Faulted(errors)) => Some(errors.clone()),
            _ => None,
        }
    }

    /// Registers `callback` to run once the task is terminal.
    ///
    /// The callback runs inline on the thread performing the winning
    /// transition, or immediately on this thread if the task is already
    /// terminal. A panicking callback is reported to the log sink and does not
    /// affect other callbacks.
    ///
    /// The returned handle can remove the callback again while the task is
    /// still pending; dropping it leaves the callback registered.
    pub fn on_terminal<F>(&self, callback: F) -> ContinuationHandle<T>
    where
        F: FnOnce(&Task<T>) + Send + 'static,
    {
        {
            let mut continuations = self.inner.continuations();
            if let Some(pending) = continuations.as_mut() {
                let id = self.inner.next_continuation.fetch_add(1, Ordering::Relaxed);
                pending.push((id, Box::new(callback)));
                return ContinuationHandle {
                    state: Arc::downgrade(&self.inner),
                    id,
                };
            }
        }
        self.invoke(Box::new(callback));
        ContinuationHandle {
            state: Weak::new(),
            id: 0,
        }
    }

    /// Number of continuations waiting for the task to settle.
    pub(crate) fn pending_continuations(&self) -> usize {
        self.inner.continuations().as_ref().map_or(0, Vec::len)
    }

    fn invoke(&self, continuation: Continuation<T>) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| continuation(self))) {
            log_exception(&anyhow::anyhow!(
                "task continuation panicked: {}",
                panic_message(payload.as_ref())
            ));
        }
    }

    fn transition(&self, outcome: Outcome<T>) -> bool {
        let tag = outcome.tag();
        if self
            .inner
            .tag
            .compare_exchange(PENDING, TRANSITIONING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if self.inner.outcome.set(outcome).is_err() {
            // Unreachable while the tag guards the cell; keep the state usable.
            log_line("completion state already held an outcome while pending");
        }
        self.inner.tag.store(tag, Ordering::Release);

        let drained = self.inner.continuations().take();
        for (_, continuation) in drained.into_iter().flatten() {
            self.invoke(continuation);
        }
        true
    }
}

/// A continuation registered with [`Task::on_terminal`].
pub struct ContinuationHandle<T> {
    state: Weak<CompletionState<T>>,
    id: u64,
}

impl<T> ContinuationHandle<T> {
    /// Removes the continuation.
    ///
    /// Returns `true` if it was still registered and will now never run,
    /// `false` if it already ran or is running.
    pub fn unregister(self) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let removed = {
            let mut continuations = state.continuations();
            continuations.as_mut().and_then(|pending| {
                pending
                    .iter()
                    .position(|(id, _)| *id == self.id)
                    .map(|index| pending.remove(index))
            })
        };
        // The continuation is dropped outside the lock.
        removed.is_some()
    }
}

impl<T> fmt::Debug for ContinuationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationHandle")
            .field("id", &self.id)
            .finish()
    }
}

impl<T: Clone> Task<T> {
    /// The value, if the task completed.
    pub fn value(&self) -> Option<T> {
        match self.outcome() {
            Some(Outcome::Completed(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Non-blocking peek at the observed result; `None` while pending.
    pub fn result(&self) -> Option<Result<T, TaskFailure>> {
        self.outcome().map(|outcome| match outcome {
            Outcome::Completed(value) => Ok(value.clone()),
            Outcome::Faulted(errors) => Err(TaskFailure::Faulted(TaskError::collapse(errors))),
            Outcome::Canceled => Err(TaskFailure::Canceled),
        })
    }

    /// Waits for the task to become terminal.
    ///
    /// Yields the value, the fault (a single error unwrapped, several as an
    /// aggregate), or [`TaskFailure::Canceled`].
    pub fn observe(&self) -> Observe<T> {
        Observe {
            task: self.clone(),
            waker: None,
            continuation: None,
        }
    }

    /// Blocks the current thread until the task is terminal.
    ///
    /// Do not call this from an executor thread that the awaited work needs in
    /// order to make progress.
    pub fn wait(&self) -> Result<T, TaskFailure> {
        futures::executor::block_on(self.observe())
    }
}

impl<T: Clone> IntoFuture for Task<T> {
    type Output = Result<T, TaskFailure>;
    type IntoFuture = Observe<T>;

    fn into_future(self) -> Self::IntoFuture {
        Observe {
            task: self,
            waker: None,
            continuation: None,
        }
    }
}

/// Future returned by [`Task::observe`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Observe<T> {
    task: Task<T>,
    waker: Option<Arc<AtomicWaker>>,
    continuation: Option<ContinuationHandle<T>>,
}

impl<T> Drop for Observe<T> {
    fn drop(&mut self) {
        if let Some(continuation) = self.continuation.take() {
            continuation.unregister();
        }
    }
}

impl<T: Clone> Future for Observe<T> {
    type Output = Result<T, TaskFailure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(result) = this.task.result() {
            return Poll::Ready(result);
        }

        match &this.waker {
            Some(waker) => waker.register(cx.waker()),
            None => {
                let waker = Arc::new(AtomicWaker::new());
                waker.register(cx.waker());
                let notify = Arc::clone(&waker);
                this.continuation = Some(this.task.on_terminal(move |_| notify.wake()));
                this.waker = Some(waker);
            }
        }

        // The transition may have landed between the first check and the
        // registration above.
        match this.task.result() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

/// Producer side of a [`Task`].
///
/// Every clone may race to settle the task; exactly one `try_*` call wins.
pub struct CompletionSource<T> {
    task: Task<T>,
}

impl<T> Clone for CompletionSource<T> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
        }
    }
}

impl<T> fmt::Debug for CompletionSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSource")
            .field("task", &self.task)
            .finish()
    }
}

impl<T> Default for CompletionSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CompletionSource<T> {
    /// Creates a source whose task is pending.
    pub fn new() -> Self {
        Self {
            task: Task::pending(),
        }
    }

    /// A handle to the task this source settles.
    pub fn task(&self) -> Task<T> {
        self.task.clone()
    }

    /// Completes the task with `value`. Returns whether this call won.
    pub fn try_complete(&self, value: T) -> bool {
        self.task.transition(Outcome::Completed(value))
    }

    /// Faults the task with `errors`, in order. Returns whether this call won.
    ///
    /// An empty error list is rejected without touching the task.
    pub fn try_fault(&self, errors: Vec<TaskError>) -> bool {
        if errors.is_empty() {
            log_line("rejected fault transition without errors");
            return false;
        }
        self.task.transition(Outcome::Faulted(errors))
    }

    /// Cancels the task. Returns whether this call won.
    pub fn try_cancel(&self) -> bool {
        self.task.transition(Outcome::Canceled)
    }
}

impl<T: Clone> CompletionSource<T> {
    /// Settles the task the same way `other` settled. `other` must be terminal.
    pub(crate) fn try_mirror(&self, other: &Task<T>) -> bool {
        match other.outcome() {
            Some(Outcome::Completed(value)) => self.try_complete(value.clone()),
            Some(Outcome::Faulted(errors)) => self.try_fault(errors.clone()),
            Some(Outcome::Canceled) => self.try_cancel(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_first_transition_wins() {
        let source = CompletionSource::new();
        let task = source.task();
        assert_eq!(task.status(), TaskStatus::Pending);

        assert!(source.try_complete(5));
        assert!(!source.try_complete(6));
        assert!(!source.try_fault(vec![TaskError::msg("late")]));
        assert!(!source.try_cancel());

        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.value(), Some(5));
    }

    #[test]
    fn test_cancel_then_complete_loses() {
        let source = CompletionSource::<u32>::new();
        assert!(source.try_cancel());
        assert!(!source.try_complete(1));
        assert!(source.task().is_canceled());
        assert!(matches!(source.task().result(), Some(Err(TaskFailure::Canceled))));
    }

    #[test]
    fn test_empty_fault_rejected() {
        let source = CompletionSource::<u32>::new();
        assert!(!source.try_fault(Vec::new()));
        assert_eq!(source.task().status(), TaskStatus::Pending);
        assert!(matches!(
            Task::<u32>::faulted(Vec::new()),
            Err(ArgumentError::EmptyErrorSet)
        ));
    }

    #[test]
    fn test_fault_observation_unwraps_single_error() {
        let single = Task::<u32>::from_error(TaskError::msg("only"));
        match single.result() {
            Some(Err(TaskFailure::Faulted(err))) => {
                assert!(!err.is_aggregate());
                assert_eq!(err.to_string(), "only");
            }
            other => panic!("unexpected {:?}", other),
        }

        let many =
            Task::<u32>::faulted(vec![TaskError::msg("a"), TaskError::msg("b")]).unwrap();
        match many.result() {
            Some(Err(TaskFailure::Faulted(err))) => assert_eq!(err.inner_errors().len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(many.errors().map(|e| e.len()), Some(2));
    }

    #[test]
    fn test_concurrent_transitions_have_one_winner() {
        for _ in 0..50 {
            let source = CompletionSource::<usize>::new();
            let wins = Arc::new(AtomicUsize::new(0));

            let racers: Vec<_> = (0..8)
                .map(|i| {
                    let source = source.clone();
                    let wins = wins.clone();
                    thread::spawn(move || {
                        let won = match i % 3 {
                            0 => source.try_complete(i),
                            1 => source.try_fault(vec![TaskError::msg(i)]),
                            _ => source.try_cancel(),
                        };
                        if won {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();

            for racer in racers {
                racer.join().unwrap();
            }

            assert_eq!(wins.load(Ordering::SeqCst), 1);
            assert!(source.task().is_terminal());
        }
    }

    #[test]
    fn test_continuations_run_once_in_registration_order() {
        let source = CompletionSource::new();
        let task = source.task();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let seen = seen.clone();
            task.on_terminal(move |t| seen.lock().unwrap().push((i, t.value())));
        }
        assert!(seen.lock().unwrap().is_empty());

        source.try_complete("done");
        source.try_complete("again");

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![(0, Some("done")), (1, Some("done")), (2, Some("done"))]);
    }

    #[test]
    fn test_late_registration_runs_inline() {
        let task = Task::completed(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        task.on_terminal(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregistered_continuation_never_runs() {
        let source = CompletionSource::new();
        let task = source.task();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        let handle = task.on_terminal(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(task.pending_continuations(), 1);
        assert!(handle.unregister());
        assert_eq!(task.pending_continuations(), 0);

        source.try_complete(0u8);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unregister_after_run_reports_false() {
        let source = CompletionSource::<u8>::new();
        let handle = source.task().on_terminal(|_| {});
        source.try_cancel();
        assert!(!handle.unregister());

        let late = Task::completed(1).on_terminal(|_| {});
        assert!(!late.unregister());
    }

    #[test]
    fn test_dropped_observe_releases_continuation() {
        let source = CompletionSource::<u8>::new();
        let task = source.task();
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());

        for _ in 0..1_000 {
            let mut observe = task.observe();
            assert!(Pin::new(&mut observe).poll(&mut cx).is_pending());
        }
        assert_eq!(task.pending_continuations(), 0);

        let mut observe = task.observe();
        assert!(Pin::new(&mut observe).poll(&mut cx).is_pending());
        assert_eq!(task.pending_continuations(), 1);
        source.try_complete(4);
        assert!(matches!(Pin::new(&mut observe).poll(&mut cx), Poll::Ready(Ok(4))));
    }

    #[test]
    fn test_panicking_continuation_does_not_block_others() {
        let source = CompletionSource::new();
        let task = source.task();
        let ran = Arc::new(AtomicUsize::new(0));

        task.on_terminal(|_| panic!("continuation failure"));
        let counter = ran.clone();
        task.on_terminal(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(source.try_complete(()));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(task.is_completed());
    }

    #[test]
    fn test_wait_across_threads() {
        let source = CompletionSource::new();
        let task = source.task();

        let producer = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            source.try_complete(String::from("ready"));
        });

        assert_eq!(task.wait().unwrap(), "ready");
        producer.join().unwrap();
    }

    #[test]
    fn test_observe_by_many_waiters() {
        let source = CompletionSource::<u8>::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let task = source.task();
                thread::spawn(move || task.wait())
            })
            .collect();

        thread::sleep(std::time::Duration::from_millis(10));
        source.try_fault(vec![TaskError::msg("shared failure")]);

        for waiter in waiters {
            let failure = waiter.join().unwrap().unwrap_err();
            assert_eq!(failure.to_string(), "shared failure");
        }
    }

    #[test]
    fn test_into_future() {
        let task = Task::completed(3);
        let value = futures::executor::block_on(async { task.clone().await });
        assert_eq!(value.unwrap(), 3);
    }

    #[test]
    fn test_handle_equality_is_identity() {
        let a = Task::completed(1);
        let b = Task::completed(1);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
