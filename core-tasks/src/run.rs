//! Entry points that schedule work and wrap its outcome in a [`Task`].
//!
//! Work is submitted to the executor resolved by
//! [`core_async::runtime::current_or_shared`]: the Tokio runtime the caller is
//! running on, or the shared runtime otherwise. Panics inside the work are
//! contained and fault the task instead of unwinding into the executor.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use core_async::runtime::{self, Handle};
use core_runtime::logging::log_exception;
use futures::FutureExt;
use tracing::trace;

use crate::cancel::CancellationSignal;
use crate::error::TaskError;
use crate::state::{CompletionSource, Task};

/// Producer handed to the executor along with the work.
///
/// If the executor drops the work without running it, for example because
/// its runtime shut down, the task is faulted instead of staying pending.
struct Completion<T> {
    target: CompletionSource<T>,
}

impl<T> Completion<T> {
    fn new(target: &CompletionSource<T>) -> Self {
        Self {
            target: target.clone(),
        }
    }

    /// Settles the task from the outcome of a contained run.
    fn settle<E>(&self, outcome: std::thread::Result<Result<T, E>>)
    where
        E: Into<anyhow::Error>,
    {
        match outcome {
            Ok(Ok(value)) => {
                self.target.try_complete(value);
            }
            Ok(Err(err)) => {
                self.target.try_fault(vec![TaskError::from(err.into())]);
            }
            Err(payload) => {
                self.target
                    .try_fault(vec![TaskError::from_panic(payload.as_ref())]);
            }
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if self.target.task().is_terminal() {
            return;
        }
        let err = Arc::new(anyhow::anyhow!(
            "work was dropped by its executor before it completed"
        ));
        if self.target.try_fault(vec![TaskError::Failed(Arc::clone(&err))]) {
            log_exception(&err);
        }
    }
}

/// Resolves the executor, faulting `target` if there is none.
fn executor_for<T>(target: &CompletionSource<T>) -> Option<Handle> {
    match runtime::current_or_shared() {
        Ok(handle) => Some(handle),
        Err(err) => {
            let err = anyhow::Error::new(err).context("failed to schedule work");
            log_exception(&err);
            target.try_fault(vec![TaskError::from(err)]);
            None
        }
    }
}

/// Runs a blocking closure on the executor's blocking pool.
///
/// The task completes with the returned value, faults with the returned error,
/// or faults with [`TaskError::Panicked`] if the closure panics.
///
/// ```no_run
/// let sum = core_tasks::run(|| Ok::<_, std::io::Error>((1..=10).sum::<u32>()));
/// assert_eq!(sum.wait().unwrap(), 55);
/// ```
pub fn run<T, E, F>(action: F) -> Task<T>
where
    T: Send + Sync + 'static,
    E: Into<anyhow::Error> + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    let target = CompletionSource::new();
    let task = target.task();

    let Some(executor) = executor_for(&target) else {
        return task;
    };

    let worker = Completion::new(&target);
    executor.spawn_blocking(move || {
        worker.settle(panic::catch_unwind(AssertUnwindSafe(action)));
    });
    task
}

/// Runs a future on the executor.
///
/// The future runs on the caller's Tokio runtime when there is one, and on
/// the shared runtime otherwise. A panic while polling it faults the task
/// with [`TaskError::Panicked`]. If the runtime shuts down before the future
/// finishes, the task faults instead of staying pending.
///
/// # Arguments
///
/// * `future` - The computation to run, resolving to `Ok(value)` or an error
///
/// # Returns
///
/// A [`Task`] that settles with the future's outcome.
///
/// # Examples
///
/// ```rust
/// use core_tasks::{run_async, yield_point};
///
/// # async fn example() -> anyhow::Result<()> {
/// let task = run_async(async {
///     yield_point().await;
///     Ok::<_, anyhow::Error>("done")
/// });
/// assert_eq!(task.await?, "done");
/// # Ok(())
/// # }
/// ```
pub fn run_async<T, E, Fut>(future: Fut) -> Task<T>
where
    T: Send + Sync + 'static,
    E: Into<anyhow::Error> + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let target = CompletionSource::new();
    let task = target.task();

    let Some(executor) = executor_for(&target) else {
        return task;
    };

    let worker = Completion::new(&target);
    executor.spawn(async move {
        let outcome = AssertUnwindSafe(future).catch_unwind().await;
        worker.settle(outcome);
    });
    task
}

/// Like [`run`], but the task is canceled without running `action` if
/// `signal` is requested before the action starts.
///
/// Once the action has started it runs to completion; cancellation is never
/// forced on it.
///
/// # Arguments
///
/// * `action` - The blocking computation to run
/// * `signal` - Requesting it before `action` starts cancels the task
///
/// # Returns
///
/// A [`Task`] that is canceled if the signal won, and otherwise settles with
/// the action's outcome as [`run`] does.
///
/// # Examples
///
/// ```no_run
/// use core_tasks::{run_with_cancel, CancellationSignal};
///
/// let signal = CancellationSignal::new();
/// signal.cancel();
///
/// let task = run_with_cancel(|| Ok::<_, anyhow::Error>(1), &signal);
/// assert!(task.wait().unwrap_err().is_canceled());
/// ```
pub fn run_with_cancel<T, E, F>(action: F, signal: &CancellationSignal) -> Task<T>
where
    T: Send + Sync + 'static,
    E: Into<anyhow::Error> + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    if signal.is_requested() {
        return Task::canceled();
    }

    let target = CompletionSource::new();
    let task = target.task();
    let Some(executor) = executor_for(&target) else {
        return task;
    };

    let canceler = target.clone();
    let Some(registration) = signal.register(move || {
        canceler.try_cancel();
    }) else {
        // Requested between the check above and the registration.
        return task;
    };

    let worker = Completion::new(&target);
    let signal = signal.clone();
    executor.spawn_blocking(move || {
        // The signal is held here, so a failed unregister means its callback
        // already ran or is running.
        if !registration.unregister() {
            // Settle the same way the callback does so the guard finds the
            // task terminal.
            worker.target.try_cancel();
            trace!(requested = signal.is_requested(), "work canceled before it started");
            return;
        }
        worker.settle(panic::catch_unwind(AssertUnwindSafe(action)));
    });
    task
}

/// Runs a closure that itself returns a task, and settles as that task does.
pub fn run_flatten<T, F>(function: F) -> Task<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Task<T> + Send + 'static,
{
    run(move || Ok::<_, anyhow::Error>(function())).unwrap_task()
}

/// Runs a future that resolves to a task, and settles as that task does.
pub fn run_async_flatten<T, Fut>(future: Fut) -> Task<T>
where
    T: Clone + Send + Sync + 'static,
    Fut: Future<Output = Task<T>> + Send + 'static,
{
    run_async(async move { Ok::<_, anyhow::Error>(future.await) }).unwrap_task()
}

/// Wraps an available value in a completed task.
pub fn from_result<T>(value: T) -> Task<T> {
    Task::completed(value)
}

/// Gives other work on the executor a chance to run.
///
/// The returned future is pending exactly once, waking itself before it
/// returns, and then ready. It needs no particular executor.
pub fn yield_point() -> YieldPoint {
    YieldPoint { yielded: false }
}

/// Future returned by [`yield_point`].
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct YieldPoint {
    yielded: bool,
}

impl Future for YieldPoint {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
