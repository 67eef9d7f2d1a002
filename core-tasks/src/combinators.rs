//! Aggregation over sets of tasks.
//!
//! [`when_all`] settles once every input is terminal, [`when_any`] once the
//! first one is. Both work purely through continuations: nothing is polled
//! and no executor is needed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::normalize_errors;
use crate::state::{CompletionSource, Outcome, Task};

/// Shared bookkeeping for one `when_all` call.
struct JoinAll<T, R> {
    inputs: Vec<Task<T>>,
    remaining: AtomicUsize,
    target: CompletionSource<R>,
    project: fn(&[Task<T>]) -> R,
}

impl<T, R> JoinAll<T, R> {
    /// Called once per input; the last arrival settles the target.
    fn arrive(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let faults: Vec<&[_]> = self
            .inputs
            .iter()
            .filter_map(|input| match input.outcome() {
                Some(Outcome::Faulted(errors)) => Some(errors.as_slice()),
                _ => None,
            })
            .collect();

        if !faults.is_empty() {
            self.target.try_fault(normalize_errors(faults));
        } else if self.inputs.iter().any(Task::is_canceled) {
            self.target.try_cancel();
        } else {
            self.target.try_complete((self.project)(&self.inputs));
        }
    }
}

fn join<T, R, I>(inputs: I, project: fn(&[Task<T>]) -> R) -> Task<R>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    I: IntoIterator<Item = Task<T>>,
{
    let inputs: Vec<Task<T>> = inputs.into_iter().collect();
    if inputs.is_empty() {
        return Task::completed(project(&[]));
    }

    let join = Arc::new(JoinAll {
        remaining: AtomicUsize::new(inputs.len()),
        inputs,
        target: CompletionSource::new(),
        project,
    });
    let task = join.target.task();

    for input in &join.inputs {
        let join = Arc::clone(&join);
        input.on_terminal(move |_| join.arrive());
    }
    task
}

fn values<T: Clone>(inputs: &[Task<T>]) -> Vec<T> {
    inputs.iter().filter_map(Task::value).collect()
}

fn discard<T>(_: &[Task<T>]) {}

/// Returns a task that completes with every input's value, in input order.
///
/// If any input faulted, the result faults with the errors of every faulted
/// input (see [`normalize_errors`](crate::normalize_errors)). Otherwise, if
/// any input was canceled, the result is canceled. An empty input completes
/// immediately with an empty vector.
pub fn when_all<T, I>(tasks: I) -> Task<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Task<T>>,
{
    join(tasks, values::<T>)
}

/// Like [`when_all`] but discards the values.
pub fn when_all_unit<T, I>(tasks: I) -> Task<()>
where
    T: Send + Sync + 'static,
    I: IntoIterator<Item = Task<T>>,
{
    join(tasks, discard::<T>)
}

/// Returns a task that completes with the first input to become terminal.
///
/// Any terminal state counts, so the winner may itself be faulted or
/// canceled. Inputs that finish later are ignored and no input is ever
/// modified. If several inputs are already terminal, the earliest in input
/// order wins. An empty input never completes.
///
/// Once the result settles, the callbacks left on the losing inputs are
/// removed.
pub fn when_any<T, I>(tasks: I) -> Task<Task<T>>
where
    T: Send + Sync + 'static,
    I: IntoIterator<Item = Task<T>>,
{
    let target = CompletionSource::new();
    let task = target.task();

    let mut continuations = Vec::new();
    for input in tasks {
        let target = target.clone();
        continuations.push(input.on_terminal(move |winner| {
            target.try_complete(winner.clone());
        }));
    }
    if continuations.is_empty() {
        debug!("when_any called without inputs; result stays pending");
        return task;
    }

    // Losers that never settle must not keep the delivery callback alive.
    task.on_terminal(move |_| {
        for continuation in continuations {
            continuation.unregister();
        }
    });
    task
}

impl<T> Task<Task<T>>
where
    T: Clone + Send + Sync + 'static,
{
    /// Flattens a task of a task into one that settles exactly as the inner
    /// task does.
    ///
    /// A fault or cancellation of the outer task is propagated as is.
    pub fn unwrap_task(&self) -> Task<T> {
        let target = CompletionSource::new();
        let task = target.task();

        self.on_terminal(move |outer| match outer.outcome() {
            Some(Outcome::Completed(inner)) => {
                let target = target.clone();
                inner.on_terminal(move |inner| {
                    target.try_mirror(inner);
                });
            }
            Some(Outcome::Faulted(errors)) => {
                target.try_fault(errors.clone());
            }
            _ => {
                target.try_cancel();
            }
        });
        task
    }
}
