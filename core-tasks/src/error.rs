//! Error types carried by task handles.
//!
//! Three kinds of failure exist:
//!
//! - [`ArgumentError`] is returned synchronously when a call is malformed. It is
//!   never stored in a handle.
//! - [`TaskError`] is what contained work failed with. A faulted handle stores
//!   an ordered, non-empty list of them.
//! - [`TaskFailure`] is what observing a handle yields when it did not
//!   complete: either the fault or the fact that it was canceled.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::TimeDelta;
use thiserror::Error;

/// Malformed input rejected at the call boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("delay must not be negative, got {0}")]
    NegativeDuration(TimeDelta),

    #[error("a faulted task needs at least one error")]
    EmptyErrorSet,
}

/// An error raised by contained work.
///
/// Cloning is cheap: the underlying error is shared between every observer of
/// the handle that carries it.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The work returned an error.
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),

    /// The work panicked; the payload message is kept.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Several errors, in the order their sources were supplied.
    #[error("{} errors occurred", .0.len())]
    Aggregate(Vec<TaskError>),
}

impl TaskError {
    /// Builds a [`TaskError::Failed`] from a displayable message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        TaskError::Failed(Arc::new(anyhow::Error::msg(message)))
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        TaskError::Panicked(panic_message(payload))
    }

    /// Collapses a fault set for observation: a single error is exposed
    /// directly, several as an ordered [`TaskError::Aggregate`].
    pub(crate) fn collapse(errors: &[TaskError]) -> Self {
        match errors {
            [single] => single.clone(),
            many => TaskError::Aggregate(many.to_vec()),
        }
    }

    /// Returns `true` for [`TaskError::Aggregate`].
    pub fn is_aggregate(&self) -> bool {
        matches!(self, TaskError::Aggregate(_))
    }

    /// The errors grouped by an aggregate, or just this error otherwise.
    pub fn inner_errors(&self) -> &[TaskError] {
        match self {
            TaskError::Aggregate(errors) => errors,
            other => std::slice::from_ref(other),
        }
    }

    /// Attempts to view a [`TaskError::Failed`] as a concrete error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        match self {
            TaskError::Failed(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Failed(Arc::new(err))
    }
}

/// Why observing a handle did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum TaskFailure {
    #[error(transparent)]
    Faulted(#[from] TaskError),

    #[error("task was canceled")]
    Canceled,
}

impl TaskFailure {
    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskFailure::Canceled)
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, TaskFailure::Faulted(_))
    }

    /// The fault, if the handle faulted.
    pub fn fault(&self) -> Option<&TaskError> {
        match self {
            TaskFailure::Faulted(err) => Some(err),
            TaskFailure::Canceled => None,
        }
    }
}

/// Flattens the fault sets of several faulted sources into one ordered list.
///
/// Each group contributes its only error when it holds exactly one, or a
/// single [`TaskError::Aggregate`] of all of them otherwise. Empty groups
/// contribute nothing. Source order is preserved.
pub fn normalize_errors<'a, I>(groups: I) -> Vec<TaskError>
where
    I: IntoIterator<Item = &'a [TaskError]>,
{
    groups
        .into_iter()
        .filter(|group| !group.is_empty())
        .map(TaskError::collapse)
        .collect()
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
