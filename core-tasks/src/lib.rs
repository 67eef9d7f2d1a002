//! # Core Tasks
//!
//! Composable handles to asynchronous work.
//!
//! ## Overview
//!
//! A [`Task`] is a shared handle to a single-assignment completion state that
//! ends up completed with a value, faulted with an ordered list of errors, or
//! canceled. Tasks come from:
//!
//! - [`run`], [`run_async`] and [`run_with_cancel`], which schedule work on the
//!   executor;
//! - [`delay`] and [`delay_with_cancel`], which complete after a duration;
//! - [`from_result`] and the `Task` constructors, which are already settled;
//! - [`CompletionSource`], for producers that settle a task by hand.
//!
//! [`when_all`] and [`when_any`] derive new tasks from sets of existing ones.
//! Every task is observed the same way: `.await` it, call [`Task::wait`], or
//! register a continuation with [`Task::on_terminal`].
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use core_tasks::{delay, run, when_all, when_any};
//!
//! # fn example() -> anyhow::Result<()> {
//! let parts = (1..=3).map(|i| run(move || Ok::<_, anyhow::Error>(i * 10)));
//! assert_eq!(when_all(parts).wait()?, vec![10, 20, 30]);
//!
//! let slow = delay(Duration::from_secs(5))?;
//! let fast = delay(Duration::from_millis(5))?;
//! let first = when_any([slow, fast.clone()]).wait()?;
//! assert_eq!(first, fast);
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure reporting
//!
//! Failures that have no task to land in, such as a panicking continuation or
//! an executor that cannot arm a timer, are reported through the log sink
//! installed with `core_runtime::logging::set_log_sink`.

pub mod cancel;
pub mod combinators;
pub mod delay;
pub mod error;
pub mod run;
pub mod state;
pub mod timer;

pub use cancel::{CancellationRegistration, CancellationSignal, Cancelled};
pub use combinators::{when_all, when_all_unit, when_any};
pub use delay::{delay, delay_with_cancel, DelayDuration};
pub use error::{normalize_errors, ArgumentError, TaskError, TaskFailure};
pub use run::{
    from_result, run, run_async, run_async_flatten, run_flatten, run_with_cancel, yield_point,
    YieldPoint,
};
pub use state::{CompletionSource, ContinuationHandle, Observe, Task, TaskStatus};
pub use timer::{TimerId, TimerRegistry};
