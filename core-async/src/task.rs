//! Task spawning onto the resolved executor.
//!
//! Both entry points resolve the executor through
//! [`runtime::current_or_shared`](crate::runtime::current_or_shared), so they
//! work from async code running on Tokio as well as from plain threads.
//!
//! # Examples
//!
//! ```rust
//! use core_async::task;
//!
//! fn example() -> std::io::Result<()> {
//!     let handle = task::spawn_blocking(|| 6 * 7)?;
//!     let value = core_async::runtime::block_on(handle).unwrap();
//!     assert_eq!(value, 42);
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::io;

use crate::runtime;

pub use tokio::task::{yield_now, AbortHandle, JoinError, JoinHandle};

/// Spawns a future onto the resolved executor.
///
/// Inside a Tokio runtime the future runs on that runtime; elsewhere it runs
/// on the shared runtime, which is built on first use. The task may run on a
/// different thread than the caller.
///
/// # Arguments
///
/// * `future` - The async computation to run
///
/// # Returns
///
/// A `JoinHandle` that can be awaited for the future's output. Dropping it
/// detaches the task.
///
/// # Errors
///
/// Fails only when there is no ambient runtime and the shared runtime cannot
/// be built.
///
/// # Examples
///
/// ```rust
/// use core_async::task::spawn;
///
/// # async fn example() -> std::io::Result<()> {
/// let handle = spawn(async { 40 + 2 })?;
/// assert_eq!(handle.await.unwrap(), 42);
/// # Ok(())
/// # }
/// ```
pub fn spawn<F>(future: F) -> io::Result<JoinHandle<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Ok(runtime::current_or_shared()?.spawn(future))
}

/// Runs a blocking closure on the resolved executor's blocking pool.
///
/// # Arguments
///
/// * `f` - The blocking computation to run
///
/// # Returns
///
/// A `JoinHandle` resolving to the closure's return value.
///
/// # Errors
///
/// Same conditions as [`spawn`].
pub fn spawn_blocking<F, R>(f: F) -> io::Result<JoinHandle<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    Ok(runtime::current_or_shared()?.spawn_blocking(f))
}

/// Result type for task operations.
pub type Result<T> = std::result::Result<T, JoinError>;
