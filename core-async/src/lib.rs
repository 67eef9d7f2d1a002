//! Executor seam for the task combinators.
//!
//! The combinator library does not schedule anything itself. Every unit of
//! work, and every sleeper backing a timer, is handed to an executor supplied
//! by the host. This crate resolves that executor:
//!
//! - If the caller is already running inside a Tokio runtime, work goes to that
//!   runtime.
//! - Otherwise a shared multi-thread runtime is used. It is built lazily on
//!   first use, or installed up front with [`runtime::install_shared`].
//!
//! All other crates in the workspace should go through this crate instead of
//! depending on Tokio directly.
//!
//! # Modules
//!
//! - `task`: spawning futures and blocking closures onto the resolved executor
//! - `time`: monotonic clock and sleeping
//! - `runtime`: executor resolution and `block_on`
//!
//! # Examples
//!
//! ```rust
//! use core_async::task;
//! use core_async::time::{sleep, Duration};
//!
//! async fn example() -> std::io::Result<()> {
//!     let handle = task::spawn(async {
//!         sleep(Duration::from_millis(5)).await;
//!         42
//!     })?;
//!     assert_eq!(handle.await.unwrap(), 42);
//!     Ok(())
//! }
//! ```

// Re-export the async entry-point/test macros so downstream crates never need
// direct Tokio dependencies.
pub use core_async_macros::{main, test};

pub mod runtime;
pub mod task;
pub mod time;

pub use task::spawn;
pub use time::{sleep, Duration, Instant};
