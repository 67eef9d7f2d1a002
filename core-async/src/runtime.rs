//! Executor resolution.
//!
//! Downstream crates never construct Tokio runtimes themselves. They ask this
//! module for a [`Handle`]: the ambient runtime when called from inside one, or
//! the process-wide shared runtime otherwise.

use std::future::Future;
use std::io;
use std::sync::OnceLock;

pub use tokio::runtime::{Builder, Handle, Runtime};

/// Runtime used when the caller is not inside a Tokio runtime.
static SHARED: OnceLock<Runtime> = OnceLock::new();

const SHARED_THREAD_NAME: &str = "core-async-shared";

/// Runs the provided future to completion using a lightweight runtime.
pub fn block_on<F>(future: F) -> F::Output
where
    F: Future,
{
    Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("core_async::runtime::block_on: failed to build Tokio runtime")
        .block_on(future)
}

/// Returns a handle to the executor that should run newly scheduled work.
///
/// Prefers the runtime the caller is currently executing on and falls back to
/// the shared runtime, building it on first use.
///
/// # Errors
///
/// Returns an error if no ambient runtime exists and the shared runtime could
/// not be built (for example when the OS refuses to spawn worker threads).
pub fn current_or_shared() -> io::Result<Handle> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle),
        Err(_) => shared(),
    }
}

/// Returns a handle to the shared runtime, building it with defaults if no
/// runtime was installed yet.
pub fn shared() -> io::Result<Handle> {
    if let Some(runtime) = SHARED.get() {
        return Ok(runtime.handle().clone());
    }

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name(SHARED_THREAD_NAME)
        .build()?;

    // Losing the race keeps the winner; ours is torn down without blocking.
    if let Err(unused) = SHARED.set(runtime) {
        unused.shutdown_background();
    } else {
        tracing::debug!(target: "core_async::runtime", "built shared runtime");
    }

    SHARED
        .get()
        .map(|runtime| runtime.handle().clone())
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "shared runtime unavailable"))
}

/// Installs `runtime` as the shared executor.
///
/// Must be called before anything falls back to the shared runtime. If one is
/// already installed the rejected runtime is handed back to the caller.
pub fn install_shared(runtime: Runtime) -> Result<(), Runtime> {
    SHARED.set(runtime)?;
    tracing::debug!(target: "core_async::runtime", "installed shared runtime");
    Ok(())
}

/// Returns `true` once a shared runtime exists, built lazily or installed.
pub fn has_shared() -> bool {
    SHARED.get().is_some()
}
