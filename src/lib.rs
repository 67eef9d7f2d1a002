//! Workspace facade crate.
//!
//! Re-exports the task combinators from `core-tasks` so host applications can
//! depend on a single crate. The `runtime-config` feature (on by default) also
//! exposes the logging and executor configuration from `core-runtime`.

pub use core_tasks::*;

#[cfg(feature = "runtime-config")]
pub use core_runtime::{config, logging};
