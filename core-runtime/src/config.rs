//! # Executor Configuration
//!
//! Configures the shared executor the task combinators fall back to when they
//! are called from outside a Tokio runtime.
//!
//! ## Overview
//!
//! The builder collects thread-pool settings and an optional
//! [`LoggingConfig`], and validates them fail-fast. [`ExecutorConfig::install`]
//! then initializes logging and installs the runtime as the process-wide
//! shared executor. Installation must happen before any work is scheduled,
//! otherwise a default runtime has already been built lazily.
//!
//! ## Usage
//!
//! ```no_run
//! use core_runtime::config::ExecutorConfig;
//!
//! ExecutorConfig::builder()
//!     .worker_threads(4)
//!     .thread_name("combinators")
//!     .build()
//!     .and_then(|config| config.install())
//!     .expect("Failed to install executor");
//! ```
//!
//! ## Error Handling
//!
//! Invalid settings are rejected with an actionable message:
//!
//! ```should_panic
//! use core_runtime::config::ExecutorConfig;
//!
//! ExecutorConfig::builder()
//!     .worker_threads(0)
//!     .build()
//!     .expect("Should fail - zero worker threads");
//! ```

use crate::error::{Error, Result};
use crate::logging::{init_logging, LoggingConfig};

use core_async::runtime::{self, Builder, Runtime};

/// Thread name used when none is configured.
pub const DEFAULT_THREAD_NAME: &str = "core-tasks-worker";

/// Smallest accepted worker stack size.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// Settings for the shared executor.
///
/// `None` leaves the corresponding Tokio default in place.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of async worker threads
    pub worker_threads: Option<usize>,

    /// Upper bound on threads running blocking work submitted through `run`
    pub max_blocking_threads: Option<usize>,

    /// Name given to every executor thread
    pub thread_name: String,

    /// Stack size of executor threads, in bytes
    pub thread_stack_size: Option<usize>,

    /// Logging initialized by [`ExecutorConfig::install`]
    pub logging: Option<LoggingConfig>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            max_blocking_threads: None,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            thread_stack_size: None,
            logging: None,
        }
    }
}

impl ExecutorConfig {
    /// Creates a new builder for constructing an `ExecutorConfig`.
    pub fn builder() -> ExecutorConfigBuilder {
        ExecutorConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == Some(0) {
            return Err(Error::Config(
                "Worker thread count must be greater than 0. \
                 Omit .worker_threads() to use one thread per core."
                    .to_string(),
            ));
        }

        if self.max_blocking_threads == Some(0) {
            return Err(Error::Config(
                "Blocking thread limit must be greater than 0, \
                 otherwise work submitted through run() never starts."
                    .to_string(),
            ));
        }

        if self.thread_name.trim().is_empty() {
            return Err(Error::Config("Thread name cannot be empty".to_string()));
        }

        if let Some(stack) = self.thread_stack_size {
            if stack < MIN_STACK_SIZE {
                return Err(Error::Config(format!(
                    "Thread stack size of {} bytes is below the minimum of {} bytes",
                    stack, MIN_STACK_SIZE
                )));
            }
        }

        Ok(())
    }

    /// Builds a multi-thread runtime from these settings.
    pub fn build_runtime(&self) -> Result<Runtime> {
        let mut builder = Builder::new_multi_thread();
        builder.enable_all().thread_name(self.thread_name.clone());

        if let Some(workers) = self.worker_threads {
            builder.worker_threads(workers);
        }
        if let Some(blocking) = self.max_blocking_threads {
            builder.max_blocking_threads(blocking);
        }
        if let Some(stack) = self.thread_stack_size {
            builder.thread_stack_size(stack);
        }

        Ok(builder.build()?)
    }

    /// Initializes logging (when configured) and installs the runtime as the
    /// shared executor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if logging fails to initialize or a shared
    /// executor already exists, and [`Error::Executor`] if the runtime cannot
    /// be built.
    pub fn install(self) -> Result<()> {
        if runtime::has_shared() {
            return Err(already_installed_error());
        }

        let built = self.build_runtime()?;

        if let Some(logging) = self.logging {
            init_logging(logging)?;
        }

        runtime::install_shared(built).map_err(|rejected| {
            rejected.shutdown_background();
            already_installed_error()
        })?;

        tracing::info!(
            thread_name = %self.thread_name,
            worker_threads = ?self.worker_threads,
            "shared executor installed"
        );
        Ok(())
    }
}

fn already_installed_error() -> Error {
    Error::Config(
        "A shared executor is already initialized. \
         Call ExecutorConfig::install() before scheduling any work outside a runtime."
            .to_string(),
    )
}

/// Builder for [`ExecutorConfig`].
#[derive(Debug, Default)]
pub struct ExecutorConfigBuilder {
    worker_threads: Option<usize>,
    max_blocking_threads: Option<usize>,
    thread_name: Option<String>,
    thread_stack_size: Option<usize>,
    logging: Option<LoggingConfig>,
}

impl ExecutorConfigBuilder {
    /// Sets the number of async worker threads.
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    /// Caps the number of threads used for blocking work.
    pub fn max_blocking_threads(mut self, count: usize) -> Self {
        self.max_blocking_threads = Some(count);
        self
    }

    /// Sets the executor thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Sets the executor thread stack size in bytes.
    pub fn thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = Some(bytes);
        self
    }

    /// Sets the logging configuration applied on install.
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<ExecutorConfig> {
        let config = ExecutorConfig {
            worker_threads: self.worker_threads,
            max_blocking_threads: self.max_blocking_threads,
            thread_name: self
                .thread_name
                .unwrap_or_else(|| DEFAULT_THREAD_NAME.to_string()),
            thread_stack_size: self.thread_stack_size,
            logging: self.logging,
        };

        config.validate()?;

        Ok(config)
    }
}
