//! # Core Runtime Module
//!
//! Ambient infrastructure shared by the task combinators:
//! - Logging and tracing setup, plus the process-wide `LogSink` hook the core
//!   reports unexpected failures to
//! - Executor configuration for the shared runtime
//!
//! ## Overview
//!
//! Nothing in this crate is required for the combinators to be correct. Hosts
//! use it to decide where diagnostics go and how the fallback executor is
//! sized.

pub mod config;
pub mod error;
pub mod logging;

pub use error::{Error, Result};
