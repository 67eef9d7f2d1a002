//! # Logging & Tracing Infrastructure
//!
//! Provides structured logging with the `tracing` crate, supporting:
//! - JSON, pretty-print and compact output formats
//! - Module-level filtering
//! - A process-wide [`LogSink`] hook that receives unexpected failures from
//!   the task combinators
//! - Mirroring of ordinary `tracing` events into that sink
//!
//! ## Overview
//!
//! The combinators never need a sink to be correct. When a continuation or a
//! cancellation callback panics, or an internal transition is rejected, the
//! core calls [`log_line`] or [`log_exception`]. Both always emit a `tracing`
//! event and additionally forward to the installed sink, if any.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, ConsoleSink, LogFormat, LogLevel, LoggingConfig};
//! use std::sync::Arc;
//!
//! let config = LoggingConfig::default()
//!     .with_format(LogFormat::Pretty)
//!     .with_level(LogLevel::Debug)
//!     .with_log_sink(Arc::new(ConsoleSink::default()));
//!
//! init_logging(config).expect("Failed to initialize logging");
//! tracing::info!("Application started");
//! ```

use crate::error::{Error, Result};

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::{
    filter::EnvFilter,
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    Layer,
};

/// Target used for events emitted by [`log_line`] and [`log_exception`].
///
/// The sink-mirroring layer skips this target because those events were already
/// delivered to the sink directly.
pub const SINK_TARGET: &str = "core_runtime::sink";

/// Severity of a log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_filter_str().to_uppercase())
    }
}

/// Destination for diagnostics the task combinators cannot surface through a
/// handle.
///
/// Implementations must not block for long: the core calls them inline on
/// whichever thread observed the failure.
pub trait LogSink: Send + Sync {
    /// Write a single line of diagnostic text.
    fn write_line(&self, message: &str);

    /// Write an error, including its chain of causes.
    fn write_exception(&self, error: &anyhow::Error);

    /// Minimum level of mirrored `tracing` events this sink wants.
    fn min_level(&self) -> LogLevel {
        LogLevel::Info
    }
}

/// Sink writing timestamped lines to stderr.
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    pub min_level: LogLevel,
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
        }
    }
}

impl ConsoleSink {
    fn timestamp() -> String {
        chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string()
    }
}

impl LogSink for ConsoleSink {
    fn write_line(&self, message: &str) {
        eprintln!("[{}] {}", Self::timestamp(), message);
    }

    fn write_exception(&self, error: &anyhow::Error) {
        eprintln!("[{}] ERROR {:#}", Self::timestamp(), error);
    }

    fn min_level(&self) -> LogLevel {
        self.min_level
    }
}

type SinkSlot = Mutex<Option<Arc<dyn LogSink>>>;

static LOG_SINK: OnceLock<SinkSlot> = OnceLock::new();

fn sink_slot() -> &'static SinkSlot {
    LOG_SINK.get_or_init(|| Mutex::new(None))
}

/// Installs `sink` as the process-wide sink, returning the previous one.
pub fn set_log_sink(sink: Arc<dyn LogSink>) -> Option<Arc<dyn LogSink>> {
    sink_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(sink)
}

/// Removes the process-wide sink, returning it.
pub fn clear_log_sink() -> Option<Arc<dyn LogSink>> {
    sink_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
}

/// Returns the currently installed sink.
pub fn current_log_sink() -> Option<Arc<dyn LogSink>> {
    sink_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Reports a diagnostic line.
pub fn log_line(message: impl AsRef<str>) {
    let message = message.as_ref();
    tracing::warn!(target: SINK_TARGET, "{}", message);

    // The lock is released before calling out so a sink may log re-entrantly.
    if let Some(sink) = current_log_sink() {
        sink.write_line(message);
    }
}

/// Reports an unexpected error.
pub fn log_exception(error: &anyhow::Error) {
    let rendered = format!("{:#}", error);
    tracing::error!(target: SINK_TARGET, error = %rendered, "unexpected failure");

    if let Some(sink) = current_log_sink() {
        sink.write_exception(error);
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format with colors
    Pretty,
    /// Structured JSON format for machine parsing
    Json,
    /// Compact format for production
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        #[cfg(debug_assertions)]
        return Self::Pretty;

        #[cfg(not(debug_assertions))]
        return Self::Json;
    }
}

/// Logging configuration
#[derive(Clone)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
    /// Minimum log level
    pub level: LogLevel,
    /// Custom filter string (e.g., "core_tasks=debug,core_async=trace")
    pub filter: Option<String>,
    /// Sink installed process-wide and fed with mirrored events
    pub log_sink: Option<Arc<dyn LogSink>>,
    /// Enable span contexts
    pub enable_spans: bool,
    /// Display target module in logs
    pub display_target: bool,
    /// Display thread info
    pub display_thread_info: bool,
}

impl fmt::Debug for LoggingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingConfig")
            .field("format", &self.format)
            .field("level", &self.level)
            .field("filter", &self.filter)
            .field("log_sink", &self.log_sink.as_ref().map(|_| "LogSink { ... }"))
            .field("enable_spans", &self.enable_spans)
            .field("display_target", &self.display_target)
            .field("display_thread_info", &self.display_thread_info)
            .finish()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogLevel::Info,
            filter: None,
            log_sink: None,
            enable_spans: true,
            display_target: true,
            display_thread_info: false,
        }
    }
}

impl LoggingConfig {
    /// Set log format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set minimum log level
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Set custom filter string
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Set the sink for unexpected failures and mirrored events
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Enable or disable span contexts
    pub fn with_spans(mut self, enable: bool) -> Self {
        self.enable_spans = enable;
        self
    }

    /// Enable or disable target display
    pub fn with_target(mut self, display: bool) -> Self {
        self.display_target = display;
        self
    }

    /// Enable or disable thread info
    pub fn with_thread_info(mut self, display: bool) -> Self {
        self.display_thread_info = display;
        self
    }
}

/// Initialize the logging system
///
/// Installs the configured sink process-wide, then builds the global
/// `tracing` subscriber. Call once during startup.
///
/// # Errors
///
/// Returns [`Error::Config`] if the filter string is invalid or a global
/// subscriber is already set.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = build_filter(&config)?;

    if let Some(sink) = config.log_sink.clone() {
        set_log_sink(sink);
    }

    match config.format {
        LogFormat::Pretty => init_pretty_logging(config, filter),
        LogFormat::Json => init_json_logging(config, filter),
        LogFormat::Compact => init_compact_logging(config, filter),
    }
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let filter_string = if let Some(custom_filter) = &config.filter {
        custom_filter.clone()
    } else {
        // Workspace crates at the configured level, everything else at warn
        let base_level = config.level.as_filter_str();
        format!(
            "warn,core_tasks={0},core_async={0},core_runtime={0},tasks_workspace={0}",
            base_level
        )
    };

    EnvFilter::try_new(filter_string)
        .map_err(|e| Error::Config(format!("Invalid log filter: {}", e)))
}

fn init_error(e: impl fmt::Display) -> Error {
    Error::Config(format!("Failed to initialize logging: {}", e))
}

fn init_pretty_logging(config: LoggingConfig, filter: EnvFilter) -> Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(config.display_target)
        .with_thread_ids(config.display_thread_info)
        .with_thread_names(config.display_thread_info)
        .with_span_events(if config.enable_spans {
            tracing_subscriber::fmt::format::FmtSpan::ACTIVE
        } else {
            tracing_subscriber::fmt::format::FmtSpan::NONE
        })
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(LogSinkLayer::new(config.log_sink))
        .try_init()
        .map_err(init_error)
}

fn init_json_logging(config: LoggingConfig, filter: EnvFilter) -> Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(config.enable_spans)
        .with_span_list(config.enable_spans)
        .with_target(config.display_target)
        .with_thread_ids(config.display_thread_info)
        .with_thread_names(config.display_thread_info)
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(LogSinkLayer::new(config.log_sink))
        .try_init()
        .map_err(init_error)
}

fn init_compact_logging(config: LoggingConfig, filter: EnvFilter) -> Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(config.display_target)
        .with_thread_ids(config.display_thread_info)
        .with_thread_names(config.display_thread_info)
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(LogSinkLayer::new(config.log_sink))
        .try_init()
        .map_err(init_error)
}

/// Layer that mirrors events into a [`LogSink`].
struct LogSinkLayer {
    sink: Option<Arc<dyn LogSink>>,
}

impl LogSinkLayer {
    fn new(sink: Option<Arc<dyn LogSink>>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for LogSinkLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(sink) = self.sink.as_ref() else {
            return;
        };

        let metadata = event.metadata();
        if metadata.target() == SINK_TARGET {
            return;
        }

        let level = tracing_level_to_log_level(*metadata.level());
        if level < sink.min_level() {
            return;
        }

        let mut visitor = SinkVisitor::default();
        event.record(&mut visitor);

        let message = visitor
            .message
            .unwrap_or_else(|| metadata.name().to_string());

        let mut line = format!("{} {}: {}", level, metadata.target(), message);
        for (key, value) in &visitor.fields {
            line.push_str(&format!(" {}={}", key, value));
        }
        if let Some(span) = ctx.lookup_current() {
            line.push_str(&format!(" span={}", span.name()));
        }

        sink.write_line(&line);
    }
}

#[derive(Default)]
struct SinkVisitor {
    message: Option<String>,
    fields: BTreeMap<String, String>,
}

impl SinkVisitor {
    fn record_value(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for SinkVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record_value(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_value(field, format!("{:?}", value));
    }
}

fn tracing_level_to_log_level(level: tracing::Level) -> LogLevel {
    match level {
        tracing::Level::TRACE => LogLevel::Trace,
        tracing::Level::DEBUG => LogLevel::Debug,
        tracing::Level::INFO => LogLevel::Info,
        tracing::Level::WARN => LogLevel::Warn,
        tracing::Level::ERROR => LogLevel::Error,
    }
}
