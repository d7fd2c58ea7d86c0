use std::sync::{Arc, OnceLock};

/// Trait representing a logger that can log messages at various levels.
///
/// This trait should be implemented by any embedder that wants to receive the
/// bridge's log messages without installing a `log` backend of its own.
///
/// # Examples
///
/// Implementing the `Logger` trait:
///
/// ```rust
/// use guestdb::logger::{Logger, LogLevel};
///
/// struct MyLogger;
///
/// impl Logger for MyLogger {
///     fn log(&self, level: LogLevel, message: String) {
///         println!("[{:?}] {}", level, message);
///     }
/// }
/// ```
pub trait Logger: Sync + Send {
    /// Logs a message at the specified log level.
    ///
    /// # Arguments
    ///
    /// * `level` - The severity level of the log message.
    /// * `message` - The log message to be recorded.
    fn log(&self, level: LogLevel, message: String);
}

/// Enumeration of possible log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Designates very low priority, often extremely detailed messages.
    Trace,
    /// Designates lower priority debugging information.
    Debug,
    /// Designates informational messages that highlight the progress of the application.
    Info,
    /// Designates potentially harmful situations.
    Warn,
    /// Designates error events that might still allow the application to continue running.
    Error,
}

/// A logger that forwards log messages to a user-provided `Logger` implementation.
struct ForwardingLogger;

impl log::Log for ForwardingLogger {
    /// Every record reaches `log`; filtering happens there.
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    /// Forwards a record to the embedder's logger.
    ///
    /// Debug and trace records from dependencies are dropped. Wasmtime and
    /// cranelift emit thousands of them per compilation.
    fn log(&self, record: &log::Record) {
        // Determine if the record originates from this crate.
        let is_record_from_guestdb = record
            .module_path()
            .is_some_and(|module_path| module_path.starts_with("guestdb"));

        // Determine if the record is at debug or trace level.
        let is_debug_or_trace_level =
            record.level() == log::Level::Debug || record.level() == log::Level::Trace;

        // Skip dependency noise; warnings and errors from anywhere still pass.
        if is_debug_or_trace_level && !is_record_from_guestdb {
            return;
        }

        if let Some(logger) = LOGGER_INSTANCE.get() {
            logger.log(log_level(record.level()), format!("{}", record.args()));
        } else {
            eprintln!("guestdb logger not set: {}", record.args());
        }
    }

    /// Flushes any buffered records.
    ///
    /// The embedder's logger receives each record synchronously, so there is
    /// nothing to flush here.
    fn flush(&self) {}
}

/// Converts a `log::Level` to a `LogLevel`.
///
/// # Arguments
///
/// * `level` - The `log` crate level of the record being forwarded.
///
/// # Returns
///
/// The matching `LogLevel` handed to the embedder's logger.
const fn log_level(level: log::Level) -> LogLevel {
    match level {
        log::Level::Error => LogLevel::Error,
        log::Level::Warn => LogLevel::Warn,
        log::Level::Info => LogLevel::Info,
        log::Level::Debug => LogLevel::Debug,
        log::Level::Trace => LogLevel::Trace,
    }
}

/// A global instance of the user-provided logger.
///
/// Set once by [`set_logger`]; records logged before that go to stderr.
static LOGGER_INSTANCE: OnceLock<Arc<dyn Logger>> = OnceLock::new();

/// Sets the global logger.
///
/// # Arguments
///
/// * `logger` - The embedder's logger. Receives every record from this crate
///   and warnings or errors from wasmtime.
///
/// Installs a `log` backend that forwards records to `logger`. Call it once,
/// before any connection is opened.
///
/// # Errors
///
/// Returns a `log::SetLoggerError` if a logger was already set, either by an
/// earlier call or by another `log` backend.
pub fn set_logger(logger: Arc<dyn Logger>) -> Result<(), log::SetLoggerError> {
    static LOGGER: ForwardingLogger = ForwardingLogger;
    log::set_logger(&LOGGER)?;
    log::set_max_level(log::LevelFilter::Trace);
    if LOGGER_INSTANCE.set(logger).is_err() {
        log::warn!("guestdb logger already set");
    }
    Ok(())
}
