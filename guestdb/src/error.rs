//! Error types for the guest bridge.
//!
//! Failures reported by the guest engine carry `SQLite`'s primary and
//! extended result codes ([`SqliteError`]). Faults detected on the host side,
//! before or around a guest call, are the remaining [`Error`] variants.

use std::fmt;
use std::panic::Location;

use thiserror::Error;

/// Primary result code (the low byte of a guest result code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u8);

impl ErrorCode {
    /// Generic error.
    pub const ERROR: Self = Self(1);
    /// A `malloc` inside the guest failed.
    pub const NOMEM: Self = Self(7);
    /// Unable to open the database file.
    pub const CANTOPEN: Self = Self(14);
    /// Abort due to constraint violation.
    pub const CONSTRAINT: Self = Self(19);
    /// Library used incorrectly.
    pub const MISUSE: Self = Self(21);
    /// Parameter index out of range.
    pub const RANGE: Self = Self(25);

    /// Symbolic name of the code, when the host knows it.
    #[must_use]
    pub const fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            1 => "ERROR",
            2 => "INTERNAL",
            3 => "PERM",
            4 => "ABORT",
            5 => "BUSY",
            6 => "LOCKED",
            7 => "NOMEM",
            8 => "READONLY",
            9 => "INTERRUPT",
            10 => "IOERR",
            11 => "CORRUPT",
            12 => "NOTFOUND",
            13 => "FULL",
            14 => "CANTOPEN",
            15 => "PROTOCOL",
            16 => "EMPTY",
            17 => "SCHEMA",
            18 => "TOOBIG",
            19 => "CONSTRAINT",
            20 => "MISMATCH",
            21 => "MISUSE",
            22 => "NOLFS",
            23 => "AUTH",
            24 => "FORMAT",
            25 => "RANGE",
            26 => "NOTADB",
            27 => "NOTICE",
            28 => "WARNING",
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extended result code: the primary code refined with additional detail in
/// the high byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtendedErrorCode(pub u16);

impl ExtendedErrorCode {
    /// The primary code this extended code refines.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn primary(self) -> ErrorCode {
        ErrorCode(self.0 as u8)
    }
}

impl fmt::Display for ExtendedErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure reported by the guest engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteError {
    /// Primary result code.
    pub code: ErrorCode,
    /// Extended result code.
    pub extended: ExtendedErrorCode,
    name: Option<String>,
    message: Option<String>,
}

impl SqliteError {
    /// Creates an error from a raw guest result code, with neither a symbolic
    /// name nor a message.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub const fn new(rc: i32) -> Self {
        Self {
            code: ErrorCode((rc & 0xff) as u8),
            extended: ExtendedErrorCode((rc & 0xffff) as u16),
            name: None,
            message: None,
        }
    }

    /// Translates a guest result code, naming it when the code is known.
    pub(crate) fn translate(rc: i32, message: Option<String>) -> Self {
        let err = Self::new(rc);
        Self {
            name: err.code.name().map(str::to_string),
            message: message.filter(|m| !m.is_empty()),
            ..err
        }
    }

    /// Sets the symbolic name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the descriptive message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Symbolic name of the primary code, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Message supplied by the guest, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for SqliteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sqlite3: ")?;
        match &self.name {
            Some(name) => f.write_str(name)?,
            None => write!(f, "{}", self.code)?,
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SqliteError {}

/// Errors returned by the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The guest engine reported a failure.
    #[error(transparent)]
    Sqlite(#[from] SqliteError),

    /// A closed or unknown statement handle was used.
    #[error("sqlite3: invalid memory address or null pointer dereference")]
    NilHandle,

    /// The guest allocator could not satisfy a request.
    #[error("sqlite3: out of memory")]
    OutOfMemory,

    /// A parameter or column index does not fit the guest ABI.
    #[error("sqlite3: index out of range")]
    Range,

    /// A string in guest memory is not NUL-terminated.
    #[error("sqlite3: missing NUL terminator")]
    NoNul,

    /// The guest does not export a required global.
    #[error("sqlite3: could not find global: {0}")]
    NoGlobal(String),

    /// The guest does not export a required function, or exports it with the
    /// wrong signature.
    #[error("sqlite3: could not find function: {0}")]
    NoFunc(String),

    /// The guest does not export its linear memory.
    #[error("sqlite3: could not find memory: {0}")]
    NoMemory(String),

    /// An internal invariant did not hold.
    #[error("sqlite3: assertion failed ({location})")]
    Assertion {
        /// Source location of the failed check.
        location: String,
    },

    /// The call was cancelled through the connection's cancel token.
    #[error("sqlite3: call interrupted")]
    Interrupted,

    /// An earlier call was interrupted or trapped; the instance is unusable.
    #[error("sqlite3: connection abandoned after a failed call")]
    Abandoned,

    /// The guest trapped.
    #[error("sqlite3: guest trap: {0}")]
    Trap(String),

    /// The guest binary could not be compiled.
    #[error("sqlite3: compile: {0}")]
    Compile(String),

    /// The guest could not be linked or instantiated.
    #[error("sqlite3: instantiate: {0}")]
    Instantiate(String),

    /// The guest binary could not be read.
    #[error("sqlite3: reading guest binary: {0}")]
    Io(String),

    /// Neither an in-memory binary nor a path was configured.
    #[error("sqlite3: no guest binary configured")]
    NoBinary,

    /// The runtime configuration could not be parsed.
    #[error("sqlite3: invalid config: {0}")]
    Config(String),

    /// A text value is not valid UTF-8.
    #[error("sqlite3: invalid UTF-8 in text value")]
    Utf8,
}

impl Error {
    /// Builds an [`Error::Assertion`] pointing at the caller.
    #[must_use]
    #[track_caller]
    pub fn assertion() -> Self {
        let location = Location::caller();
        Self::Assertion {
            location: format!("{}:{}", location.file(), location.line()),
        }
    }

    /// Primary code of an engine error.
    #[must_use]
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Sqlite(err) => Some(err.code),
            _ => None,
        }
    }
}

/// Result type for bridge operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_code_only() {
        assert_eq!(SqliteError::new(1).to_string(), "sqlite3: 1");
    }

    #[test]
    fn test_name_and_message() {
        let err = SqliteError::new(1)
            .with_name("ERROR")
            .with_message("no such table");
        assert_eq!(err.to_string(), "sqlite3: ERROR: no such table");
    }

    #[test]
    fn test_translate_splits_codes() {
        // SQLITE_CONSTRAINT_UNIQUE
        let err = SqliteError::translate(2067, Some("UNIQUE constraint failed".into()));
        assert_eq!(err.code, ErrorCode::CONSTRAINT);
        assert_eq!(err.extended, ExtendedErrorCode(2067));
        assert_eq!(err.extended.primary(), ErrorCode::CONSTRAINT);
        assert_eq!(
            err.to_string(),
            "sqlite3: CONSTRAINT: UNIQUE constraint failed"
        );
    }

    #[test]
    fn test_translate_unknown_code() {
        let err = SqliteError::translate(77, None);
        assert_eq!(err.name(), None);
        assert_eq!(err.to_string(), "sqlite3: 77");
    }

    #[test]
    fn test_translate_drops_empty_message() {
        let err = SqliteError::translate(1, Some(String::new()));
        assert_eq!(err.to_string(), "sqlite3: ERROR");
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(Error::OutOfMemory.to_string(), "sqlite3: out of memory");
        assert_eq!(
            Error::NoFunc("sqlite3_step".into()).to_string(),
            "sqlite3: could not find function: sqlite3_step"
        );
        assert_eq!(
            Error::from(SqliteError::new(5)).code(),
            Some(ErrorCode(5))
        );
        assert_eq!(Error::Range.code(), None);
    }

    #[test]
    fn test_assertion_carries_location() {
        let err = Error::assertion();
        let text = err.to_string();
        assert!(text.starts_with("sqlite3: assertion failed ("), "{text}");
        assert!(text.contains("error.rs:"), "{text}");
    }
}
