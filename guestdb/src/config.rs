//! Runtime configuration: where the guest binary comes from and how it runs.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Error, Result};

/// Default interval between epoch ticks, in milliseconds.
const DEFAULT_EPOCH_INTERVAL_MS: u64 = 10;

/// How the guest artifact is executed.
///
/// Both strategies must produce identical observable results for identical
/// call sequences.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Ahead-of-time compiled to native code with Cranelift.
    #[default]
    Compiled,
    /// Compiled to Pulley bytecode and interpreted.
    Interpreted,
}

impl Strategy {
    /// Both strategies, compiled first.
    pub const ALL: [Self; 2] = [Self::Compiled, Self::Interpreted];

    pub(crate) const fn slot(self) -> usize {
        match self {
            Self::Compiled => 0,
            Self::Interpreted => 1,
        }
    }
}

/// Configuration of a [`ModuleRuntime`](crate::ModuleRuntime).
///
/// The guest binary is taken from [`binary`](Self::binary) when set,
/// otherwise read in full from [`path`](Self::path). JSON configs can carry
/// everything except the in-memory binary.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// In-memory guest binary (wasm or wat). Takes precedence over `path`.
    #[serde(skip)]
    pub binary: Option<Arc<[u8]>>,
    /// Filesystem path of the guest binary.
    pub path: Option<PathBuf>,
    /// Selects the interpreted strategy instead of compiled execution.
    pub interpreter: bool,
    /// Interval between epoch ticks used to interrupt running calls. `None`
    /// or zero disables in-flight cancellation.
    pub epoch_interval_ms: Option<u64>,
    /// Upper bound on each instance's linear memory, in bytes.
    pub max_memory_bytes: Option<usize>,
    /// Resolve guest imports that no host import provides to trapping stubs.
    pub trap_unknown_imports: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: None,
            path: None,
            interpreter: false,
            epoch_interval_ms: Some(DEFAULT_EPOCH_INTERVAL_MS),
            max_memory_bytes: None,
            trap_unknown_imports: false,
        }
    }
}

impl RuntimeConfig {
    /// Configuration for an in-memory binary.
    #[must_use]
    pub fn from_binary(binary: impl Into<Arc<[u8]>>) -> Self {
        Self {
            binary: Some(binary.into()),
            ..Self::default()
        }
    }

    /// Configuration for a binary read from `path`.
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::default().with_path(path)
    }

    /// Parses a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JSON is malformed or has unknown
    /// fields.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Sets the binary path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Selects interpretation (`true`) or compiled execution (`false`).
    #[must_use]
    pub const fn with_interpreter(mut self, interpreter: bool) -> Self {
        self.interpreter = interpreter;
        self
    }

    /// Sets the epoch tick interval; `None` disables in-flight cancellation.
    #[must_use]
    pub fn with_epoch_interval(mut self, interval: Option<Duration>) -> Self {
        self.epoch_interval_ms =
            interval.map(|i| u64::try_from(i.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Caps each instance's linear memory.
    #[must_use]
    pub const fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    /// Resolves unknown imports to trapping stubs.
    #[must_use]
    pub const fn with_trap_unknown_imports(mut self, trap: bool) -> Self {
        self.trap_unknown_imports = trap;
        self
    }

    /// The strategy selected by [`interpreter`](Self::interpreter).
    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        if self.interpreter {
            Strategy::Interpreted
        } else {
            Strategy::Compiled
        }
    }

    /// The epoch tick interval, if enabled.
    #[must_use]
    pub fn epoch_interval(&self) -> Option<Duration> {
        self.epoch_interval_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }

    /// Resolves the guest binary: in-memory first, then the path.
    pub(crate) fn load_binary(&self) -> Result<Arc<[u8]>> {
        if let Some(binary) = &self.binary {
            return Ok(Arc::clone(binary));
        }
        let path = self.path.as_ref().ok_or(Error::NoBinary)?;
        std::fs::read(path)
            .map(Arc::from)
            .map_err(|e| Error::Io(format!("{}: {e}", path.display())))
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("binary", &self.binary.as_ref().map(|b| b.len()))
            .field("path", &self.path)
            .field("interpreter", &self.interpreter)
            .field("epoch_interval_ms", &self.epoch_interval_ms)
            .field("max_memory_bytes", &self.max_memory_bytes)
            .field("trap_unknown_imports", &self.trap_unknown_imports)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json() {
        let config = RuntimeConfig::from_json(
            r#"{"path": "/opt/sqlite3.wasm", "interpreter": true, "max_memory_bytes": 1048576}"#,
        )
        .expect("parse config");
        assert_eq!(config.path, Some(PathBuf::from("/opt/sqlite3.wasm")));
        assert_eq!(config.strategy(), Strategy::Interpreted);
        assert_eq!(config.max_memory_bytes, Some(1_048_576));
        assert_eq!(config.epoch_interval(), Some(Duration::from_millis(10)));
        assert!(config.binary.is_none());
    }

    #[test]
    fn test_from_json_rejects_unknown_fields() {
        let err = RuntimeConfig::from_json(r#"{"interpretr": true}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_epoch_interval_disabled() {
        let config = RuntimeConfig::from_json(r#"{"epoch_interval_ms": 0}"#).unwrap();
        assert_eq!(config.epoch_interval(), None);
        let config = RuntimeConfig::default().with_epoch_interval(None);
        assert_eq!(config.epoch_interval(), None);
    }

    #[test]
    fn test_binary_takes_precedence_over_path() {
        let config = RuntimeConfig::from_binary(&b"(module)"[..])
            .with_path("/definitely/not/here.wasm");
        assert_eq!(&*config.load_binary().unwrap(), b"(module)");
    }

    #[test]
    fn test_missing_binary() {
        assert_eq!(
            RuntimeConfig::default().load_binary().unwrap_err(),
            Error::NoBinary
        );
        let err = RuntimeConfig::from_path("/definitely/not/here.wasm")
            .load_binary()
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(Strategy::Interpreted.to_string(), "interpreted");
        assert_eq!("compiled".parse::<Strategy>().unwrap(), Strategy::Compiled);
    }
}
