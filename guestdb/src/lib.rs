//! Drive a WebAssembly build of `SQLite` from the host.
//!
//! The database engine runs inside a sandboxed wasmtime instance instead of
//! being linked natively. This crate is the bridge around it:
//!
//! * [`ModuleRuntime`] compiles the guest artifact once per execution
//!   [`Strategy`] (Cranelift native code or the Pulley interpreter) and mints
//!   isolated instances from it.
//! * [`Connection`] owns one instance and the database opened in it.
//! * [`Statement`] is a prepared statement addressed by a guest handle that
//!   is zeroed on close and never reused afterwards.
//! * Values cross the boundary exactly: floats keep their bit pattern, text
//!   and blobs are copied byte for byte through guest-allocated buffers.
//! * Guest result codes become [`SqliteError`]s that print as
//!   `sqlite3: ERROR: no such table`.
//!
//! ```no_run
//! use guestdb::{params, Connection, ModuleRuntime, RuntimeConfig};
//!
//! # fn main() -> guestdb::Result<()> {
//! let runtime = ModuleRuntime::new(RuntimeConfig::from_path("sqlite3.wasm"));
//! let conn = Connection::open(&runtime, ":memory:")?;
//! let text = conn.query_row("SELECT printf('%f', ?1)", params![2.5], |stmt| {
//!     stmt.column_text(0)
//! })?;
//! assert_eq!(text, "2.500000");
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all, clippy::pedantic, clippy::nursery)]

mod abi;
mod cancel;
mod config;
mod connection;
mod error;
mod handle;
mod memory;
mod runtime;
mod statement;
mod value;

/// Forwarding of the crate's log records to an embedder-supplied sink.
pub mod logger;

pub use cancel::CancelToken;
pub use config::{RuntimeConfig, Strategy};
pub use connection::Connection;
pub use error::{Error, ErrorCode, ExtendedErrorCode, Result, SqliteError};
pub use runtime::{GuestInstance, GuestState, HostImports, ModuleRuntime, WasiImports};
pub use statement::{ColumnType, Statement, StepResult};
pub use value::Value;

/// Re-export of the wasmtime types [`HostImports`] implementations need.
pub mod wasmtime_reexport {
    pub use wasmtime::{Error, Linker};
}
