//! Lifecycle-managed reference to a prepared statement inside the guest.

use std::mem;

use log::debug;

use crate::abi::{SQLITE_BLOB, SQLITE_FLOAT, SQLITE_INTEGER, SQLITE_NULL, SQLITE_TEXT};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::handle::HandleId;
use crate::value::{index, Value};

/// Result of a single `sqlite3_step` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// A result row is available (`SQLITE_ROW`).
    Row,
    /// The statement has finished executing (`SQLITE_DONE`).
    Done,
}

/// Storage class of a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 64-bit signed integer.
    Integer,
    /// IEEE-754 double.
    Float,
    /// Text.
    Text,
    /// Binary blob.
    Blob,
    /// SQL NULL.
    Null,
}

/// A prepared statement inside the guest.
///
/// Statements are created via [`Connection::prepare`] and finalized when
/// dropped. After [`close`](Self::close) the handle is zero and every
/// operation fails with [`Error::NilHandle`] without entering the guest.
///
/// Parameter indexes are passed to the guest unchanged, so the first
/// parameter is `1`. Column indexes start at `0`.
pub struct Statement<'conn> {
    conn: &'conn Connection,
    id: HandleId,
}

impl<'conn> Statement<'conn> {
    pub(crate) const fn new(conn: &'conn Connection, id: HandleId) -> Self {
        Self { conn, id }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Finalizes the statement.
    ///
    /// The handle is zeroed whatever the guest returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NilHandle`] if already closed, otherwise the guest's
    /// finalize result (which repeats the last step's failure, if any).
    pub fn close(&mut self) -> Result<()> {
        let id = mem::replace(&mut self.id, HandleId::CLOSED);
        self.conn.guest().finalize(id)
    }

    /// Returns `true` once the statement has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.id == HandleId::CLOSED
    }

    /// The guest's handle for this statement, `0` once closed.
    #[must_use]
    pub fn raw_handle(&self) -> u32 {
        self.conn.guest_cell().borrow().handles.get(self.id).unwrap_or(0)
    }

    /// Resets the statement so it can be stepped again. Bindings are kept.
    ///
    /// # Errors
    ///
    /// Returns the guest's reset failure.
    pub fn reset(&mut self) -> Result<()> {
        self.conn.guest().reset(self.id)
    }

    /// Executes a single step.
    ///
    /// # Errors
    ///
    /// Returns any result code other than `ROW` and `DONE`, translated.
    pub fn step(&mut self) -> Result<StepResult> {
        self.conn.guest().step(self.id)
    }

    // ── Binding ─────────────────────────────────────────────────────────

    /// Binds a boolean as `1` or `0`.
    ///
    /// # Errors
    ///
    /// Returns the guest's bind failure, e.g. `RANGE` for a bad index.
    pub fn bind_bool(&mut self, param: usize, value: bool) -> Result<()> {
        self.bind_i64(param, value.into())
    }

    /// Binds a 64-bit integer.
    ///
    /// # Errors
    ///
    /// Returns the guest's bind failure.
    pub fn bind_i64(&mut self, param: usize, value: i64) -> Result<()> {
        self.conn.guest().bind_int64(self.id, index(param)?, value)
    }

    /// Binds a float, bit for bit.
    ///
    /// # Errors
    ///
    /// Returns the guest's bind failure.
    pub fn bind_f64(&mut self, param: usize, value: f64) -> Result<()> {
        self.conn.guest().bind_double(self.id, index(param)?, value)
    }

    /// Binds UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the guest cannot hold a copy, or the
    /// guest's bind failure.
    pub fn bind_text(&mut self, param: usize, value: &str) -> Result<()> {
        self.bind_text_bytes(param, value.as_bytes())
    }

    /// Binds raw bytes as text, without checking that they are UTF-8.
    ///
    /// # Errors
    ///
    /// See [`bind_text`](Self::bind_text).
    pub fn bind_text_bytes(&mut self, param: usize, value: &[u8]) -> Result<()> {
        self.conn.guest().bind_text(self.id, index(param)?, value)
    }

    /// Binds a blob.
    ///
    /// # Errors
    ///
    /// See [`bind_text`](Self::bind_text).
    pub fn bind_blob(&mut self, param: usize, value: &[u8]) -> Result<()> {
        self.conn.guest().bind_blob(self.id, index(param)?, value)
    }

    /// Binds SQL NULL.
    ///
    /// # Errors
    ///
    /// Returns the guest's bind failure.
    pub fn bind_null(&mut self, param: usize) -> Result<()> {
        self.conn.guest().bind_null(self.id, index(param)?)
    }

    /// Binds a [`Value`] through the matching typed binder.
    ///
    /// # Errors
    ///
    /// Returns the guest's bind failure.
    pub fn bind_value(&mut self, param: usize, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.bind_null(param),
            Value::Integer(v) => self.bind_i64(param, *v),
            Value::Float(v) => self.bind_f64(param, *v),
            Value::Text(v) => self.bind_text(param, v),
            Value::Blob(v) => self.bind_blob(param, v),
        }
    }

    /// Binds a slice of [`Value`]s to the statement parameters (1-indexed).
    ///
    /// # Errors
    ///
    /// Returns the first bind failure.
    pub fn bind_values(&mut self, values: &[Value]) -> Result<()> {
        for (i, value) in values.iter().enumerate() {
            self.bind_value(i + 1, value)?;
        }
        Ok(())
    }

    // ── Column reading ──────────────────────────────────────────────────

    /// Returns the number of columns in the result set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NilHandle`] once closed, or a call failure.
    pub fn column_count(&self) -> Result<usize> {
        let count = self.conn.guest().column_count(self.id)?;
        usize::try_from(count).map_err(|_| Error::assertion())
    }

    /// Returns the storage class of column `col`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NilHandle`] once closed, or a call failure.
    pub fn column_type(&self, col: usize) -> Result<ColumnType> {
        match self.conn.guest().column_type(self.id, index(col)?)? {
            SQLITE_INTEGER => Ok(ColumnType::Integer),
            SQLITE_FLOAT => Ok(ColumnType::Float),
            SQLITE_TEXT => Ok(ColumnType::Text),
            SQLITE_BLOB => Ok(ColumnType::Blob),
            SQLITE_NULL => Ok(ColumnType::Null),
            _ => Err(Error::assertion()),
        }
    }

    /// Returns `true` if the column is SQL NULL.
    ///
    /// # Errors
    ///
    /// See [`column_type`](Self::column_type).
    pub fn is_column_null(&self, col: usize) -> Result<bool> {
        Ok(self.column_type(col)? == ColumnType::Null)
    }

    /// Reads a column as a boolean (non-zero is `true`).
    ///
    /// # Errors
    ///
    /// See [`column_i64`](Self::column_i64).
    pub fn column_bool(&self, col: usize) -> Result<bool> {
        Ok(self.column_i64(col)? != 0)
    }

    /// Reads a column as `i64`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NilHandle`] once closed, or a call failure.
    pub fn column_i64(&self, col: usize) -> Result<i64> {
        self.conn.guest().column_int64(self.id, index(col)?)
    }

    /// Reads a column as `f64`, bit for bit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NilHandle`] once closed, or a call failure.
    pub fn column_f64(&self, col: usize) -> Result<f64> {
        self.conn.guest().column_double(self.id, index(col)?)
    }

    /// Reads a column as UTF-8 text. NULL reads as an empty string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Utf8`] if the bytes are not UTF-8, and
    /// [`Error::OutOfMemory`] if the guest could not produce the text.
    ///
    /// # Panics
    ///
    /// Panics if the guest reports a range outside its memory.
    pub fn column_text(&self, col: usize) -> Result<String> {
        String::from_utf8(self.column_text_bytes(col)?).map_err(|_| Error::Utf8)
    }

    /// Reads a text column's raw bytes.
    ///
    /// # Errors
    ///
    /// See [`column_text`](Self::column_text).
    ///
    /// # Panics
    ///
    /// See [`column_text`](Self::column_text).
    pub fn column_text_bytes(&self, col: usize) -> Result<Vec<u8>> {
        self.conn.guest().column_bytes(self.id, index(col)?, true)
    }

    /// Reads a column as a blob. NULL reads as an empty vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the guest could not produce the blob.
    ///
    /// # Panics
    ///
    /// Panics if the guest reports a range outside its memory.
    pub fn column_blob(&self, col: usize) -> Result<Vec<u8>> {
        self.conn.guest().column_bytes(self.id, index(col)?, false)
    }

    /// Copies a blob column into `buf` and returns the number of bytes
    /// copied, the smaller of the blob's and the buffer's length.
    ///
    /// # Errors
    ///
    /// See [`column_blob`](Self::column_blob).
    ///
    /// # Panics
    ///
    /// Panics if the guest reports a range outside its memory.
    pub fn column_blob_into(&self, col: usize, buf: &mut [u8]) -> Result<usize> {
        self.conn.guest().column_blob_into(self.id, index(col)?, buf)
    }

    /// Reads a column as a [`Value`] of its storage class.
    ///
    /// # Errors
    ///
    /// See [`column_text`](Self::column_text).
    pub fn column_value(&self, col: usize) -> Result<Value> {
        Ok(match self.column_type(col)? {
            ColumnType::Null => Value::Null,
            ColumnType::Integer => Value::Integer(self.column_i64(col)?),
            ColumnType::Float => Value::Float(self.column_f64(col)?),
            ColumnType::Text => Value::Text(self.column_text(col)?),
            ColumnType::Blob => Value::Blob(self.column_blob(col)?),
        })
    }
}

impl std::fmt::Debug for Statement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("connection", &self.conn.instance_name())
            .field("handle", &self.raw_handle())
            .finish()
    }
}

impl Drop for Statement<'_> {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        let id = mem::replace(&mut self.id, HandleId::CLOSED);
        let Ok(mut guest) = self.conn.guest_cell().try_borrow_mut() else {
            return;
        };
        match guest.finalize(id) {
            Ok(()) | Err(Error::Abandoned) => {}
            Err(e) => debug!("{}: finalize on drop: {e}", self.conn.instance_name()),
        }
    }
}
