//! A database opened inside one guest instance.

use std::cell::{RefCell, RefMut};
use std::sync::Arc;

use log::{debug, trace, warn};
use wasmtime::{Func, Store, Trap, Val};

use crate::abi::{
    GuestApi, SQLITE_DONE, SQLITE_MISUSE, SQLITE_OK, SQLITE_OPEN_CREATE, SQLITE_OPEN_EXRESCODE,
    SQLITE_OPEN_READWRITE, SQLITE_ROW, SQLITE_UTF8,
};
use crate::cancel::CancelToken;
use crate::config::Strategy;
use crate::error::{Error, Result, SqliteError};
use crate::handle::{HandleArena, HandleId};
use crate::memory::{from_ptr, to_ptr, GuestMemory};
use crate::runtime::{describe, Compiled, GuestInstance, GuestState, ModuleRuntime};
use crate::statement::{Statement, StepResult};
use crate::value::{float_from_guest, float_to_guest, Value};

/// Size of the pointer out-slot staged in front of strings whose call
/// returns a pointer through an argument.
const SLOT: u32 = 4;

/// Guest instance state behind a [`Connection`].
///
/// Every method is one or a few blocking calls into the guest. Once a call
/// traps or is interrupted the instance is abandoned and no further call
/// enters it.
pub(crate) struct Guest {
    store: Store<GuestState>,
    api: GuestApi,
    memory: GuestMemory,
    pub(crate) handles: HandleArena,
    db: u32,
    pub(crate) abandoned: bool,
}

impl Guest {
    fn new(mut store: Store<GuestState>, instance: &wasmtime::Instance) -> Result<Self> {
        let api = GuestApi::resolve(&mut store, instance)?;
        Ok(Self {
            store,
            memory: GuestMemory::new(api.memory),
            api,
            handles: HandleArena::default(),
            db: 0,
            abandoned: false,
        })
    }

    // ── Calls ───────────────────────────────────────────────────────────

    fn call(&mut self, func: Func, args: &[Val], results: &mut [Val]) -> Result<()> {
        if self.abandoned {
            return Err(Error::Abandoned);
        }
        if self.store.data().cancel_token().is_cancelled() {
            self.abandoned = true;
            return Err(Error::Interrupted);
        }
        func.call(&mut self.store, args, results)
            .map_err(|e| self.fault(&e))
    }

    fn fault(&mut self, err: &wasmtime::Error) -> Error {
        self.abandoned = true;
        if err.downcast_ref::<Trap>() == Some(&Trap::Interrupt) {
            warn!("guest call interrupted, abandoning instance");
            Error::Interrupted
        } else {
            warn!("guest trapped, abandoning instance: {err:#}");
            Error::Trap(describe(err))
        }
    }

    fn call_void(&mut self, func: Func, args: &[Val]) -> Result<()> {
        self.call(func, args, &mut [])
    }

    #[track_caller]
    fn call_i32(&mut self, func: Func, args: &[Val]) -> Result<i32> {
        let mut results = [Val::I32(0)];
        self.call(func, args, &mut results)?;
        match &results[0] {
            Val::I32(v) => Ok(*v),
            _ => Err(Error::assertion()),
        }
    }

    #[track_caller]
    fn call_i64(&mut self, func: Func, args: &[Val]) -> Result<i64> {
        let mut results = [Val::I64(0)];
        self.call(func, args, &mut results)?;
        match &results[0] {
            Val::I64(v) => Ok(*v),
            _ => Err(Error::assertion()),
        }
    }

    #[track_caller]
    fn call_f64(&mut self, func: Func, args: &[Val]) -> Result<f64> {
        let mut results = [float_to_guest(0.0)];
        self.call(func, args, &mut results)?;
        match float_from_guest(&results[0]) {
            Some(v) => Ok(v),
            None => Err(Error::assertion()),
        }
    }

    // ── Errors ──────────────────────────────────────────────────────────

    fn check(&mut self, rc: i32) -> Result<()> {
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.error(rc))
        }
    }

    fn error(&mut self, rc: i32) -> Error {
        let message = self.errmsg();
        SqliteError::translate(rc, message).into()
    }

    fn errmsg(&mut self) -> Option<String> {
        if self.db == 0 || self.abandoned {
            return None;
        }
        let ptr = self.call_i32(self.api.errmsg, &[Val::I32(to_ptr(self.db))]).ok()?;
        if ptr == 0 {
            return None;
        }
        self.memory.read_cstring(&self.store, from_ptr(ptr)).ok()
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Copies `bytes` into freshly allocated guest memory.
    ///
    /// At least one byte is allocated so an empty value is never NULL.
    fn stage(&mut self, bytes: &[u8]) -> Result<u32> {
        let size = i64::try_from(bytes.len().max(1)).map_err(|_| Error::OutOfMemory)?;
        let ptr = self.call_i32(self.api.malloc, &[Val::I64(size)])?;
        if ptr == 0 {
            return Err(Error::OutOfMemory);
        }
        let addr = from_ptr(ptr);
        if let Err(e) = self.memory.write(&mut self.store, addr, bytes) {
            self.release(addr);
            return Err(e);
        }
        Ok(addr)
    }

    /// Stages `text` NUL-terminated.
    fn stage_cstr(&mut self, text: &[u8]) -> Result<u32> {
        let mut buf = Vec::with_capacity(text.len() + 1);
        buf.extend_from_slice(text);
        buf.push(0);
        self.stage(&buf)
    }

    /// Stages a zeroed pointer slot followed by `text` NUL-terminated.
    /// The text starts at the returned address plus [`SLOT`].
    fn stage_with_slot(&mut self, text: &[u8]) -> Result<u32> {
        let mut buf = Vec::with_capacity(SLOT as usize + text.len() + 1);
        buf.extend_from_slice(&[0; SLOT as usize]);
        buf.extend_from_slice(text);
        buf.push(0);
        self.stage(&buf)
    }

    /// Frees guest memory, best-effort.
    fn release(&mut self, addr: u32) {
        if addr == 0 || self.abandoned {
            return;
        }
        if let Err(e) = self.call_void(self.api.free, &[Val::I32(to_ptr(addr))]) {
            warn!("freeing guest buffer {addr:#x} failed: {e}");
        }
    }

    // ── Database ────────────────────────────────────────────────────────

    fn open_db(&mut self, filename: &str) -> Result<()> {
        let buf = self.stage_with_slot(filename.as_bytes())?;
        let rc = self.call_i32(
            self.api.open,
            &[
                Val::I32(to_ptr(buf + SLOT)),
                Val::I32(to_ptr(buf)),
                Val::I32(SQLITE_OPEN_READWRITE | SQLITE_OPEN_CREATE | SQLITE_OPEN_EXRESCODE),
                Val::I32(0),
            ],
        );
        let db = if rc.is_ok() {
            self.memory.read_u32(&self.store, buf)
        } else {
            0
        };
        self.release(buf);
        let rc = rc?;

        self.db = db;
        if rc != SQLITE_OK {
            let err = self.error(rc);
            if let Some(Err(e)) = self.close_db() {
                warn!("closing unopened database failed: {e}");
            }
            return Err(err);
        }
        if db == 0 {
            return Err(Error::NilHandle);
        }
        Ok(())
    }

    fn close_db(&mut self) -> Option<Result<()>> {
        let db = std::mem::take(&mut self.db);
        if db == 0 {
            return None;
        }
        Some(
            self.call_i32(self.api.close, &[Val::I32(to_ptr(db))])
                .and_then(|rc| {
                    if rc == SQLITE_OK {
                        Ok(())
                    } else {
                        Err(SqliteError::translate(rc, None).into())
                    }
                }),
        )
    }

    fn db(&self) -> Result<Val> {
        if self.db == 0 {
            return Err(Error::NilHandle);
        }
        Ok(Val::I32(to_ptr(self.db)))
    }

    /// Finalizes every open statement, then closes the database.
    fn shutdown(&mut self) -> Result<()> {
        for stmt in self.handles.drain() {
            if self.abandoned {
                break;
            }
            if let Err(e) = self.call_i32(self.api.finalize, &[Val::I32(to_ptr(stmt))]) {
                warn!("finalizing statement {stmt:#x} failed: {e}");
            }
        }
        self.close_db().unwrap_or(Ok(()))
    }

    fn exec(&mut self, sql: &str) -> Result<()> {
        let db = self.db()?;
        let buf = self.stage_with_slot(sql.as_bytes())?;
        let rc = self.call_i32(
            self.api.exec,
            &[
                db,
                Val::I32(to_ptr(buf + SLOT)),
                Val::I32(0),
                Val::I32(0),
                Val::I32(to_ptr(buf)),
            ],
        );
        let errmsg = if rc.is_ok() {
            self.memory.read_u32(&self.store, buf)
        } else {
            0
        };
        self.release(buf);
        let rc = rc?;
        if rc == SQLITE_OK {
            return Ok(());
        }

        let message = if errmsg == 0 {
            self.errmsg()
        } else {
            let message = self.memory.read_cstring(&self.store, errmsg).ok();
            self.release(errmsg);
            message
        };
        Err(SqliteError::translate(rc, message).into())
    }

    fn prepare(&mut self, sql: &str) -> Result<HandleId> {
        let db = self.db()?;
        let len = i32::try_from(sql.len()).map_err(|_| Error::Range)?;
        let buf = self.stage_with_slot(sql.as_bytes())?;
        let rc = self.call_i32(
            self.api.prepare,
            &[
                db,
                Val::I32(to_ptr(buf + SLOT)),
                Val::I32(len),
                Val::I32(0),
                Val::I32(to_ptr(buf)),
                Val::I32(0),
            ],
        );
        let stmt = if rc.is_ok() {
            self.memory.read_u32(&self.store, buf)
        } else {
            0
        };
        self.release(buf);
        let rc = rc?;

        if rc != SQLITE_OK {
            return Err(self.error(rc));
        }
        if stmt == 0 {
            return Err(SqliteError::translate(
                SQLITE_MISUSE,
                Some("statement contains no SQL".to_string()),
            )
            .into());
        }
        Ok(self.handles.insert(stmt))
    }

    // ── Statements ──────────────────────────────────────────────────────

    fn stmt(&self, id: HandleId) -> Result<i32> {
        self.handles.get(id).map(to_ptr).ok_or(Error::NilHandle)
    }

    pub(crate) fn finalize(&mut self, id: HandleId) -> Result<()> {
        let stmt = self.handles.remove(id).ok_or(Error::NilHandle)?;
        let rc = self.call_i32(self.api.finalize, &[Val::I32(to_ptr(stmt))])?;
        self.check(rc)
    }

    pub(crate) fn reset(&mut self, id: HandleId) -> Result<()> {
        let stmt = self.stmt(id)?;
        let rc = self.call_i32(self.api.reset, &[Val::I32(stmt)])?;
        self.check(rc)
    }

    pub(crate) fn step(&mut self, id: HandleId) -> Result<StepResult> {
        let stmt = self.stmt(id)?;
        match self.call_i32(self.api.step, &[Val::I32(stmt)])? {
            SQLITE_ROW => Ok(StepResult::Row),
            SQLITE_DONE => Ok(StepResult::Done),
            rc => Err(self.error(rc)),
        }
    }

    pub(crate) fn bind_int64(&mut self, id: HandleId, param: i32, value: i64) -> Result<()> {
        let stmt = self.stmt(id)?;
        let rc = self.call_i32(
            self.api.bind_int64,
            &[Val::I32(stmt), Val::I32(param), Val::I64(value)],
        )?;
        self.check(rc)
    }

    pub(crate) fn bind_double(&mut self, id: HandleId, param: i32, value: f64) -> Result<()> {
        let stmt = self.stmt(id)?;
        let rc = self.call_i32(
            self.api.bind_double,
            &[Val::I32(stmt), Val::I32(param), float_to_guest(value)],
        )?;
        self.check(rc)
    }

    /// Binds UTF-8 text. The staged copy is owned by the guest afterwards.
    pub(crate) fn bind_text(&mut self, id: HandleId, param: i32, text: &[u8]) -> Result<()> {
        let stmt = self.stmt(id)?;
        let len = i64::try_from(text.len()).map_err(|_| Error::Range)?;
        let ptr = self.stage_cstr(text)?;
        let rc = self.call_i32(
            self.api.bind_text64,
            &[
                Val::I32(stmt),
                Val::I32(param),
                Val::I32(to_ptr(ptr)),
                Val::I64(len),
                Val::I32(self.api.destructor),
                Val::I32(SQLITE_UTF8),
            ],
        )?;
        self.check(rc)
    }

    /// Binds a blob. The staged copy is owned by the guest afterwards.
    pub(crate) fn bind_blob(&mut self, id: HandleId, param: i32, blob: &[u8]) -> Result<()> {
        let stmt = self.stmt(id)?;
        let len = i64::try_from(blob.len()).map_err(|_| Error::Range)?;
        let ptr = self.stage(blob)?;
        let rc = self.call_i32(
            self.api.bind_blob64,
            &[
                Val::I32(stmt),
                Val::I32(param),
                Val::I32(to_ptr(ptr)),
                Val::I64(len),
                Val::I32(self.api.destructor),
            ],
        )?;
        self.check(rc)
    }

    pub(crate) fn bind_null(&mut self, id: HandleId, param: i32) -> Result<()> {
        let stmt = self.stmt(id)?;
        let rc = self.call_i32(self.api.bind_null, &[Val::I32(stmt), Val::I32(param)])?;
        self.check(rc)
    }

    pub(crate) fn column_int64(&mut self, id: HandleId, col: i32) -> Result<i64> {
        let stmt = self.stmt(id)?;
        self.call_i64(self.api.column_int64, &[Val::I32(stmt), Val::I32(col)])
    }

    pub(crate) fn column_double(&mut self, id: HandleId, col: i32) -> Result<f64> {
        let stmt = self.stmt(id)?;
        self.call_f64(self.api.column_double, &[Val::I32(stmt), Val::I32(col)])
    }

    pub(crate) fn column_type(&mut self, id: HandleId, col: i32) -> Result<i32> {
        let stmt = self.stmt(id)?;
        self.call_i32(self.api.column_type, &[Val::I32(stmt), Val::I32(col)])
    }

    pub(crate) fn column_count(&mut self, id: HandleId) -> Result<i32> {
        let stmt = self.stmt(id)?;
        self.call_i32(self.api.column_count, &[Val::I32(stmt)])
    }

    /// Locates a text or blob column: the pointer, then the byte length.
    ///
    /// A zero pointer is only valid for an empty value; with a non-zero
    /// length it means the guest could not materialize the value.
    fn column_span(&mut self, id: HandleId, col: i32, text: bool) -> Result<(u32, usize)> {
        let stmt = self.stmt(id)?;
        let func = if text {
            self.api.column_text
        } else {
            self.api.column_blob
        };
        let ptr = self.call_i32(func, &[Val::I32(stmt), Val::I32(col)])?;
        let len = self.call_i32(self.api.column_bytes, &[Val::I32(stmt), Val::I32(col)])?;
        let len = usize::try_from(len).map_err(|_| Error::assertion())?;
        if ptr == 0 && len > 0 {
            return Err(Error::OutOfMemory);
        }
        Ok((from_ptr(ptr), len))
    }

    pub(crate) fn column_bytes(&mut self, id: HandleId, col: i32, text: bool) -> Result<Vec<u8>> {
        let (ptr, len) = self.column_span(id, col, text)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        Ok(self.memory.read(&self.store, ptr, len).to_vec())
    }

    pub(crate) fn column_blob_into(
        &mut self,
        id: HandleId,
        col: i32,
        buf: &mut [u8],
    ) -> Result<usize> {
        let (ptr, len) = self.column_span(id, col, false)?;
        let n = len.min(buf.len());
        if n > 0 {
            buf[..n].copy_from_slice(self.memory.read(&self.store, ptr, n));
        }
        Ok(n)
    }
}

/// A database connection inside its own guest instance.
///
/// The connection closes its database when dropped. It is `Send` but not
/// `Sync`: the guest instance is not reentrant, so every call on it happens
/// from one thread at a time.
pub struct Connection {
    name: String,
    strategy: Strategy,
    cancel: CancelToken,
    guest: RefCell<Guest>,
    _artifact: Arc<Compiled>,
}

impl Connection {
    /// Instantiates the guest under the runtime's strategy and opens (or
    /// creates) `filename` in it.
    ///
    /// # Errors
    ///
    /// Returns instantiation failures, missing exports, and the guest's open
    /// failure.
    pub fn open(runtime: &ModuleRuntime, filename: &str) -> Result<Self> {
        Self::open_instance(runtime.instantiate()?, filename)
    }

    /// Opens `filename` in an already created instance.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_instance(instance: GuestInstance, filename: &str) -> Result<Self> {
        let GuestInstance {
            name,
            strategy,
            store,
            instance,
            artifact,
        } = instance;
        let cancel = store.data().cancel_token().clone();
        let mut guest = Guest::new(store, &instance)?;
        guest.open_db(filename)?;
        debug!("{name}: opened {filename:?}");
        Ok(Self {
            name,
            strategy,
            cancel,
            guest: RefCell::new(guest),
            _artifact: artifact,
        })
    }

    pub(crate) fn guest(&self) -> RefMut<'_, Guest> {
        self.guest.borrow_mut()
    }

    pub(crate) const fn guest_cell(&self) -> &RefCell<Guest> {
        &self.guest
    }

    /// Name of the guest instance, `sqlite3-<n>`.
    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.name
    }

    /// Strategy the guest executes under.
    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// A token that cancels calls on this connection, from any thread.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Returns `true` once a call trapped or was interrupted. An abandoned
    /// connection fails every call with [`Error::Abandoned`].
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.guest.borrow().abandoned
    }

    // ── execute_batch ───────────────────────────────────────────────────

    /// Executes one or more SQL statements separated by semicolons.
    ///
    /// No result rows are returned.
    ///
    /// # Errors
    ///
    /// Returns the first statement's failure, with the guest's message.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        trace!("{}: exec {sql:?}", self.name);
        self.guest().exec(sql)
    }

    // ── prepare ─────────────────────────────────────────────────────────

    /// Prepares a single SQL statement.
    ///
    /// # Errors
    ///
    /// Returns the guest's compile failure, or `MISUSE` if `sql` holds no
    /// statement.
    pub fn prepare(&self, sql: &str) -> Result<Statement<'_>> {
        trace!("{}: prepare {sql:?}", self.name);
        let id = self.guest().prepare(sql)?;
        Ok(Statement::new(self, id))
    }

    // ── execute (single statement) ──────────────────────────────────────

    /// Prepares a statement, binds `params` and steps it to completion.
    ///
    /// # Errors
    ///
    /// Returns the first failing prepare, bind or step.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<()> {
        let mut stmt = self.prepare(sql)?;
        stmt.bind_values(params)?;
        while stmt.step()? == StepResult::Row {}
        stmt.close()
    }

    // ── query_row ───────────────────────────────────────────────────────

    /// Prepares and executes a statement, mapping exactly one result row.
    ///
    /// # Errors
    ///
    /// Returns an error if no row is returned, or if any call fails.
    pub fn query_row<T>(
        &self,
        sql: &str,
        params: &[Value],
        mapper: impl FnOnce(&Statement<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut stmt = self.prepare(sql)?;
        stmt.bind_values(params)?;
        match stmt.step()? {
            StepResult::Row => mapper(&stmt),
            StepResult::Done => Err(SqliteError::new(SQLITE_DONE)
                .with_message("query returned no rows")
                .into()),
        }
    }

    /// Like [`query_row`](Self::query_row) but returns `Ok(None)` when no row
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if any call fails.
    pub fn query_row_optional<T>(
        &self,
        sql: &str,
        params: &[Value],
        mapper: impl FnOnce(&Statement<'_>) -> Result<T>,
    ) -> Result<Option<T>> {
        let mut stmt = self.prepare(sql)?;
        stmt.bind_values(params)?;
        match stmt.step()? {
            StepResult::Row => mapper(&stmt).map(Some),
            StepResult::Done => Ok(None),
        }
    }

    // ── Rows iteration ──────────────────────────────────────────────────

    /// Prepares a statement and collects all matching rows.
    ///
    /// # Errors
    ///
    /// Returns an error if any call or the mapper fails.
    pub fn query_map<T>(
        &self,
        sql: &str,
        params: &[Value],
        mapper: impl Fn(&Statement<'_>) -> Result<T>,
    ) -> Result<Vec<T>> {
        let mut stmt = self.prepare(sql)?;
        stmt.bind_values(params)?;
        let mut results = Vec::new();
        loop {
            match stmt.step()? {
                StepResult::Row => results.push(mapper(&stmt)?),
                StepResult::Done => break,
            }
        }
        Ok(results)
    }

    // ── close ───────────────────────────────────────────────────────────

    /// Finalizes any statement still open and closes the database.
    ///
    /// # Errors
    ///
    /// Returns the guest's close failure, or [`Error::Abandoned`] if an
    /// earlier call left the instance unusable.
    pub fn close(self) -> Result<()> {
        let mut guest = self.guest.borrow_mut();
        if guest.abandoned {
            return Err(Error::Abandoned);
        }
        debug!("{}: closing ({} statements open)", self.name, guest.handles.len());
        guest.shutdown()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let guest = self.guest.get_mut();
        if guest.abandoned || guest.db == 0 {
            return;
        }
        if let Err(e) = guest.shutdown() {
            warn!("{}: closing database failed: {e}", self.name);
        }
    }
}
