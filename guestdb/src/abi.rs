//! The guest's exported function table and the constants of its C ABI.

use wasmtime::{Func, Instance, Memory, Store, Val, ValType};

use crate::error::{Error, Result};
use crate::runtime::GuestState;

pub(crate) const SQLITE_OK: i32 = 0;
pub(crate) const SQLITE_ROW: i32 = 100;
pub(crate) const SQLITE_DONE: i32 = 101;

pub(crate) const SQLITE_MISUSE: i32 = 21;

// Column type constants
pub(crate) const SQLITE_INTEGER: i32 = 1;
pub(crate) const SQLITE_FLOAT: i32 = 2;
pub(crate) const SQLITE_TEXT: i32 = 3;
pub(crate) const SQLITE_BLOB: i32 = 4;
pub(crate) const SQLITE_NULL: i32 = 5;

/// Text encoding tag for `sqlite3_bind_text64`.
pub(crate) const SQLITE_UTF8: i32 = 1;

// Open flags
pub(crate) const SQLITE_OPEN_READWRITE: i32 = 0x0000_0002;
pub(crate) const SQLITE_OPEN_CREATE: i32 = 0x0000_0004;
/// Makes the connection report extended result codes.
pub(crate) const SQLITE_OPEN_EXRESCODE: i32 = 0x0200_0000;

/// Core wasm value types used by the exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    I32,
    I64,
    F64,
}

impl Ty {
    const fn of(ty: &ValType) -> Option<Self> {
        match ty {
            ValType::I32 => Some(Self::I32),
            ValType::I64 => Some(Self::I64),
            ValType::F64 => Some(Self::F64),
            _ => None,
        }
    }
}

/// Name and expected signature of one export.
struct Export {
    name: &'static str,
    params: &'static [Ty],
    results: &'static [Ty],
}

use Ty::{F64, I32, I64};

const MALLOC: Export = Export {
    name: "sqlite3_malloc64",
    params: &[I64],
    results: &[I32],
};
const FREE: Export = Export {
    name: "sqlite3_free",
    params: &[I32],
    results: &[],
};
const OPEN: Export = Export {
    name: "sqlite3_open_v2",
    params: &[I32, I32, I32, I32],
    results: &[I32],
};
const CLOSE: Export = Export {
    name: "sqlite3_close",
    params: &[I32],
    results: &[I32],
};
const PREPARE: Export = Export {
    name: "sqlite3_prepare_v3",
    params: &[I32, I32, I32, I32, I32, I32],
    results: &[I32],
};
const EXEC: Export = Export {
    name: "sqlite3_exec",
    params: &[I32, I32, I32, I32, I32],
    results: &[I32],
};
const ERRMSG: Export = Export {
    name: "sqlite3_errmsg",
    params: &[I32],
    results: &[I32],
};
const FINALIZE: Export = Export {
    name: "sqlite3_finalize",
    params: &[I32],
    results: &[I32],
};
const RESET: Export = Export {
    name: "sqlite3_reset",
    params: &[I32],
    results: &[I32],
};
const STEP: Export = Export {
    name: "sqlite3_step",
    params: &[I32],
    results: &[I32],
};
const BIND_INT64: Export = Export {
    name: "sqlite3_bind_int64",
    params: &[I32, I32, I64],
    results: &[I32],
};
const BIND_DOUBLE: Export = Export {
    name: "sqlite3_bind_double",
    params: &[I32, I32, F64],
    results: &[I32],
};
const BIND_TEXT64: Export = Export {
    name: "sqlite3_bind_text64",
    params: &[I32, I32, I32, I64, I32, I32],
    results: &[I32],
};
const BIND_BLOB64: Export = Export {
    name: "sqlite3_bind_blob64",
    params: &[I32, I32, I32, I64, I32],
    results: &[I32],
};
const BIND_NULL: Export = Export {
    name: "sqlite3_bind_null",
    params: &[I32, I32],
    results: &[I32],
};
const COLUMN_INT64: Export = Export {
    name: "sqlite3_column_int64",
    params: &[I32, I32],
    results: &[I64],
};
const COLUMN_DOUBLE: Export = Export {
    name: "sqlite3_column_double",
    params: &[I32, I32],
    results: &[F64],
};
const COLUMN_TEXT: Export = Export {
    name: "sqlite3_column_text",
    params: &[I32, I32],
    results: &[I32],
};
const COLUMN_BLOB: Export = Export {
    name: "sqlite3_column_blob",
    params: &[I32, I32],
    results: &[I32],
};
const COLUMN_BYTES: Export = Export {
    name: "sqlite3_column_bytes",
    params: &[I32, I32],
    results: &[I32],
};
const COLUMN_TYPE: Export = Export {
    name: "sqlite3_column_type",
    params: &[I32, I32],
    results: &[I32],
};
const COLUMN_COUNT: Export = Export {
    name: "sqlite3_column_count",
    params: &[I32],
    results: &[I32],
};

const MEMORY: &str = "memory";
const MALLOC_DESTRUCTOR: &str = "malloc_destructor";

/// Exports of one guest instance, resolved and signature-checked once.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GuestApi {
    pub memory: Memory,
    /// Destructor id handing ownership of a staged buffer to the guest.
    pub destructor: i32,
    pub malloc: Func,
    pub free: Func,
    pub open: Func,
    pub close: Func,
    pub prepare: Func,
    pub exec: Func,
    pub errmsg: Func,
    pub finalize: Func,
    pub reset: Func,
    pub step: Func,
    pub bind_int64: Func,
    pub bind_double: Func,
    pub bind_text64: Func,
    pub bind_blob64: Func,
    pub bind_null: Func,
    pub column_int64: Func,
    pub column_double: Func,
    pub column_text: Func,
    pub column_blob: Func,
    pub column_bytes: Func,
    pub column_type: Func,
    pub column_count: Func,
}

impl GuestApi {
    /// Resolves every export the bridge calls.
    ///
    /// Memory is checked first, then the destructor global, then the
    /// functions in table order; the first missing one is reported.
    pub fn resolve(store: &mut Store<GuestState>, instance: &Instance) -> Result<Self> {
        let memory = instance
            .get_memory(&mut *store, MEMORY)
            .ok_or_else(|| Error::NoMemory(MEMORY.to_string()))?;
        let destructor = match instance
            .get_global(&mut *store, MALLOC_DESTRUCTOR)
            .map(|global| global.get(&mut *store))
        {
            Some(Val::I32(id)) => id,
            _ => return Err(Error::NoGlobal(MALLOC_DESTRUCTOR.to_string())),
        };

        let mut func = |export: &Export| lookup(store, instance, export);
        Ok(Self {
            memory,
            destructor,
            malloc: func(&MALLOC)?,
            free: func(&FREE)?,
            open: func(&OPEN)?,
            close: func(&CLOSE)?,
            prepare: func(&PREPARE)?,
            exec: func(&EXEC)?,
            errmsg: func(&ERRMSG)?,
            finalize: func(&FINALIZE)?,
            reset: func(&RESET)?,
            step: func(&STEP)?,
            bind_int64: func(&BIND_INT64)?,
            bind_double: func(&BIND_DOUBLE)?,
            bind_text64: func(&BIND_TEXT64)?,
            bind_blob64: func(&BIND_BLOB64)?,
            bind_null: func(&BIND_NULL)?,
            column_int64: func(&COLUMN_INT64)?,
            column_double: func(&COLUMN_DOUBLE)?,
            column_text: func(&COLUMN_TEXT)?,
            column_blob: func(&COLUMN_BLOB)?,
            column_bytes: func(&COLUMN_BYTES)?,
            column_type: func(&COLUMN_TYPE)?,
            column_count: func(&COLUMN_COUNT)?,
        })
    }
}

fn lookup(store: &mut Store<GuestState>, instance: &Instance, export: &Export) -> Result<Func> {
    let func = instance
        .get_func(&mut *store, export.name)
        .ok_or_else(|| Error::NoFunc(export.name.to_string()))?;
    let ty = func.ty(&*store);
    let params: Vec<_> = ty.params().map(|p| Ty::of(&p)).collect();
    let results: Vec<_> = ty.results().map(|r| Ty::of(&r)).collect();
    let expected = |tys: &[Ty]| tys.iter().copied().map(Some).collect::<Vec<_>>();
    if params != expected(export.params) || results != expected(export.results) {
        return Err(Error::NoFunc(format!(
            "{} (signature mismatch: expected {:?} -> {:?}, found {ty:?})",
            export.name, export.params, export.results
        )));
    }
    Ok(func)
}
