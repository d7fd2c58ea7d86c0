//! Compilation, instantiation and export resolution against the mock guest.

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::thread;

use guestdb::{
    Connection, Error, ErrorCode, ExtendedErrorCode, ModuleRuntime, RuntimeConfig, Strategy,
};
use test_case::test_case;

const MOCK_GUEST: &str = include_str!("fixtures/mock_guest.wat");

fn runtime_for(wat: &str, strategy: Strategy) -> ModuleRuntime {
    ModuleRuntime::new(
        RuntimeConfig::from_binary(wat.as_bytes())
            .with_interpreter(strategy == Strategy::Interpreted),
    )
}

#[test]
fn test_compile_failure_is_cached() {
    let runtime = ModuleRuntime::new(RuntimeConfig::from_binary(&b"not a wasm module"[..]));
    for _ in 0..3 {
        assert!(matches!(
            runtime.compile(Strategy::Compiled),
            Err(Error::Compile(_))
        ));
    }
    assert!(matches!(
        Connection::open(&runtime, ":memory:"),
        Err(Error::Compile(_))
    ));
    assert_eq!(runtime.compile_count(), 1);
}

#[test]
fn test_one_artifact_per_strategy() {
    let runtime = runtime_for(MOCK_GUEST, Strategy::Compiled);
    runtime.compile(Strategy::Compiled).expect("compile");
    runtime.compile(Strategy::Compiled).expect("compile");
    assert_eq!(runtime.compile_count(), 1);

    let instance = runtime
        .instantiate_with(Strategy::Interpreted)
        .expect("instantiate");
    assert_eq!(instance.strategy(), Strategy::Interpreted);
    assert_eq!(runtime.compile_count(), 2);
}

#[test]
fn test_binary_from_path() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(MOCK_GUEST.as_bytes()).expect("write guest");

    let json = serde_json::json!({
        "path": file.path(),
        "interpreter": true,
        "epoch_interval_ms": 0,
    })
    .to_string();
    let config = RuntimeConfig::from_json(&json).expect("config");
    assert_eq!(config.strategy(), Strategy::Interpreted);
    assert_eq!(config.epoch_interval(), None);

    let runtime = ModuleRuntime::new(config);
    let conn = Connection::open(&runtime, ":memory:").expect("open");
    assert_eq!(conn.strategy(), Strategy::Interpreted);
    conn.execute_batch("CREATE TABLE t (x)").expect("exec");
}

#[test]
fn test_missing_binary() {
    let runtime = ModuleRuntime::new(RuntimeConfig::default());
    assert_eq!(runtime.compile(Strategy::Compiled).unwrap_err(), Error::NoBinary);

    let dir = tempfile::tempdir().expect("temp dir");
    let runtime = ModuleRuntime::new(RuntimeConfig::from_path(dir.path().join("missing.wasm")));
    assert!(matches!(
        runtime.compile(Strategy::Compiled),
        Err(Error::Io(_))
    ));
}

#[test_case(Strategy::Compiled ; "compiled")]
#[test_case(Strategy::Interpreted ; "interpreted")]
fn test_concurrent_instantiation(strategy: Strategy) {
    let runtime = Arc::new(runtime_for(MOCK_GUEST, strategy));
    let workers: Vec<_> = (0..16)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            thread::spawn(move || {
                (0..4)
                    .map(|_| {
                        runtime
                            .instantiate()
                            .expect("instantiate")
                            .name()
                            .to_string()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut names = HashSet::new();
    for worker in workers {
        for name in worker.join().expect("worker thread") {
            assert!(name.starts_with("sqlite3-"), "{name}");
            assert!(names.insert(name));
        }
    }
    assert_eq!(names.len(), 64);
    assert_eq!(runtime.compile_count(), 1);
}

#[test]
fn test_memory_limit() {
    let runtime = ModuleRuntime::new(
        RuntimeConfig::from_binary(MOCK_GUEST.as_bytes()).with_max_memory(65536),
    );
    assert!(matches!(runtime.instantiate(), Err(Error::Instantiate(_))));
    assert!(matches!(runtime.instantiate(), Err(Error::Instantiate(_))));

    // failed requests still consume instance numbers
    let debug = format!("{runtime:?}");
    assert!(debug.contains("instances: 2"), "{debug}");
    assert_eq!(runtime.compile_count(), 1);
}

#[test]
fn test_missing_memory() {
    let runtime = runtime_for("(module)", Strategy::Compiled);
    assert_eq!(
        Connection::open(&runtime, ":memory:").unwrap_err(),
        Error::NoMemory("memory".into())
    );
}

#[test]
fn test_missing_destructor_global() {
    let runtime = runtime_for(r#"(module (memory (export "memory") 1))"#, Strategy::Compiled);
    assert_eq!(
        Connection::open(&runtime, ":memory:").unwrap_err(),
        Error::NoGlobal("malloc_destructor".into())
    );
}

#[test]
fn test_missing_function() {
    let wat = MOCK_GUEST.replace(
        r#"(export "sqlite3_step")"#,
        r#"(export "sqlite3_step_v2")"#,
    );
    let runtime = runtime_for(&wat, Strategy::Compiled);
    assert_eq!(
        Connection::open(&runtime, ":memory:").unwrap_err(),
        Error::NoFunc("sqlite3_step".into())
    );
}

#[test]
fn test_unknown_imports() {
    let wat = MOCK_GUEST.replacen(
        "(module",
        r#"(module (import "env" "host_sleep" (func $host_sleep (param i32)))"#,
        1,
    );

    let runtime = runtime_for(&wat, Strategy::Compiled);
    assert!(matches!(runtime.instantiate(), Err(Error::Instantiate(_))));

    let runtime = ModuleRuntime::new(
        RuntimeConfig::from_binary(wat.as_bytes()).with_trap_unknown_imports(true),
    );
    let conn = Connection::open(&runtime, ":memory:").expect("open");
    conn.close().expect("close");
}

#[test_case(Strategy::Compiled ; "compiled")]
#[test_case(Strategy::Interpreted ; "interpreted")]
fn test_trap_abandons_connection(strategy: Strategy) {
    let head = "(func (export \"sqlite3_column_count\") (param $stmt i32) (result i32)\n";
    let wat = MOCK_GUEST.replace(
        &format!("{head}    (i32.const 8))"),
        &format!("{head}    unreachable)"),
    );
    let runtime = runtime_for(&wat, strategy);
    let conn = Connection::open(&runtime, ":memory:").expect("open");
    let stmt = conn.prepare("SELECT 1").expect("prepare");

    match stmt.column_count() {
        Err(Error::Trap(message)) => assert!(message.contains("unreachable"), "{message}"),
        other => panic!("expected a trap, got {other:?}"),
    }
    assert!(conn.is_abandoned());
    assert_eq!(stmt.column_count().unwrap_err(), Error::Abandoned);
}

#[test_case(Strategy::Compiled ; "compiled")]
#[test_case(Strategy::Interpreted ; "interpreted")]
fn test_wasi_imports_linked(strategy: Strategy) {
    let wat = MOCK_GUEST.replacen(
        "(module",
        r#"(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "clock_time_get"
    (func $clock_time_get (param i32 i64 i32) (result i32)))"#,
        1,
    );
    let runtime = runtime_for(&wat, strategy);
    let conn = Connection::open(&runtime, ":memory:").expect("open with WASI imports");
    conn.execute_batch("CREATE TABLE t (x)").expect("exec");
    conn.close().expect("close");
}

#[test]
fn test_extended_codes_need_open_flag() {
    // a guest that ignores the open flags reports only the primary code
    let wat = MOCK_GUEST.replace("(i32.const 0x02000000)", "(i32.const 0)");
    let runtime = runtime_for(&wat, Strategy::Compiled);
    let conn = Connection::open(&runtime, ":memory:").expect("open");
    let mut stmt = conn.prepare("EINSERT INTO t VALUES (1)").expect("prepare");
    match stmt.step().unwrap_err() {
        Error::Sqlite(err) => {
            assert_eq!(err.code, ErrorCode::CONSTRAINT);
            assert_eq!(err.extended, ExtendedErrorCode(19));
        }
        other => panic!("expected an engine error, got {other:?}"),
    }

    let runtime = runtime_for(MOCK_GUEST, Strategy::Compiled);
    let conn = Connection::open(&runtime, ":memory:").expect("open");
    let mut stmt = conn.prepare("EINSERT INTO t VALUES (1)").expect("prepare");
    match stmt.step().unwrap_err() {
        Error::Sqlite(err) => {
            assert_eq!(err.code, ErrorCode::CONSTRAINT);
            assert_eq!(err.extended, ExtendedErrorCode(2067));
        }
        other => panic!("expected an engine error, got {other:?}"),
    }
}
