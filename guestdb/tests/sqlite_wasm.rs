//! Runs against a real `SQLite` WebAssembly build named by `GUESTDB_SQLITE_WASM`.
//!
//! Ignored by default: `GUESTDB_SQLITE_WASM=sqlite3.wasm cargo test -- --ignored`.

use guestdb::{params, Connection, ModuleRuntime, RuntimeConfig, Strategy, Value};

fn runtime(strategy: Strategy) -> ModuleRuntime {
    let path = std::env::var("GUESTDB_SQLITE_WASM").expect("GUESTDB_SQLITE_WASM must be set");
    ModuleRuntime::new(
        RuntimeConfig::from_path(path)
            .with_interpreter(strategy == Strategy::Interpreted)
            .with_trap_unknown_imports(true),
    )
}

#[test]
#[ignore = "needs GUESTDB_SQLITE_WASM"]
fn test_printf_float() {
    for strategy in Strategy::ALL {
        let runtime = runtime(strategy);
        let conn = Connection::open(&runtime, ":memory:").expect("open");
        let text = conn
            .query_row("SELECT printf('%f', 2.5)", &[], |stmt| stmt.column_text(0))
            .expect("query");
        assert_eq!(text, "2.500000", "{strategy}");
    }
}

#[test]
#[ignore = "needs GUESTDB_SQLITE_WASM"]
fn test_table_round_trip() {
    for strategy in Strategy::ALL {
        let runtime = runtime(strategy);
        let conn = Connection::open(&runtime, ":memory:").expect("open");
        conn.execute_batch("CREATE TABLE t (i INTEGER, f REAL, s TEXT, b BLOB);")
            .expect("create");
        conn.execute(
            "INSERT INTO t VALUES (?1, ?2, ?3, ?4)",
            params![i64::MAX, 2.5, "héllo", vec![0_u8, 1, 2]],
        )
        .expect("insert");

        let row = conn
            .query_row("SELECT i, f, s, b FROM t", &[], |stmt| {
                (0..4).map(|col| stmt.column_value(col)).collect::<Result<Vec<_>, _>>()
            })
            .expect("select");
        assert_eq!(row[0], Value::Integer(i64::MAX));
        assert_eq!(row[1], Value::Float(2.5));
        assert_eq!(row[2], Value::Text("héllo".into()));
        assert_eq!(row[3], Value::Blob(vec![0, 1, 2]));

        let negative_zero = conn
            .query_row("SELECT ?1", params![-0.0], |stmt| stmt.column_f64(0))
            .expect("select");
        assert_eq!(negative_zero.to_bits(), (-0.0_f64).to_bits());

        let err = conn.prepare("SELECT * FROM missing").unwrap_err();
        assert_eq!(err.to_string(), "sqlite3: ERROR: no such table: missing");
    }
}
