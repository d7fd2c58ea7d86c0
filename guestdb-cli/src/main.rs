//! guestdb CLI: run SQL against a WebAssembly `SQLite` build.
//!
//! Runs the statement under the compiled strategy, the interpreted one, or
//! both, and fails if the strategies disagree or the output does not match
//! `--expect`.

use std::fmt::Write as _;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use eyre::{bail, ensure, WrapErr};
use guestdb::{Connection, ModuleRuntime, RuntimeConfig, StepResult, Strategy, Value};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "guestdb", version)]
#[command(about = "Run SQL against a WebAssembly SQLite build")]
struct Cli {
    /// Guest binary (.wasm or .wat). Overrides the path in `--config`.
    #[arg(long, env = "GUESTDB_SQLITE_WASM")]
    wasm: Option<PathBuf>,

    /// JSON runtime configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database to open inside the guest.
    #[arg(long, default_value = ":memory:")]
    database: String,

    /// Statement to run.
    #[arg(long, default_value = "SELECT printf('%f', 2.5)")]
    sql: String,

    /// Execution strategy.
    #[arg(long, value_enum, default_value_t = Mode::Both)]
    mode: Mode,

    /// Expected output, rows separated by newlines and columns by `|`.
    #[arg(long)]
    expect: Option<String>,

    /// Resolve imports the host does not provide to trapping stubs.
    #[arg(long)]
    trap_unknown_imports: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Compiled,
    Interpreted,
    Both,
}

impl Mode {
    const fn strategies(self) -> &'static [Strategy] {
        match self {
            Self::Compiled => &[Strategy::Compiled],
            Self::Interpreted => &[Strategy::Interpreted],
            Self::Both => &Strategy::ALL,
        }
    }
}

fn main() -> eyre::Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let runtime = ModuleRuntime::new(runtime_config(&cli)?);
    let mut outputs: Vec<(Strategy, String)> = Vec::new();
    for &strategy in cli.mode.strategies() {
        let output = run(&runtime, strategy, &cli.database, &cli.sql)
            .wrap_err_with(|| format!("running under the {strategy} strategy"))?;
        info!(%strategy, rows = output.lines().count(), "statement finished");
        outputs.push((strategy, output));
    }

    let Some((first, output)) = outputs.first() else {
        bail!("no strategy selected");
    };
    for (strategy, other) in &outputs[1..] {
        ensure!(
            other == output,
            "{first} and {strategy} strategies disagree:\n{output}\n---\n{other}"
        );
    }
    if let Some(expected) = &cli.expect {
        ensure!(
            output == expected,
            "unexpected output:\n{output}\nexpected:\n{expected}"
        );
    }
    println!("{output}");
    Ok(())
}

fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    // guestdb logs through the `log` facade
    tracing_log::LogTracer::init()?;
    Ok(())
}

fn runtime_config(cli: &Cli) -> eyre::Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("reading {}", path.display()))?;
            RuntimeConfig::from_json(&json)?
        }
        None => RuntimeConfig::default(),
    };
    if let Some(wasm) = &cli.wasm {
        config = config.with_path(wasm);
    }
    if cli.trap_unknown_imports {
        config = config.with_trap_unknown_imports(true);
    }
    debug!(?config, "runtime configuration");
    Ok(config)
}

fn run(
    runtime: &ModuleRuntime,
    strategy: Strategy,
    database: &str,
    sql: &str,
) -> eyre::Result<String> {
    let instance = runtime.instantiate_with(strategy)?;
    let conn = Connection::open_instance(instance, database)?;
    debug!(instance = conn.instance_name(), "opened {database}");

    let mut stmt = conn.prepare(sql)?;
    let columns = stmt.column_count()?;
    let mut rows = Vec::new();
    while stmt.step()? == StepResult::Row {
        let row = (0..columns)
            .map(|col| stmt.column_value(col).map(|v| render(&v)))
            .collect::<guestdb::Result<Vec<_>>>()?;
        rows.push(row.join("|"));
    }
    stmt.close()?;
    drop(stmt);
    conn.close()?;
    Ok(rows.join("\n"))
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Text(v) => v.clone(),
        Value::Blob(v) => v.iter().fold(String::from("x'"), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        }) + "'",
    }
}
