//! Compiles the guest artifact and mints per-connection instances.
//!
//! A [`ModuleRuntime`] owns at most one compiled artifact per [`Strategy`].
//! Compilation runs on first use and its outcome, failure included, is kept
//! for the runtime's lifetime. Every [`GuestInstance`] is a fresh store with
//! its own linear memory, so connections never share guest state.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use wasmtime::{
    Config, Engine, Instance, InstancePre, Linker, Module, Store, StoreContextMut,
    StoreLimits, StoreLimitsBuilder, Trap, UpdateDeadline,
};
use wasmtime_wasi::preview1::{self as p1, WasiP1Ctx};
use wasmtime_wasi::WasiCtxBuilder;

use crate::cancel::CancelToken;
use crate::config::{RuntimeConfig, Strategy};
use crate::error::{Error, Result};

/// Pulley target matching the host's pointer width.
const PULLEY_TARGET: &str = if cfg!(target_pointer_width = "64") {
    "pulley64"
} else {
    "pulley32"
};

/// Reactor initializer run once per instance when the guest exports it.
const INITIALIZE: &str = "_initialize";

/// Host-side state carried by every guest store.
pub struct GuestState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
    cancel: CancelToken,
}

impl GuestState {
    fn new(config: &RuntimeConfig) -> Self {
        let mut limits = StoreLimitsBuilder::new();
        if let Some(bytes) = config.max_memory_bytes {
            limits = limits.memory_size(bytes);
        }
        Self {
            wasi: WasiCtxBuilder::new().inherit_stderr().build_p1(),
            limits: limits.build(),
            cancel: CancelToken::new(),
        }
    }

    /// The WASI preview 1 context of this instance.
    pub fn wasi(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    pub(crate) const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Links the host functions a guest imports.
///
/// The guest's file system shim and any other host services plug in here.
pub trait HostImports: Send + Sync {
    /// Defines this provider's imports in `linker`.
    ///
    /// # Errors
    ///
    /// Returns an error if a definition clashes with an existing one.
    fn link(&self, linker: &mut Linker<GuestState>) -> wasmtime::Result<()>;
}

/// WASI preview 1, sandboxed: no preopened directories, no inherited
/// environment, stderr only.
#[derive(Debug, Clone, Copy, Default)]
pub struct WasiImports;

impl HostImports for WasiImports {
    fn link(&self, linker: &mut Linker<GuestState>) -> wasmtime::Result<()> {
        p1::add_to_linker_sync(linker, GuestState::wasi)
    }
}

/// Drives epoch interruption for one engine until dropped.
struct Ticker {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    fn spawn(engine: &Engine, interval: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new()
            .name("guestdb-epoch".to_string())
            .spawn({
                let engine = engine.clone();
                let stop = Arc::clone(&stop);
                move || {
                    while !stop.load(Ordering::Acquire) {
                        thread::sleep(interval);
                        engine.increment_epoch();
                    }
                }
            })
            .map_err(|e| Error::Compile(format!("spawning epoch ticker: {e}")))?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("epoch ticker thread panicked");
            }
        }
    }
}

/// A compiled, linked artifact ready for instantiation.
pub(crate) struct Compiled {
    engine: Engine,
    pre: InstancePre<GuestState>,
    ticks: bool,
    _ticker: Option<Ticker>,
}

/// Compiles the guest artifact and creates isolated instances of it.
///
/// The runtime is an explicit value owned by the caller. It is `Send + Sync`;
/// share it by reference or in an `Arc` to instantiate from many threads.
pub struct ModuleRuntime {
    config: RuntimeConfig,
    imports: Arc<dyn HostImports>,
    artifacts: [OnceLock<Result<Arc<Compiled>>>; 2],
    instances: AtomicU64,
    compilations: AtomicUsize,
}

impl ModuleRuntime {
    /// Creates a runtime linking WASI preview 1 into the guest.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_imports(config, Arc::new(WasiImports))
    }

    /// Creates a runtime with a custom import provider.
    #[must_use]
    pub fn with_imports(config: RuntimeConfig, imports: Arc<dyn HostImports>) -> Self {
        Self {
            config,
            imports,
            artifacts: [OnceLock::new(), OnceLock::new()],
            instances: AtomicU64::new(0),
            compilations: AtomicUsize::new(0),
        }
    }

    /// The configuration this runtime was created with.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The strategy used by [`instantiate`](Self::instantiate).
    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        self.config.strategy()
    }

    /// Number of compilations attempted so far, across both strategies.
    #[must_use]
    pub fn compile_count(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    /// Compiles the artifact for `strategy` if that has not happened yet.
    ///
    /// # Errors
    ///
    /// Returns the compile or link failure. A failure is cached and returned
    /// again on every later call for the same strategy.
    pub fn compile(&self, strategy: Strategy) -> Result<()> {
        self.artifact(strategy).map(drop)
    }

    /// Creates a new instance under the configured strategy.
    ///
    /// # Errors
    ///
    /// See [`instantiate_with`](Self::instantiate_with).
    pub fn instantiate(&self) -> Result<GuestInstance> {
        self.instantiate_with(self.strategy())
    }

    /// Creates a new, independent instance under `strategy`.
    ///
    /// # Errors
    ///
    /// Returns the cached compile failure, or [`Error::Instantiate`] if the
    /// VM rejects the instance (memory limits, a trapping initializer).
    pub fn instantiate_with(&self, strategy: Strategy) -> Result<GuestInstance> {
        let artifact = self.artifact(strategy)?;
        let mut store = Store::new(&artifact.engine, GuestState::new(&self.config));
        store.limiter(|state| &mut state.limits);
        if artifact.ticks {
            store.set_epoch_deadline(1);
            store.epoch_deadline_callback(|ctx: StoreContextMut<'_, GuestState>| {
                if ctx.data().cancel.is_cancelled() {
                    Err(Trap::Interrupt.into())
                } else {
                    Ok(UpdateDeadline::Continue(1))
                }
            });
        }

        // every request takes a number, failed ones included
        let n = self.instances.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("sqlite3-{n}");
        let instance = artifact
            .pre
            .instantiate(&mut store)
            .map_err(|e| Error::Instantiate(format!("{name}: {}", describe(&e))))?;
        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, INITIALIZE) {
            init.call(&mut store, ()).map_err(|e| {
                Error::Instantiate(format!("{name}: {INITIALIZE}: {}", describe(&e)))
            })?;
        }
        debug!("instantiated {name} ({strategy})");
        Ok(GuestInstance {
            name,
            strategy,
            store,
            instance,
            artifact,
        })
    }

    fn artifact(&self, strategy: Strategy) -> Result<Arc<Compiled>> {
        self.artifacts[strategy.slot()]
            .get_or_init(|| self.build(strategy))
            .clone()
    }

    fn build(&self, strategy: Strategy) -> Result<Arc<Compiled>> {
        self.compilations.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let compiled = self.try_build(strategy);
        match &compiled {
            Ok(_) => debug!("compiled guest ({strategy}) in {:?}", started.elapsed()),
            Err(e) => warn!("compiling guest ({strategy}) failed: {e}"),
        }
        compiled.map(Arc::new)
    }

    fn try_build(&self, strategy: Strategy) -> Result<Compiled> {
        let binary = self.config.load_binary()?;
        let interval = self.config.epoch_interval();

        let mut config = Config::new();
        config.epoch_interruption(interval.is_some());
        if strategy == Strategy::Interpreted {
            config
                .target(PULLEY_TARGET)
                .map_err(|e| Error::Compile(describe(&e)))?;
        }
        let engine = Engine::new(&config).map_err(|e| Error::Compile(describe(&e)))?;
        let module =
            Module::new(&engine, &*binary).map_err(|e| Error::Compile(describe(&e)))?;

        let mut linker = Linker::new(&engine);
        self.imports
            .link(&mut linker)
            .map_err(|e| Error::Instantiate(describe(&e)))?;
        if self.config.trap_unknown_imports {
            linker
                .define_unknown_imports_as_traps(&module)
                .map_err(|e| Error::Instantiate(describe(&e)))?;
        }
        let pre = linker
            .instantiate_pre(&module)
            .map_err(|e| Error::Instantiate(describe(&e)))?;

        let ticker = interval
            .map(|interval| Ticker::spawn(&engine, interval))
            .transpose()?;
        Ok(Compiled {
            engine,
            pre,
            ticks: ticker.is_some(),
            _ticker: ticker,
        })
    }
}

impl fmt::Debug for ModuleRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRuntime")
            .field("config", &self.config)
            .field("instances", &self.instances.load(Ordering::Relaxed))
            .field("compilations", &self.compile_count())
            .finish_non_exhaustive()
    }
}

/// One isolated instance of the guest, ready to be opened as a connection.
pub struct GuestInstance {
    pub(crate) name: String,
    pub(crate) strategy: Strategy,
    pub(crate) store: Store<GuestState>,
    pub(crate) instance: Instance,
    /// Keeps the engine's epoch ticker alive while the instance exists.
    pub(crate) artifact: Arc<Compiled>,
}

impl GuestInstance {
    /// Unique name of this instance, `sqlite3-<n>`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Strategy the instance executes under.
    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        self.strategy
    }
}

impl fmt::Debug for GuestInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestInstance")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

/// Renders a wasmtime error with its full context chain.
pub(crate) fn describe(err: &wasmtime::Error) -> String {
    format!("{err:#}")
}
