//! WASM runtime implementation using wasmtime.
//!
//! [`WasmRuntime`] lives on the loading side: it owns the engine and compiles
//! modules. [`ProcessorInstance`] lives on the real-time thread: it is built
//! from an already compiled module and only calls into it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use wasmtime::*;

use super::config::{WasiCapabilities, WasmConfig};
use super::host_functions;
use super::memory::LinearMemory;
use super::module::{
    MemoryBinding, ProcessingModule, ALLOC_EXPORT, DEALLOC_EXPORT, INIT_EXPORT, MEMORY_EXPORT,
    PROCESS_EXPORT,
};
use crate::block::BlockLayout;
use crate::diagnostics::DiagnosticSink;
use crate::error::{InitError, LoadError, Result, RuntimeError};
use crate::processor::InitParams;

/// Host state for the store, containing WASI preview1 context.
pub struct HostState {
    preview1: wasmtime_wasi::preview1::WasiP1Ctx,
    limits: StoreLimits,
    pub(crate) memory: Option<LinearMemory>,
    pub(crate) diagnostics: DiagnosticSink,
    deadline: Instant,
    cancel: Arc<AtomicBool>,
}

impl HostState {
    /// Get the preview1 context.
    fn preview1(&mut self) -> &mut wasmtime_wasi::preview1::WasiP1Ctx {
        &mut self.preview1
    }
}

/// Interval between engine epoch increments.
const EPOCH_TICK: Duration = Duration::from_millis(1);

/// Upper clamp for configured deadlines.
const MAX_DEADLINE_MS: u64 = 24 * 60 * 60 * 1000;

/// Thread that advances the engine epoch so running stores reach their
/// deadline checks. Stopped and joined when the last owner drops it.
pub(crate) struct EpochClock {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochClock {
    fn start(engine: Engine) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("worklet-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| LoadError::Runtime(format!("epoch thread: {}", e)))?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochClock {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Engine owner; compiles modules on the loading side.
#[derive(Clone)]
pub struct WasmRuntime {
    engine: Engine,
    config: WasmConfig,
    clock: Arc<EpochClock>,
}

impl WasmRuntime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: WasmConfig) -> Result<Self> {
        if config.max_init_time_ms == 0 || config.max_block_time_ms == 0 {
            return Err(LoadError::Config("execution deadlines must be non-zero".to_string()));
        }

        let mut engine_config = Config::new();

        engine_config.cranelift_opt_level(match config.optimization_level {
            0 => OptLevel::None,
            1 => OptLevel::Speed,
            _ => OptLevel::SpeedAndSize,
        });

        // Relaxed SIMD depends on SIMD
        if !config.enable_simd {
            engine_config.wasm_relaxed_simd(false);
        }
        engine_config.wasm_simd(config.enable_simd);

        // Shared memories belong to the threads proposal
        engine_config.wasm_threads(config.enable_threads);

        if config.fuel_per_block.is_some() {
            engine_config.consume_fuel(true);
        }

        // Deadlines are always enforced, metered or not
        engine_config.epoch_interruption(true);

        let engine = Engine::new(&engine_config)
            .map_err(|e| LoadError::Runtime(format!("engine creation failed: {}", e)))?;
        let clock = Arc::new(EpochClock::start(engine.clone())?);

        Ok(Self { engine, config, clock })
    }

    /// Decode, validate and compile a module.
    ///
    /// WAT text is accepted and converted to binary here so that nothing
    /// downstream needs a text decoder.
    pub fn compile(&self, name: &str, bytes: &[u8]) -> Result<ProcessingModule> {
        let binary = wat::parse_bytes(bytes)
            .map_err(|e| LoadError::InvalidModule {
                name: name.to_string(),
                reason: e.to_string(),
            })?
            .into_owned();

        Module::validate(&self.engine, &binary).map_err(|e| LoadError::InvalidModule {
            name: name.to_string(),
            reason: format!("validation failed: {}", e),
        })?;

        let module = Module::new(&self.engine, &binary).map_err(|e| LoadError::InvalidModule {
            name: name.to_string(),
            reason: format!("compilation failed: {}", e),
        })?;

        ProcessingModule::from_compiled(name, module, binary, self.clock.clone())
    }

    /// Get the engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get the configuration.
    pub fn config(&self) -> &WasmConfig {
        &self.config
    }
}

/// A live instance of a processing module, with its sample buffers allocated.
pub struct ProcessorInstance {
    store: Store<HostState>,
    process: TypedFunc<(i32, i32, i32, i32), i32>,
    dealloc: Option<TypedFunc<(i32, i32), ()>>,
    memory: LinearMemory,
    in_ptr: i32,
    out_ptr: i32,
    buffer_bytes: i32,
    layout: BlockLayout,
    fuel_per_block: Option<u64>,
    max_block_time_ms: u64,
    _clock: Arc<EpochClock>,
}

impl ProcessorInstance {
    /// Instantiate the module and run its one-time setup.
    ///
    /// Uses only what `params` carries: no fetching, no compiling, no decoding.
    /// Instantiation, `init` and buffer allocation share one deadline of
    /// `params.wasm.max_init_time_ms`.
    pub fn new(params: &InitParams, diagnostics: DiagnosticSink) -> std::result::Result<Self, InitError> {
        Self::cancellable(params, diagnostics, Arc::new(AtomicBool::new(false)))
    }

    /// Like [`ProcessorInstance::new`], but any running module code is
    /// interrupted as soon as `cancel` is set.
    pub(crate) fn cancellable(
        params: &InitParams,
        diagnostics: DiagnosticSink,
        cancel: Arc<AtomicBool>,
    ) -> std::result::Result<Self, InitError> {
        let module = &params.module;
        let engine = module.module().engine();
        let init_ms = params.wasm.max_init_time_ms;

        let host_state = build_host_state(&params.wasm.capabilities, params.wasm.max_memory, diagnostics, cancel);
        let mut store = Store::new(engine, host_state);
        store.limiter(|state| &mut state.limits);
        store.epoch_deadline_callback(check_deadline);
        arm_deadline(&mut store, init_ms);

        let fuel_per_block = params.wasm.fuel_per_block;
        refuel(&mut store, fuel_per_block)?;

        let mut linker: Linker<HostState> = Linker::new(engine);
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state| state.preview1())
            .map_err(|e| InitError::Instantiate(format!("WASI link failed: {}", e)))?;
        host_functions::register(&mut linker).map_err(|e| InitError::Instantiate(e.to_string()))?;

        let imported = match module.memory_binding() {
            MemoryBinding::Exported => None,
            MemoryBinding::ImportedShared { module: ns, name, .. } => {
                let shared = params
                    .memory
                    .as_ref()
                    .and_then(|handle| handle.memory())
                    .ok_or(InitError::NoMemory)?;
                linker
                    .define(&store, ns, name, shared.clone())
                    .map_err(|e| InitError::Instantiate(e.to_string()))?;
                Some(LinearMemory::Shared(shared))
            }
            MemoryBinding::ImportedPrivate { module: ns, name, ty } => {
                let memory = Memory::new(&mut store, ty.clone())
                    .map_err(|e| InitError::Instantiate(format!("memory creation failed: {}", e)))?;
                linker
                    .define(&store, ns, name, memory)
                    .map_err(|e| InitError::Instantiate(e.to_string()))?;
                Some(LinearMemory::Private(memory))
            }
        };

        let instance = linker
            .instantiate(&mut store, module.module())
            .map_err(|e| init_failure(e, init_ms, InitError::Instantiate))?;

        let memory = match imported {
            Some(memory) => memory,
            None => instance
                .get_memory(&mut store, MEMORY_EXPORT)
                .map(LinearMemory::Private)
                .ok_or(InitError::NoMemory)?,
        };
        store.data_mut().memory = Some(memory.clone());

        let process = instance
            .get_typed_func::<(i32, i32, i32, i32), i32>(&mut store, PROCESS_EXPORT)
            .map_err(|e| InitError::Export(PROCESS_EXPORT, e.to_string()))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, ALLOC_EXPORT)
            .map_err(|e| InitError::Export(ALLOC_EXPORT, e.to_string()))?;
        let dealloc = if module.has_dealloc() {
            Some(
                instance
                    .get_typed_func::<(i32, i32), ()>(&mut store, DEALLOC_EXPORT)
                    .map_err(|e| InitError::Export(DEALLOC_EXPORT, e.to_string()))?,
            )
        } else {
            None
        };

        let layout = params.layout;
        if module.has_init() {
            let init = instance
                .get_typed_func::<(i32, i32, i32), i32>(&mut store, INIT_EXPORT)
                .map_err(|e| InitError::Export(INIT_EXPORT, e.to_string()))?;
            let status = init
                .call(
                    &mut store,
                    (params.sample_rate as i32, layout.channels as i32, layout.frames as i32),
                )
                .map_err(|e| init_failure(e, init_ms, InitError::Trap))?;
            if status != 0 {
                return Err(InitError::Status(status));
            }
        }

        let buffer_bytes = i32::try_from(layout.samples() * 4)
            .map_err(|_| InitError::Alloc(format!("block of {} samples is too large", layout.samples())))?;
        let in_ptr = allocate(&mut store, &alloc, &memory, buffer_bytes, fuel_per_block, init_ms)?;
        let out_ptr = allocate(&mut store, &alloc, &memory, buffer_bytes, fuel_per_block, init_ms)?;

        Ok(Self {
            store,
            process,
            dealloc,
            memory,
            in_ptr,
            out_ptr,
            buffer_bytes,
            layout,
            fuel_per_block,
            max_block_time_ms: params.wasm.max_block_time_ms,
            _clock: module.clock().clone(),
        })
    }

    /// Run one block through the module's `process` export.
    ///
    /// `input` and `output` hold `layout.samples()` planar samples each.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> std::result::Result<(), RuntimeError> {
        if let Some(fuel) = self.fuel_per_block {
            self.store.set_fuel(fuel).map_err(|e| RuntimeError::Trap(e.to_string()))?;
        }

        self.memory.write_samples(&mut self.store, self.in_ptr as usize, input)?;
        arm_deadline(&mut self.store, self.max_block_time_ms);

        let status = self
            .process
            .call(
                &mut self.store,
                (
                    self.in_ptr,
                    self.out_ptr,
                    self.layout.frames as i32,
                    self.layout.channels as i32,
                ),
            )
            .map_err(|e| classify_trap(e, self.max_block_time_ms))?;
        if status != 0 {
            return Err(RuntimeError::Status(status));
        }

        self.memory.read_samples(&self.store, self.out_ptr as usize, output)
    }

    /// Block layout the buffers were sized for.
    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    /// Byte offsets of the input and output buffers.
    pub fn buffer_offsets(&self) -> (i32, i32) {
        (self.in_ptr, self.out_ptr)
    }

    /// Remaining fuel in the current block budget (if metering is enabled).
    pub fn remaining_fuel(&self) -> Option<u64> {
        self.fuel_per_block.and_then(|_| self.store.get_fuel().ok())
    }
}

impl Drop for ProcessorInstance {
    fn drop(&mut self) {
        if let Some(dealloc) = self.dealloc.take() {
            // Best effort; the store is about to go away regardless
            let _ = refuel(&mut self.store, self.fuel_per_block);
            arm_deadline(&mut self.store, self.max_block_time_ms);
            let _ = dealloc.call(&mut self.store, (self.in_ptr, self.buffer_bytes));
            let _ = dealloc.call(&mut self.store, (self.out_ptr, self.buffer_bytes));
        }
    }
}

fn build_host_state(
    caps: &WasiCapabilities,
    max_memory: usize,
    diagnostics: DiagnosticSink,
    cancel: Arc<AtomicBool>,
) -> HostState {
    let mut builder = wasmtime_wasi::WasiCtxBuilder::new();

    if caps.stdout {
        builder.inherit_stdout();
    }
    if caps.stderr {
        builder.inherit_stderr();
    }
    for (key, value) in &caps.env_vars {
        builder.env(key, value);
    }
    builder.args(&caps.args);

    let preview1 = builder.build_p1();
    let limits = StoreLimitsBuilder::new().memory_size(max_memory).build();

    HostState {
        preview1,
        limits,
        memory: None,
        diagnostics,
        deadline: Instant::now(),
        cancel,
    }
}

/// Start a new wall-clock budget for the next call into the module.
fn arm_deadline(store: &mut Store<HostState>, limit_ms: u64) {
    let limit = Duration::from_millis(limit_ms.min(MAX_DEADLINE_MS));
    store.data_mut().deadline = Instant::now() + limit;
    store.set_epoch_deadline(1);
}

/// Runs on every epoch tick while module code executes.
fn check_deadline(store: StoreContextMut<'_, HostState>) -> wasmtime::Result<UpdateDeadline> {
    let state = store.data();
    if state.cancel.load(Ordering::Acquire) || Instant::now() >= state.deadline {
        return Err(Trap::Interrupt.into());
    }
    Ok(UpdateDeadline::Continue(1))
}

fn init_failure(error: wasmtime::Error, limit_ms: u64, other: fn(String) -> InitError) -> InitError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) => InitError::Deadline(limit_ms),
        _ => other(error.to_string()),
    }
}

fn refuel(store: &mut Store<HostState>, fuel: Option<u64>) -> std::result::Result<(), InitError> {
    if let Some(fuel) = fuel {
        store
            .set_fuel(fuel)
            .map_err(|e| InitError::Instantiate(format!("fuel setup failed: {}", e)))?;
    }
    Ok(())
}

fn allocate(
    store: &mut Store<HostState>,
    alloc: &TypedFunc<i32, i32>,
    memory: &LinearMemory,
    size: i32,
    fuel: Option<u64>,
    limit_ms: u64,
) -> std::result::Result<i32, InitError> {
    refuel(store, fuel)?;
    let ptr = alloc
        .call(&mut *store, size)
        .map_err(|e| init_failure(e, limit_ms, InitError::Alloc))?;

    let in_bounds = ptr > 0 && (ptr as usize).saturating_add(size as usize) <= memory.size_bytes(&*store);
    if !in_bounds {
        return Err(InitError::Alloc(format!("alloc({}) returned unusable offset {}", size, ptr)));
    }
    Ok(ptr)
}

fn classify_trap(error: wasmtime::Error, limit_ms: u64) -> RuntimeError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => RuntimeError::OutOfFuel,
        Some(Trap::Interrupt) => RuntimeError::Deadline(limit_ms),
        _ => RuntimeError::Trap(error.to_string()),
    }
}

/// Number of recent blocks kept for percentiles by default.
pub const DEFAULT_LATENCY_WINDOW: usize = 4096;

/// Rolling latency statistics for processed blocks.
///
/// Count, mean, min and max cover every recorded block. Percentiles and
/// overruns cover the most recent `window` blocks only, so memory stays
/// fixed for sessions of any length.
#[derive(Debug, Clone)]
pub struct LatencyStats {
    recent: VecDeque<u64>,
    window: usize,
    count: usize,
    total_us: u128,
    min_us: u64,
    max_us: u64,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStats {
    /// Create an empty collector with the default window.
    pub fn new() -> Self {
        Self::with_window(DEFAULT_LATENCY_WINDOW)
    }

    /// Create an empty collector keeping the last `window` samples.
    pub fn with_window(window: usize) -> Self {
        let window = window.max(1);
        Self {
            recent: VecDeque::with_capacity(window),
            window,
            count: 0,
            total_us: 0,
            min_us: u64::MAX,
            max_us: 0,
        }
    }

    /// Record one block's processing time in microseconds.
    pub fn record(&mut self, us: u64) {
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(us);

        self.count += 1;
        self.total_us += u128::from(us);
        self.min_us = self.min_us.min(us);
        self.max_us = self.max_us.max(us);
    }

    /// Number of recorded blocks.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Samples currently held for percentiles.
    pub fn window_len(&self) -> usize {
        self.recent.len()
    }

    /// Mean processing time in microseconds.
    pub fn mean_us(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_us as f64 / self.count as f64
    }

    /// Median processing time in microseconds.
    pub fn p50_us(&self) -> u64 {
        self.percentile(50)
    }

    /// 99th percentile processing time in microseconds.
    pub fn p99_us(&self) -> u64 {
        self.percentile(99)
    }

    /// Get a percentile value over the recent window.
    pub fn percentile(&self, p: usize) -> u64 {
        if self.recent.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.recent.iter().copied().collect();
        sorted.sort_unstable();
        let idx = (p * sorted.len() / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Fastest block.
    pub fn min_us(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.min_us
        }
    }

    /// Slowest block.
    pub fn max_us(&self) -> u64 {
        self.max_us
    }

    /// Blocks in the recent window whose processing exceeded `budget_us`.
    pub fn overruns(&self, budget_us: u64) -> usize {
        self.recent.iter().filter(|&&us| us > budget_us).count()
    }

    /// One-line summary.
    pub fn summary(&self) -> String {
        format!(
            "n={} min={}us mean={:.1}us p50={}us p99={}us max={}us",
            self.count(),
            self.min_us(),
            self.mean_us(),
            self.p50_us(),
            self.p99_us(),
            self.max_us()
        )
    }
}

/// Microseconds elapsed since `start`, saturating.
pub(crate) fn elapsed_us(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
}
