//! The isolated sample processor.
//!
//! Runs on the real-time thread. It is handed [`InitParams`] once and turns
//! them into a [`ProcessorInstance`] according to its [`InitPolicy`]; every
//! invocation then consumes one input block and fills one output block.
//!
//! ```text
//! Uninitialized --> Initializing --> Ready
//!                        |
//!                        +--------> Failed (terminal)
//! ```
//!
//! No invocation ever fails: whenever the instance cannot produce a block the
//! output receives the [`FallbackPolicy`] and the continuation stays
//! [`Continuation::KeepAlive`].

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::block::{AudioBlock, BlockLayout};
use crate::config::{FallbackPolicy, InitPolicy};
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::error::{InitError, RuntimeError};
use crate::wasm::{ProcessingModule, ProcessorInstance, SharedMemoryHandle, WasmConfig};

/// Everything the isolated context needs to build its instance.
///
/// Already compiled and allocated on the loading side; nothing here requires
/// network, filesystem, or text decoding to use.
#[derive(Debug, Clone)]
pub struct InitParams {
    /// The compiled module
    pub module: ProcessingModule,
    /// Pre-allocated shared memory, when the module imports one
    pub memory: Option<SharedMemoryHandle>,
    /// Block layout for the session
    pub layout: BlockLayout,
    /// Sample rate passed to `init`
    pub sample_rate: u32,
    /// Instance limits and capabilities
    pub wasm: WasmConfig,
}

/// Lifecycle of the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProcessorState {
    /// Constructed with parameters, no instance yet
    Uninitialized = 0,
    /// Instance construction in progress
    Initializing = 1,
    /// Instance live; blocks go through the module
    Ready = 2,
    /// Construction failed; fallback output forever
    Failed = 3,
}

impl ProcessorState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ProcessorState::Uninitialized,
            1 => ProcessorState::Initializing,
            2 => ProcessorState::Ready,
            _ => ProcessorState::Failed,
        }
    }
}

/// Lock-free view of a processor's state, readable from any thread.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new(state: ProcessorState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    /// Current state.
    pub fn get(&self) -> ProcessorState {
        ProcessorState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ProcessorState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Whether the audio graph should keep the node alive.
///
/// Normalized to a single rule: `KeepAlive` on every invocation until the
/// processor is stopped, regardless of degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Keep invoking
    KeepAlive,
    /// The processor was stopped; further invocations only produce silence
    Finished,
}

impl Continuation {
    /// Boolean form for hosts that expect one.
    pub fn keep_alive(self) -> bool {
        matches!(self, Continuation::KeepAlive)
    }
}

/// Why a block received the fallback output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// Instance not constructed yet
    NotReady,
    /// Initialization failed earlier
    Failed,
    /// The module failed on this block
    Runtime(RuntimeError),
    /// Block layout differs from the processor's
    Layout,
    /// The processor has been stopped
    Stopped,
}

/// What happened to one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The module produced the output
    Processed,
    /// The fallback policy produced the output
    Fallback(FallbackReason),
}

impl BlockOutcome {
    /// Whether the module produced the output.
    pub fn is_processed(&self) -> bool {
        matches!(self, BlockOutcome::Processed)
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReport {
    /// What produced the output
    pub outcome: BlockOutcome,
    /// Keep-alive signal for the audio graph
    pub continuation: Continuation,
    /// Wall time spent in the invocation
    pub elapsed_us: u64,
}

type InitResult = Result<ProcessorInstance, InitError>;

enum Stage {
    Uninitialized(Box<InitParams>),
    Pending {
        rx: flume::Receiver<InitResult>,
        waited: u32,
        limit: u32,
    },
    Ready(Box<ProcessorInstance>),
    Failed,
    Stopped,
}

/// Helper thread building the instance under [`InitPolicy::Background`].
struct Initializer {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Initializer {
    /// Interrupt any module code the helper is running.
    fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    fn join(self) {
        self.cancel();
        if self.handle.join().is_err() {
            tracing::warn!("initializer thread panicked");
        }
    }
}

/// Per-block processor running inside the isolated context.
pub struct IsolatedProcessor {
    stage: Stage,
    initializer: Option<Initializer>,
    layout: BlockLayout,
    init_policy: InitPolicy,
    fallback: FallbackPolicy,
    diagnostics: DiagnosticSink,
    state: StateCell,
}

impl IsolatedProcessor {
    /// Create an uninitialized processor.
    pub fn new(
        params: InitParams,
        init_policy: InitPolicy,
        fallback: FallbackPolicy,
        diagnostics: DiagnosticSink,
    ) -> Self {
        Self {
            layout: params.layout,
            stage: Stage::Uninitialized(Box::new(params)),
            initializer: None,
            init_policy,
            fallback,
            diagnostics,
            state: StateCell::new(ProcessorState::Uninitialized),
        }
    }

    /// Current state.
    pub fn state(&self) -> ProcessorState {
        self.state.get()
    }

    /// Shared view of the state for other threads.
    pub fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    /// Block layout this processor expects.
    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    /// Start background initialization ahead of the first block.
    ///
    /// No-op for [`InitPolicy::Inline`], which always initializes inside the
    /// first invocation, and for processors that already left Uninitialized.
    pub fn prepare(&mut self) {
        if let InitPolicy::Background { max_pending_blocks } = self.init_policy {
            if let Stage::Uninitialized(_) = self.stage {
                if let Stage::Uninitialized(params) = std::mem::replace(&mut self.stage, Stage::Failed) {
                    self.stage = self.spawn_initializer(params, max_pending_blocks);
                }
            }
        }
    }

    /// Process one block. Never fails; see the module docs.
    pub fn process(&mut self, sequence: u64, input: &AudioBlock, output: &mut AudioBlock) -> BlockReport {
        let start = Instant::now();

        let outcome = if input.layout() != self.layout || output.layout() != self.layout {
            BlockOutcome::Fallback(FallbackReason::Layout)
        } else {
            self.advance();
            self.run(sequence, input, output)
        };

        if let BlockOutcome::Fallback(reason) = &outcome {
            self.apply_fallback(reason, input, output);
        }

        let continuation = match self.stage {
            Stage::Stopped => Continuation::Finished,
            _ => Continuation::KeepAlive,
        };

        BlockReport {
            outcome,
            continuation,
            elapsed_us: crate::wasm::elapsed_us(start),
        }
    }

    /// Stop processing and drop the instance. Later invocations emit silence
    /// and report [`Continuation::Finished`].
    ///
    /// A background initializer still running is interrupted and joined
    /// before this returns.
    pub fn stop(&mut self) {
        self.stage = Stage::Stopped;
        if let Some(initializer) = self.initializer.take() {
            initializer.join();
        }
    }

    fn run(&mut self, sequence: u64, input: &AudioBlock, output: &mut AudioBlock) -> BlockOutcome {
        match &mut self.stage {
            Stage::Ready(instance) => match instance.process(input.as_slice(), output.as_mut_slice()) {
                Ok(()) => BlockOutcome::Processed,
                Err(error) => {
                    self.diagnostics.emit(Diagnostic::BlockFailed {
                        sequence,
                        error: error.clone(),
                    });
                    BlockOutcome::Fallback(FallbackReason::Runtime(error))
                }
            },
            Stage::Failed => BlockOutcome::Fallback(FallbackReason::Failed),
            Stage::Stopped => BlockOutcome::Fallback(FallbackReason::Stopped),
            Stage::Uninitialized(_) | Stage::Pending { .. } => BlockOutcome::Fallback(FallbackReason::NotReady),
        }
    }

    /// Move initialization forward by one invocation.
    fn advance(&mut self) {
        match std::mem::replace(&mut self.stage, Stage::Failed) {
            Stage::Uninitialized(params) => match self.init_policy {
                InitPolicy::Inline => {
                    self.set_state(ProcessorState::Initializing);
                    let result = ProcessorInstance::new(&params, self.diagnostics.clone());
                    self.stage = self.finish(result);
                }
                InitPolicy::Background { max_pending_blocks } => {
                    self.stage = self.spawn_initializer(params, max_pending_blocks);
                    self.advance();
                }
            },
            Stage::Pending { rx, waited, limit } => {
                self.stage = match rx.try_recv() {
                    Ok(result) => self.finish(result),
                    Err(flume::TryRecvError::Empty) if waited + 1 >= limit => {
                        if let Some(initializer) = &self.initializer {
                            initializer.cancel();
                        }
                        self.finish(Err(InitError::Timeout(limit)))
                    }
                    Err(flume::TryRecvError::Empty) => Stage::Pending {
                        rx,
                        waited: waited + 1,
                        limit,
                    },
                    Err(flume::TryRecvError::Disconnected) => self.finish(Err(InitError::Disconnected)),
                };
            }
            other => self.stage = other,
        }
    }

    fn spawn_initializer(&mut self, params: Box<InitParams>, limit: u32) -> Stage {
        self.set_state(ProcessorState::Initializing);

        let (tx, rx) = flume::bounded(1);
        let sink = self.diagnostics.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let spawned = thread::Builder::new()
            .name("worklet-init".to_string())
            .spawn(move || {
                let result = ProcessorInstance::cancellable(&params, sink, flag);
                // The processor may have given up already
                let _ = tx.send(result);
            });

        match spawned {
            Ok(handle) => {
                self.initializer = Some(Initializer { cancel, handle });
                Stage::Pending { rx, waited: 0, limit }
            }
            Err(e) => self.finish(Err(InitError::Instantiate(format!("initializer thread: {}", e)))),
        }
    }

    fn finish(&mut self, result: InitResult) -> Stage {
        match result {
            Ok(instance) => {
                self.set_state(ProcessorState::Ready);
                Stage::Ready(Box::new(instance))
            }
            Err(error) => {
                self.diagnostics.emit(Diagnostic::InitFailed(error));
                self.set_state(ProcessorState::Failed);
                Stage::Failed
            }
        }
    }

    fn set_state(&mut self, to: ProcessorState) {
        let from = self.state.get();
        if from != to {
            self.state.set(to);
            self.diagnostics.emit(Diagnostic::StateChanged { from, to });
        }
    }

    fn apply_fallback(&self, reason: &FallbackReason, input: &AudioBlock, output: &mut AudioBlock) {
        let passthrough = self.fallback == FallbackPolicy::Passthrough
            && input.layout() == output.layout()
            && *reason != FallbackReason::Stopped;
        if passthrough {
            output.copy_from(input);
        } else {
            output.fill_silence();
        }
    }
}

impl Drop for IsolatedProcessor {
    fn drop(&mut self) {
        if let Some(initializer) = self.initializer.take() {
            initializer.join();
        }
    }
}
