//! # Worklet Host
//!
//! Runs a compiled WebAssembly audio module inside an isolated, real-time
//! block processor.
//!
//! The work is split across two contexts:
//!
//! | Context | Component | Does |
//! |---------|-----------|------|
//! | Main thread | [`ModuleLoader`] | fetch, decode, compile, validate, allocate shared memory |
//! | Real-time thread | [`IsolatedProcessor`] | instantiate once, then one `process` call per block |
//!
//! Only fully prepared [`InitParams`] cross from the first to the second, so the
//! isolated context never needs network access, a compiler front end, or a
//! text decoder.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use worklet_host::{AudioBlock, ModuleLoader, ModuleSource, SessionConfig, WasmConfig};
//!
//! let loader = ModuleLoader::new(WasmConfig::realtime())?;
//! let mut session = loader
//!     .start(&ModuleSource::parse("gain.wasm"), SessionConfig::new(2, 128))
//!     .await?;
//!
//! let processed = session.process(AudioBlock::silent(session.layout()))?;
//! assert_eq!(processed.output.frames(), 128);
//! session.teardown();
//! ```
//!
//! ## Processing ABI
//!
//! A module exports `alloc(i32) -> i32` and
//! `process(in_ptr, out_ptr, frames, channels) -> i32`, optionally
//! `init(sample_rate, channels, frames) -> i32` and `dealloc(ptr, size)`.
//! Samples are planar little-endian `f32`. See [`wasm`] for memory details.
//!
//! ## Features
//!
//! - `fetch` (default) - load modules from HTTP(S) URLs via reqwest

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod block;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod loader;
pub mod processor;
pub mod session;
pub mod wasm;

// Re-export main types
pub use block::{AudioBlock, BlockLayout};
pub use config::{FallbackPolicy, InitPolicy, SessionConfig};
pub use diagnostics::{Diagnostic, DiagnosticSink, LogLevel};
pub use error::{InitError, LoadError, Result, RuntimeError, SessionError};
pub use loader::{ModuleLoader, ModuleSource};
pub use processor::{
    BlockOutcome, BlockReport, Continuation, FallbackReason, InitParams, IsolatedProcessor,
    ProcessorState, StateCell,
};
pub use session::{ProcessedBlock, Session, Submission};
pub use wasm::{
    LatencyStats, MemoryBinding, ProcessingModule, ProcessorInstance, SharedMemoryHandle,
    WasiCapabilities, WasmConfig, WasmRuntime, DEFAULT_LATENCY_WINDOW,
};
