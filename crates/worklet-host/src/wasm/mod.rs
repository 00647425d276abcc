//! WebAssembly side of the bridge.
//!
//! Modules are compiled and validated on the loading side; the real-time
//! thread only ever instantiates an already compiled module and calls into it.
//!
//! ## Isolation Model
//!
//! - **Memory isolation**: each instance runs in its own linear memory, or in a
//!   shared memory that the loader allocated up front
//! - **Deny-by-default WASI**: no stdio, environment, or filesystem unless granted
//! - **No text codecs in the callback**: the `worklet.log` import hands raw bytes
//!   to the main thread, which decodes them
//! - **Bounded execution**: every call into the module runs under a wall-clock
//!   deadline enforced through epoch interruption; an optional fuel budget is
//!   reset before every block on top of that
//!
//! ## Usage
//!
//! ```rust,ignore
//! use worklet_host::wasm::{WasmRuntime, WasmConfig};
//!
//! let runtime = WasmRuntime::new(WasmConfig::realtime())?;
//! let module = runtime.compile("gain", &bytes)?;
//! ```

mod config;
mod host_functions;
mod memory;
mod module;
mod runtime;

pub use config::{WasiCapabilities, WasmConfig};
pub use host_functions::LOG_IMPORT_MODULE;
pub use memory::SharedMemoryHandle;
pub use module::{MemoryBinding, ProcessingModule};
pub use runtime::{HostState, LatencyStats, ProcessorInstance, WasmRuntime, DEFAULT_LATENCY_WINDOW};

pub(crate) use runtime::elapsed_us;

#[cfg(test)]
mod tests;
