//! Host functions exposed to processing modules.
//!
//! The isolated context deliberately offers almost nothing. The one import
//! a module may use is a diagnostic hook:
//!
//! ```wat
//! (import "worklet" "log" (func $log (param i32 i32 i32)))
//! ```
//!
//! `log(level, ptr, len)` copies `len` raw bytes from linear memory into a
//! [`Diagnostic::Module`]. Nothing is decoded on the real-time thread; the
//! main thread turns the bytes into text when it drains the channel.

use wasmtime::{Caller, Linker};

use super::runtime::HostState;
use crate::diagnostics::{Diagnostic, LogLevel};
use crate::error::{LoadError, Result};

/// Import namespace of the host functions
pub const LOG_IMPORT_MODULE: &str = "worklet";
pub(crate) const LOG_IMPORT_NAME: &str = "log";

/// Messages longer than this are truncated before crossing to the main thread
const MAX_LOG_BYTES: usize = 1024;

/// Register all host functions with the linker.
pub(crate) fn register(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(
            LOG_IMPORT_MODULE,
            LOG_IMPORT_NAME,
            |caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
                forward_log(caller, level, ptr, len);
            },
        )
        .map_err(|e| LoadError::Runtime(format!("failed to register {}: {}", LOG_IMPORT_NAME, e)))?;
    Ok(())
}

fn forward_log(caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32) {
    if ptr < 0 || len < 0 {
        return;
    }
    let state = caller.data();
    let Some(memory) = state.memory.clone() else {
        return;
    };
    let len = (len as usize).min(MAX_LOG_BYTES);

    // A bad pointer from the module is its own problem; never trap the block over a log line
    if let Ok(bytes) = memory.read_bytes(&caller, ptr as usize, len) {
        caller.data().diagnostics.emit(Diagnostic::Module {
            level: LogLevel::from_raw(level),
            bytes,
        });
    }
}
