//! Configuration for the WebAssembly runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// WASI capability grants for the isolated context.
///
/// Following the deny-by-default model, all capabilities start disabled.
/// The isolated context never gets filesystem or network access; modules
/// that need data must receive it through the loader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasiCapabilities {
    /// Allow writes to stdout
    pub stdout: bool,

    /// Allow writes to stderr
    pub stderr: bool,

    /// Environment variables to expose
    pub env_vars: Vec<(String, String)>,

    /// Command-line arguments to pass
    pub args: Vec<String>,
}

impl WasiCapabilities {
    /// Create capabilities with nothing allowed (maximum isolation)
    pub fn none() -> Self {
        Self::default()
    }

    /// Create capabilities with stdout/stderr inherited, for debugging modules
    /// outside a real-time session.
    pub fn with_stdio() -> Self {
        Self {
            stdout: true,
            stderr: true,
            ..Default::default()
        }
    }

    /// Builder: enable stdout
    pub fn stdout(mut self, allow: bool) -> Self {
        self.stdout = allow;
        self
    }

    /// Builder: enable stderr
    pub fn stderr(mut self, allow: bool) -> Self {
        self.stderr = allow;
        self
    }

    /// Builder: add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Builder: add command-line argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Configuration for the WebAssembly engine and per-instance limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmConfig {
    /// WASI capability configuration
    pub capabilities: WasiCapabilities,

    /// Maximum linear memory in bytes for private memories
    pub max_memory: usize,

    /// Fuel granted before every block (None = unmetered)
    pub fuel_per_block: Option<u64>,

    /// Wall-clock limit for instantiation, `init` and buffer allocation, in milliseconds
    pub max_init_time_ms: u64,

    /// Wall-clock limit for one `process` call, in milliseconds
    pub max_block_time_ms: u64,

    /// Cranelift optimization level (0-2)
    pub optimization_level: u8,

    /// Enable SIMD support
    pub enable_simd: bool,

    /// Enable the threads proposal (required for shared memories)
    pub enable_threads: bool,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            capabilities: WasiCapabilities::none(),
            max_memory: 64 * 1024 * 1024, // 64 MB
            fuel_per_block: None,
            max_init_time_ms: 2_000,
            max_block_time_ms: 100,
            optimization_level: 2,
            enable_simd: true,
            enable_threads: true,
        }
    }
}

impl WasmConfig {
    /// Config for real-time sessions: fully optimized, metered per block.
    pub fn realtime() -> Self {
        Self {
            fuel_per_block: Some(50_000_000),
            optimization_level: 2,
            ..Default::default()
        }
    }

    /// Config for development/debugging
    pub fn development() -> Self {
        Self {
            capabilities: WasiCapabilities::with_stdio(),
            optimization_level: 0, // Faster compilation
            ..Default::default()
        }
    }

    /// Builder: set capabilities
    pub fn capabilities(mut self, caps: WasiCapabilities) -> Self {
        self.capabilities = caps;
        self
    }

    /// Builder: set max memory
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: set per-block fuel budget
    pub fn fuel_per_block(mut self, fuel: u64) -> Self {
        self.fuel_per_block = Some(fuel);
        self
    }

    /// Builder: set the initialization deadline
    pub fn max_init_time(mut self, limit: Duration) -> Self {
        self.max_init_time_ms = duration_ms(limit);
        self
    }

    /// Builder: set the per-block deadline
    pub fn max_block_time(mut self, limit: Duration) -> Self {
        self.max_block_time_ms = duration_ms(limit);
        self
    }

    /// Builder: enable SIMD
    pub fn simd(mut self, enable: bool) -> Self {
        self.enable_simd = enable;
        self
    }

    /// Builder: enable threads (shared memories)
    pub fn threads(mut self, enable: bool) -> Self {
        self.enable_threads = enable;
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(2);
        self
    }
}

fn duration_ms(limit: Duration) -> u64 {
    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)
}
