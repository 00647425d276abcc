//! Error types for the worklet host crate.
//!
//! Errors are split by where they can occur. Only [`LoadError`] and
//! [`SessionError`] ever reach a caller; [`InitError`] and [`RuntimeError`]
//! are produced on the real-time thread and are contained there, surfacing
//! only as diagnostics.

use thiserror::Error;

/// Module fetch, decode, compile, or validation failed. The session does not start.
#[derive(Error, Debug)]
pub enum LoadError {
    /// Reading the module from disk failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Network fetch failed
    #[error("fetch failed for {url}: {reason}")]
    Fetch {
        /// Requested URL
        url: String,
        /// Transport error description
        reason: String,
    },

    /// The server answered with a non-success status
    #[error("fetch of {url} returned HTTP {status}")]
    Status {
        /// Requested URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// The source kind is not available in this build
    #[error("unsupported module source: {0}")]
    Unsupported(String),

    /// The bytes are not a valid WebAssembly module (or WAT text)
    #[error("invalid module '{name}': {reason}")]
    InvalidModule {
        /// Module name
        name: String,
        /// Decoder or compiler message
        reason: String,
    },

    /// A required export is absent
    #[error("module '{name}' does not export '{export}'")]
    MissingExport {
        /// Module name
        name: String,
        /// Export name
        export: &'static str,
    },

    /// An export exists but has the wrong type
    #[error("export '{export}' has signature {found}, expected {expected}")]
    ExportSignature {
        /// Export name
        export: &'static str,
        /// Expected signature
        expected: &'static str,
        /// Signature found in the module
        found: String,
    },

    /// The module imports something the isolated context cannot provide
    #[error("unsupported import {module}.{name}")]
    UnsupportedImport {
        /// Import module namespace
        module: String,
        /// Import field name
        name: String,
    },

    /// Engine or session configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Wasmtime engine or shared memory setup failed
    #[error("runtime setup failed: {0}")]
    Runtime(String),
}

/// Constructing the processor instance failed inside the isolated context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    /// Linking or instantiation trapped or failed
    #[error("instantiation failed: {0}")]
    Instantiate(String),

    /// The module has no usable linear memory
    #[error("no linear memory available")]
    NoMemory,

    /// A required export could not be resolved on the instance
    #[error("export '{0}' unavailable: {1}")]
    Export(&'static str, String),

    /// `alloc` failed or returned an unusable offset
    #[error("buffer allocation failed: {0}")]
    Alloc(String),

    /// `init` returned a non-zero status
    #[error("init returned status {0}")]
    Status(i32),

    /// `init` trapped
    #[error("init trapped: {0}")]
    Trap(String),

    /// `init` or instantiation ran past its wall-clock deadline
    #[error("initialization exceeded its {0} ms deadline")]
    Deadline(u64),

    /// Background initialization did not finish in time
    #[error("initialization still pending after {0} blocks")]
    Timeout(u32),

    /// The background initializer went away without a result
    #[error("initializer disconnected")]
    Disconnected,
}

/// One block failed inside the processing entry point.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The entry point trapped
    #[error("process trapped: {0}")]
    Trap(String),

    /// The per-block fuel budget ran out
    #[error("per-block fuel budget exhausted")]
    OutOfFuel,

    /// The entry point ran past its wall-clock deadline
    #[error("process exceeded its {0} ms deadline")]
    Deadline(u64),

    /// The entry point returned a non-zero status
    #[error("process returned status {0}")]
    Status(i32),

    /// Sample buffers fell outside linear memory
    #[error("memory access out of bounds at offset {offset} (len {len})")]
    OutOfBounds {
        /// Byte offset
        offset: usize,
        /// Byte length
        len: usize,
    },
}

/// Misuse of a running session from the caller's side.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session has been torn down
    #[error("session closed")]
    Closed,

    /// A submitted block does not match the session layout
    #[error("block layout {found} does not match session layout {expected}")]
    Layout {
        /// Session layout
        expected: String,
        /// Submitted layout
        found: String,
    },

    /// The real-time thread exited unexpectedly
    #[error("real-time thread terminated")]
    Disconnected,
}

/// Result type alias for loading operations
pub type Result<T, E = LoadError> = std::result::Result<T, E>;
