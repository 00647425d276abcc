//! One-way diagnostic channel from the real-time thread to the main thread.
//!
//! The real-time side only ever calls [`DiagnosticSink::emit`], which never
//! blocks: when the channel is full the message is dropped and counted.
//! Formatting, text decoding and logging happen on the receiving side.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{InitError, RuntimeError};
use crate::processor::ProcessorState;

/// Severity attached to module log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// 0
    Error,
    /// 1
    Warn,
    /// 2
    Info,
    /// 3
    Debug,
    /// anything else
    Trace,
}

impl LogLevel {
    /// Map the raw level a module passes to `worklet.log`.
    pub fn from_raw(level: i32) -> Self {
        match level {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// A message from the isolated processor.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// The processor moved between states
    StateChanged {
        /// Previous state
        from: ProcessorState,
        /// New state
        to: ProcessorState,
    },
    /// Instance construction failed; the processor is now Failed
    InitFailed(InitError),
    /// One block degraded to the fallback output
    BlockFailed {
        /// Sequence number of the block
        sequence: u64,
        /// What went wrong
        error: RuntimeError,
    },
    /// Raw bytes the module passed to `worklet.log`
    Module {
        /// Severity
        level: LogLevel,
        /// Undecoded message
        bytes: Vec<u8>,
    },
}

impl Diagnostic {
    /// Human-readable text. Decodes module bytes lossily; call on the main thread.
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            Diagnostic::StateChanged { from, to } => Cow::Owned(format!("state {:?} -> {:?}", from, to)),
            Diagnostic::InitFailed(e) => Cow::Owned(format!("initialization failed: {}", e)),
            Diagnostic::BlockFailed { sequence, error } => {
                Cow::Owned(format!("block {} degraded: {}", sequence, error))
            }
            Diagnostic::Module { bytes, .. } => String::from_utf8_lossy(bytes),
        }
    }

    /// Emit this diagnostic through `tracing`. Main thread only.
    pub fn log(&self) {
        match self {
            Diagnostic::StateChanged { .. } => tracing::debug!("{}", self.text()),
            Diagnostic::InitFailed(_) => tracing::error!("{}", self.text()),
            Diagnostic::BlockFailed { .. } => tracing::warn!("{}", self.text()),
            Diagnostic::Module { level, .. } => match level {
                LogLevel::Error => tracing::error!(target: "worklet::module", "{}", self.text()),
                LogLevel::Warn => tracing::warn!(target: "worklet::module", "{}", self.text()),
                LogLevel::Info => tracing::info!(target: "worklet::module", "{}", self.text()),
                LogLevel::Debug => tracing::debug!(target: "worklet::module", "{}", self.text()),
                LogLevel::Trace => tracing::trace!(target: "worklet::module", "{}", self.text()),
            },
        }
    }
}

/// Sending half of the diagnostic channel.
#[derive(Debug, Clone)]
pub struct DiagnosticSink {
    tx: flume::Sender<Diagnostic>,
    dropped: Arc<AtomicU64>,
}

impl DiagnosticSink {
    /// Create a bounded channel.
    pub fn channel(capacity: usize) -> (Self, flume::Receiver<Diagnostic>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Send without blocking; drops and counts the message when full.
    pub fn emit(&self, diagnostic: Diagnostic) {
        if self.tx.try_send(diagnostic).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Messages dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
