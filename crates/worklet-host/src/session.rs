//! A running audio session: the real-time thread and its queues.
//!
//! The session assigns sequence numbers on [`submit`](Session::submit), the
//! real-time thread processes blocks strictly in that order, and
//! [`recv`](Session::recv) hands them back in the same order. Output buffers
//! are allocated here, on the caller's thread, and travel to the real-time
//! thread together with their input so that the callback never allocates.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::block::{AudioBlock, BlockLayout};
use crate::config::SessionConfig;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::error::{LoadError, Result, SessionError};
use crate::processor::{
    BlockOutcome, Continuation, InitParams, IsolatedProcessor, ProcessorState, StateCell,
};
use crate::wasm::{LatencyStats, SharedMemoryHandle};

/// Name of the real-time thread
pub const REALTIME_THREAD_NAME: &str = "worklet-rt";

/// One block returned by the real-time thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedBlock {
    /// Position in the stream, starting at 0
    pub sequence: u64,
    /// The block that was submitted
    pub input: AudioBlock,
    /// The block produced for it
    pub output: AudioBlock,
    /// Whether the module or the fallback produced `output`
    pub outcome: BlockOutcome,
    /// Keep-alive signal from the processor
    pub continuation: Continuation,
    /// Time spent in the invocation
    pub elapsed_us: u64,
}

/// What [`Session::try_submit`] did with a block.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Queued under this sequence number
    Queued(u64),
    /// The input queue was full; the block comes back untouched
    Full(AudioBlock),
}

struct Job {
    sequence: u64,
    input: AudioBlock,
    output: AudioBlock,
}

/// A started audio session.
///
/// Dropping the session tears it down.
pub struct Session {
    module_name: String,
    config: SessionConfig,
    layout: BlockLayout,
    jobs: Option<flume::Sender<Job>>,
    results: flume::Receiver<ProcessedBlock>,
    diagnostics: flume::Receiver<Diagnostic>,
    sink: DiagnosticSink,
    state: StateCell,
    worker: Option<JoinHandle<()>>,
    memory: Option<SharedMemoryHandle>,
    next_sequence: u64,
    expected_sequence: u64,
    stats: LatencyStats,
}

impl Session {
    /// Spawn the real-time thread around a processor built from `params`.
    pub(crate) fn spawn(params: InitParams, config: &SessionConfig) -> Result<Self> {
        let module_name = params.module.name().to_string();
        let layout = params.layout;
        let memory = params.memory.clone();

        let (sink, diagnostics) = DiagnosticSink::channel(config.diagnostics_capacity);
        let processor = IsolatedProcessor::new(params, config.init, config.fallback, sink.clone());
        let state = processor.state_cell();

        let (jobs, job_rx) = flume::bounded::<Job>(config.queue_depth);
        // Unbounded so the real-time thread never waits on the caller to drain
        let (result_tx, results) = flume::unbounded();

        let worker = thread::Builder::new()
            .name(REALTIME_THREAD_NAME.to_string())
            .spawn(move || run_realtime(processor, job_rx, result_tx))
            .map_err(|e| {
                if let Some(memory) = &memory {
                    memory.release();
                }
                LoadError::Io(e)
            })?;

        tracing::info!(
            module = %module_name,
            layout = %layout,
            sample_rate = config.sample_rate,
            "session started"
        );

        Ok(Self {
            module_name,
            config: config.clone(),
            layout,
            jobs: Some(jobs),
            results,
            diagnostics,
            sink,
            state,
            worker: Some(worker),
            memory,
            next_sequence: 0,
            expected_sequence: 0,
            stats: LatencyStats::new(),
        })
    }

    /// Queue a block, waiting for room if the input queue is full.
    /// Returns the block's sequence number.
    pub fn submit(&mut self, input: AudioBlock) -> std::result::Result<u64, SessionError> {
        let job = self.job(input)?;
        let sequence = job.sequence;
        let jobs = self.jobs.as_ref().ok_or(SessionError::Closed)?;
        jobs.send(job).map_err(|_| SessionError::Disconnected)?;
        self.next_sequence += 1;
        Ok(sequence)
    }

    /// Queue a block without waiting.
    ///
    /// When the queue is full the block is returned in [`Submission::Full`]
    /// and no sequence number is used, so the caller can retry with it.
    pub fn try_submit(&mut self, input: AudioBlock) -> std::result::Result<Submission, SessionError> {
        let job = self.job(input)?;
        let sequence = job.sequence;
        let jobs = self.jobs.as_ref().ok_or(SessionError::Closed)?;
        match jobs.try_send(job) {
            Ok(()) => {
                self.next_sequence += 1;
                Ok(Submission::Queued(sequence))
            }
            Err(flume::TrySendError::Full(job)) => Ok(Submission::Full(job.input)),
            Err(flume::TrySendError::Disconnected(_)) => Err(SessionError::Disconnected),
        }
    }

    /// Wait for the next processed block.
    ///
    /// After teardown, blocks that were already processed can still be received;
    /// once they are drained this returns [`SessionError::Closed`].
    pub fn recv(&mut self) -> std::result::Result<ProcessedBlock, SessionError> {
        match self.results.recv() {
            Ok(block) => Ok(self.accept(block)),
            Err(flume::RecvError::Disconnected) => Err(self.disconnected()),
        }
    }

    /// Wait up to `timeout` for the next processed block.
    pub fn recv_timeout(&mut self, timeout: Duration) -> std::result::Result<Option<ProcessedBlock>, SessionError> {
        match self.results.recv_timeout(timeout) {
            Ok(block) => Ok(Some(self.accept(block))),
            Err(flume::RecvTimeoutError::Timeout) => Ok(None),
            Err(flume::RecvTimeoutError::Disconnected) => Err(self.disconnected()),
        }
    }

    /// Take the next processed block if one is ready.
    pub fn try_recv(&mut self) -> std::result::Result<Option<ProcessedBlock>, SessionError> {
        match self.results.try_recv() {
            Ok(block) => Ok(Some(self.accept(block))),
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => Err(self.disconnected()),
        }
    }

    /// Submit one block and wait for the next output.
    ///
    /// With no other blocks in flight the output belongs to `input`.
    pub fn process(&mut self, input: AudioBlock) -> std::result::Result<ProcessedBlock, SessionError> {
        self.submit(input)?;
        self.recv()
    }

    /// Stop the real-time thread and release the shared memory.
    ///
    /// Already submitted blocks are processed first. Safe to call repeatedly;
    /// only the first call has an effect.
    pub fn teardown(&mut self) {
        let Some(jobs) = self.jobs.take() else {
            return;
        };
        drop(jobs);

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(module = %self.module_name, "real-time thread panicked");
            }
        }

        if let Some(memory) = &self.memory {
            if memory.release() {
                tracing::debug!(module = %self.module_name, "shared memory released");
            }
        }

        tracing::info!(
            module = %self.module_name,
            blocks = self.next_sequence,
            dropped_diagnostics = self.sink.dropped(),
            "session torn down"
        );
    }

    /// Whether the session has been torn down.
    pub fn is_closed(&self) -> bool {
        self.jobs.is_none()
    }

    /// Current processor state.
    pub fn state(&self) -> ProcessorState {
        self.state.get()
    }

    /// Block layout, fixed for the session.
    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Name of the loaded module.
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Blocks submitted but not yet received.
    pub fn in_flight(&self) -> u64 {
        self.next_sequence - self.expected_sequence
    }

    /// Latency of received blocks.
    pub fn stats(&self) -> &LatencyStats {
        &self.stats
    }

    /// Diagnostic messages from the isolated processor.
    pub fn diagnostics(&self) -> &flume::Receiver<Diagnostic> {
        &self.diagnostics
    }

    /// Drain pending diagnostics, logging each through `tracing`.
    pub fn log_diagnostics(&self) -> usize {
        let mut count = 0;
        for diagnostic in self.diagnostics.try_iter() {
            diagnostic.log();
            count += 1;
        }
        count
    }

    /// Diagnostics dropped because the channel was full.
    pub fn dropped_diagnostics(&self) -> u64 {
        self.sink.dropped()
    }

    /// The shared memory handle, when the module imports a shared memory.
    pub fn shared_memory(&self) -> Option<&SharedMemoryHandle> {
        self.memory.as_ref()
    }

    fn job(&self, input: AudioBlock) -> std::result::Result<Job, SessionError> {
        if self.jobs.is_none() {
            return Err(SessionError::Closed);
        }
        if input.layout() != self.layout {
            return Err(SessionError::Layout {
                expected: self.layout.to_string(),
                found: input.layout().to_string(),
            });
        }
        Ok(Job {
            sequence: self.next_sequence,
            input,
            output: AudioBlock::silent(self.layout),
        })
    }

    fn accept(&mut self, block: ProcessedBlock) -> ProcessedBlock {
        debug_assert_eq!(block.sequence, self.expected_sequence, "blocks out of order");
        self.expected_sequence = block.sequence + 1;
        self.stats.record(block.elapsed_us);
        block
    }

    fn disconnected(&self) -> SessionError {
        if self.is_closed() {
            SessionError::Closed
        } else {
            SessionError::Disconnected
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("module", &self.module_name)
            .field("layout", &self.layout)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Body of the real-time thread. No logging, no allocation on the happy path.
fn run_realtime(
    mut processor: IsolatedProcessor,
    jobs: flume::Receiver<Job>,
    results: flume::Sender<ProcessedBlock>,
) {
    processor.prepare();

    while let Ok(Job {
        sequence,
        input,
        mut output,
    }) = jobs.recv()
    {
        let report = processor.process(sequence, &input, &mut output);
        let processed = ProcessedBlock {
            sequence,
            input,
            output,
            outcome: report.outcome,
            continuation: report.continuation,
            elapsed_us: report.elapsed_us,
        };
        if results.send(processed).is_err() {
            break;
        }
    }

    processor.stop();
}
