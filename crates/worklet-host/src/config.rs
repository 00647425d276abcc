//! Session configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::block::BlockLayout;
use crate::error::{LoadError, Result};

/// Largest accepted channel count
pub const MAX_CHANNELS: usize = 32;
/// Largest accepted block size in frames
pub const MAX_BLOCK_SIZE: usize = 16384;

/// Output produced whenever the module cannot process a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// All zeros
    #[default]
    Silence,
    /// Output equals input
    Passthrough,
}

/// When and where the processor instance is constructed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum InitPolicy {
    /// Construct synchronously inside the first invocation. That block is
    /// processed by the new instance on success and gets the fallback on failure.
    #[default]
    Inline,
    /// Construct on a helper thread; invocations emit the fallback until it is
    /// done and give up (Failed) after `max_pending_blocks` invocations.
    Background {
        /// Invocations to wait before declaring initialization failed
        max_pending_blocks: u32,
    },
}

/// Configuration of one audio session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of channels per block
    pub channels: usize,

    /// Frames per block
    pub block_size: usize,

    /// Sample rate passed to the module's `init`
    pub sample_rate: u32,

    /// Fallback output policy
    pub fallback: FallbackPolicy,

    /// Initialization policy
    pub init: InitPolicy,

    /// Capacity of the input and output block queues
    pub queue_depth: usize,

    /// Capacity of the diagnostic channel
    pub diagnostics_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            block_size: 128,
            sample_rate: 48_000,
            fallback: FallbackPolicy::Silence,
            init: InitPolicy::Inline,
            queue_depth: 8,
            diagnostics_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Create a config for the given channel count and block size.
    pub fn new(channels: usize, block_size: usize) -> Self {
        Self {
            channels,
            block_size,
            ..Default::default()
        }
    }

    /// Load a config from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| LoadError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Block layout of this session.
    pub fn layout(&self) -> BlockLayout {
        BlockLayout::new(self.channels, self.block_size)
    }

    /// Duration of one block in microseconds.
    pub fn block_period_us(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.block_size as u64 * 1_000_000 / self.sample_rate as u64
    }

    /// Check the configuration before anything is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(LoadError::Config(format!(
                "channel count {} outside 1..={}",
                self.channels, MAX_CHANNELS
            )));
        }
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(LoadError::Config(format!(
                "block size {} outside 1..={}",
                self.block_size, MAX_BLOCK_SIZE
            )));
        }
        if self.sample_rate == 0 {
            return Err(LoadError::Config("sample rate must be non-zero".to_string()));
        }
        if self.queue_depth == 0 {
            return Err(LoadError::Config("queue depth must be non-zero".to_string()));
        }
        if let InitPolicy::Background { max_pending_blocks: 0 } = self.init {
            return Err(LoadError::Config(
                "background initialization needs max_pending_blocks > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Builder: set sample rate
    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Builder: set fallback policy
    pub fn fallback(mut self, policy: FallbackPolicy) -> Self {
        self.fallback = policy;
        self
    }

    /// Builder: set initialization policy
    pub fn init(mut self, policy: InitPolicy) -> Self {
        self.init = policy;
        self
    }

    /// Builder: set queue depth
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Builder: set diagnostic channel capacity
    pub fn diagnostics_capacity(mut self, capacity: usize) -> Self {
        self.diagnostics_capacity = capacity;
        self
    }
}
