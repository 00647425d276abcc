//! Fixed-size sample blocks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel count and frames per block. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockLayout {
    /// Number of channels
    pub channels: usize,
    /// Samples per channel per block
    pub frames: usize,
}

impl BlockLayout {
    /// Create a layout.
    pub fn new(channels: usize, frames: usize) -> Self {
        Self { channels, frames }
    }

    /// Total samples in one block.
    pub fn samples(&self) -> usize {
        self.channels * self.frames
    }
}

impl fmt::Display for BlockLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ch x {}", self.channels, self.frames)
    }
}

/// One block of planar samples: all of channel 0, then all of channel 1, and so on.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    layout: BlockLayout,
    samples: Vec<f32>,
}

impl AudioBlock {
    /// A block of zeros.
    pub fn silent(layout: BlockLayout) -> Self {
        Self {
            layout,
            samples: vec![0.0; layout.samples()],
        }
    }

    /// Build a block from planar samples. Returns `None` if the length does not match.
    pub fn from_planar(layout: BlockLayout, samples: Vec<f32>) -> Option<Self> {
        (samples.len() == layout.samples()).then_some(Self { layout, samples })
    }

    /// Build a block from one vector per channel. Returns `None` if the
    /// channels are empty or of unequal length.
    pub fn from_channels(channels: &[Vec<f32>]) -> Option<Self> {
        let frames = channels.first()?.len();
        if channels.iter().any(|c| c.len() != frames) {
            return None;
        }
        let layout = BlockLayout::new(channels.len(), frames);
        let samples = channels.iter().flatten().copied().collect();
        Some(Self { layout, samples })
    }

    /// Build a block from interleaved frames. Returns `None` if the length does not match.
    pub fn from_interleaved(layout: BlockLayout, interleaved: &[f32]) -> Option<Self> {
        if interleaved.len() != layout.samples() {
            return None;
        }
        let mut block = Self::silent(layout);
        for (i, &v) in interleaved.iter().enumerate() {
            let frame = i / layout.channels;
            let channel = i % layout.channels;
            block.samples[channel * layout.frames + frame] = v;
        }
        Some(block)
    }

    /// Interleave the block's samples frame by frame.
    pub fn to_interleaved(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.samples.len());
        for frame in 0..self.layout.frames {
            for channel in 0..self.layout.channels {
                out.push(self.samples[channel * self.layout.frames + frame]);
            }
        }
        out
    }

    /// Block layout.
    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    /// Number of channels.
    pub fn channels(&self) -> usize {
        self.layout.channels
    }

    /// Frames per channel.
    pub fn frames(&self) -> usize {
        self.layout.frames
    }

    /// One channel's samples.
    pub fn channel(&self, index: usize) -> &[f32] {
        let start = index * self.layout.frames;
        &self.samples[start..start + self.layout.frames]
    }

    /// One channel's samples, mutably.
    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        let start = index * self.layout.frames;
        &mut self.samples[start..start + self.layout.frames]
    }

    /// All samples, planar.
    pub fn as_slice(&self) -> &[f32] {
        &self.samples
    }

    /// All samples, planar, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    /// Zero every sample.
    pub fn fill_silence(&mut self) {
        self.samples.fill(0.0);
    }

    /// Copy another block's samples. Layouts must match.
    pub fn copy_from(&mut self, other: &AudioBlock) {
        debug_assert_eq!(self.layout, other.layout);
        self.samples.copy_from_slice(&other.samples);
    }

    /// Whether every sample is exactly zero.
    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|&s| s == 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_channels_is_planar() {
        let block = AudioBlock::from_channels(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(block.layout(), BlockLayout::new(2, 2));
        assert_eq!(block.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(block.channel(1), &[3.0, 4.0]);
    }

    #[test]
    fn test_ragged_channels_rejected() {
        assert!(AudioBlock::from_channels(&[vec![1.0], vec![]]).is_none());
        assert!(AudioBlock::from_channels(&[]).is_none());
        assert!(AudioBlock::from_planar(BlockLayout::new(2, 4), vec![0.0; 7]).is_none());
    }

    #[test]
    fn test_interleaving() {
        let layout = BlockLayout::new(2, 3);
        let block = AudioBlock::from_interleaved(layout, &[1.0, -1.0, 2.0, -2.0, 3.0, -3.0]).unwrap();
        assert_eq!(block.channel(0), &[1.0, 2.0, 3.0]);
        assert_eq!(block.channel(1), &[-1.0, -2.0, -3.0]);
        assert_eq!(block.to_interleaved(), vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);
    }

    #[test]
    fn test_silence() {
        let mut block = AudioBlock::from_planar(BlockLayout::new(1, 4), vec![0.5; 4]).unwrap();
        assert!(!block.is_silent());
        block.fill_silence();
        assert!(block.is_silent());
        assert_eq!(block.frames(), 4);
    }

    #[test]
    fn test_layout_display() {
        assert_eq!(BlockLayout::new(2, 128).to_string(), "2ch x 128");
        assert_eq!(BlockLayout::new(2, 128).samples(), 256);
    }
}
