//! Audio block and processing-spec abstractions
//!
//! The host hands the engine one block of audio at a time. Blocks are planar,
//! have a fixed channel count, and are allocated once at `max_block_size`
//! frames; the logical length changes per call but the storage never does.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while preparing the audio path
#[derive(Debug, Error, PartialEq)]
pub enum AudioError {
    /// Sample rate, block size or channel count is unusable
    #[error("Invalid processing spec: {0}")]
    InvalidSpec(String),

    /// Host buffer channel layout does not match the prepared layout
    #[error("Channel mismatch: expected {expected}, got {got}")]
    ChannelMismatch { expected: usize, got: usize },

    /// Host delivered more frames than the engine was prepared for
    #[error("Block too large: {len} frames exceeds maximum of {max}")]
    BlockTooLarge { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Everything a processor needs to size its buffers and coefficients
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub sample_rate: f32,
    pub max_block_size: usize,
    pub channels: usize,
}

impl ProcessSpec {
    pub fn new(sample_rate: f32, max_block_size: usize, channels: usize) -> Self {
        Self {
            sample_rate,
            max_block_size,
            channels,
        }
    }

    /// Check that the stream format is usable
    pub fn validate(&self) -> Result<()> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(AudioError::InvalidSpec(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.max_block_size == 0 {
            return Err(AudioError::InvalidSpec("max block size must be non-zero".to_string()));
        }
        if self.channels == 0 {
            return Err(AudioError::InvalidSpec("channel count must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Check that a block fits the layout processors were prepared for
    pub fn check_block(&self, block: &AudioBlock) -> Result<()> {
        if block.num_channels() != self.channels {
            return Err(AudioError::ChannelMismatch {
                expected: self.channels,
                got: block.num_channels(),
            });
        }
        if block.len() > self.max_block_size {
            return Err(AudioError::BlockTooLarge {
                len: block.len(),
                max: self.max_block_size,
            });
        }
        Ok(())
    }
}

impl Default for ProcessSpec {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            max_block_size: 512,
            channels: 2,
        }
    }
}

/// Planar block of audio, mutated in place by processors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioBlock {
    channels: Vec<Vec<f32>>,
    len: usize,
}

impl AudioBlock {
    /// Allocate a silent block with `channels` x `capacity` samples
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self {
            channels: vec![vec![0.0; capacity]; channels],
            len: capacity,
        }
    }

    /// Allocate a block matching a processing spec
    pub fn for_spec(spec: &ProcessSpec) -> Self {
        Self::new(spec.channels, spec.max_block_size)
    }

    /// Build a block from planar channel data (test and setup helper)
    pub fn from_channels(channels: Vec<Vec<f32>>) -> Self {
        let len = channels.iter().map(Vec::len).min().unwrap_or(0);
        Self { channels, len }
    }

    /// Build a mono block from a slice
    pub fn from_mono(samples: &[f32]) -> Self {
        Self::from_channels(vec![samples.to_vec()])
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Number of valid frames in the block
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0 || self.channels.is_empty()
    }

    /// Allocated frames per channel
    pub fn capacity(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Change the logical length, clamped to capacity (never reallocates)
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index][..self.len]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        let len = self.len;
        &mut self.channels[index][..len]
    }

    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        let len = self.len;
        self.channels.iter().map(move |c| &c[..len])
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        let len = self.len;
        self.channels.iter_mut().map(move |c| &mut c[..len])
    }

    /// Peak absolute value across all channels at one frame
    #[inline]
    pub fn frame_peak(&self, frame: usize) -> f32 {
        self.channels
            .iter()
            .map(|c| c[frame].abs())
            .fold(0.0_f32, f32::max)
    }

    /// Multiply every channel at one frame by `gain`
    #[inline]
    pub fn scale_frame(&mut self, frame: usize, gain: f32) {
        for channel in &mut self.channels {
            channel[frame] *= gain;
        }
    }

    /// Zero the valid region
    pub fn clear(&mut self) {
        for channel in self.channels_mut() {
            channel.fill(0.0);
        }
    }

    /// Copy the valid region of `other` (lengths and channels must fit)
    pub fn copy_from(&mut self, other: &AudioBlock) {
        self.set_len(other.len);
        for (dst, src) in self.channels_mut().zip(other.channels()) {
            dst.copy_from_slice(src);
        }
    }

    /// Add `other * gain` into this block
    pub fn add_from(&mut self, other: &AudioBlock, gain: f32) {
        for (dst, src) in self.channels_mut().zip(other.channels()) {
            for (d, s) in dst.iter_mut().zip(src) {
                *d += s * gain;
            }
        }
    }

    pub fn scale(&mut self, gain: f32) {
        for channel in self.channels_mut() {
            for sample in channel.iter_mut() {
                *sample *= gain;
            }
        }
    }

    /// Average of all channels at one frame
    #[inline]
    pub fn mono_sample(&self, frame: usize) -> f32 {
        let n = self.channels.len();
        if n == 0 {
            return 0.0;
        }
        self.channels.iter().map(|c| c[frame]).sum::<f32>() / n as f32
    }

    /// Fill this block from interleaved host samples
    ///
    /// `frames` is `data.len() / channels`, clamped to capacity.
    pub fn read_interleaved(&mut self, data: &[f32]) {
        let n = self.channels.len();
        if n == 0 {
            self.len = 0;
            return;
        }
        self.set_len(data.len() / n);
        for (frame, chunk) in data.chunks_exact(n).take(self.len).enumerate() {
            for (channel, &sample) in self.channels.iter_mut().zip(chunk) {
                channel[frame] = sample;
            }
        }
    }

    /// Write the valid region back out as interleaved samples
    pub fn write_interleaved(&self, data: &mut [f32]) {
        let n = self.channels.len();
        if n == 0 {
            return;
        }
        for (frame, chunk) in data.chunks_exact_mut(n).take(self.len).enumerate() {
            for (sample, channel) in chunk.iter_mut().zip(&self.channels) {
                *sample = channel[frame];
            }
        }
    }

    /// Root-mean-square over all channels
    pub fn rms(&self) -> f32 {
        let count = self.len * self.channels.len();
        if count == 0 {
            return 0.0;
        }
        let sum_sq: f32 = self.channels().flat_map(|c| c.iter()).map(|s| s * s).sum();
        (sum_sq / count as f32).sqrt()
    }

    /// Peak absolute value over all channels
    pub fn peak(&self) -> f32 {
        self.channels()
            .flat_map(|c| c.iter())
            .map(|s| s.abs())
            .fold(0.0_f32, f32::max)
    }
}
