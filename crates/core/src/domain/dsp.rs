//! Digital Signal Processing primitives shared by every effect
//!
//! This module provides:
//! - The [`Processor`] contract every effect implements
//! - Decibel conversion with a -100 dBFS floor
//! - Biquad IIR filters (band extractors for the EQ, de-esser sidechain)
//! - The exponential attack/release [`EnvelopeFollower`]
//!
//! All primitives are designed for:
//! - Zero allocations in the hot path
//! - O(1) work per sample
//! - Coefficients recomputed only when a parameter changes

use crate::domain::audio::{AudioBlock, ProcessSpec};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use tracing::trace;

/// Core trait for all audio processors
///
/// Processors mutate a block in place on the audio thread. They never
/// allocate, block, or fail inside `process`.
pub trait Processor: Send {
    /// Size buffers and recompute coefficients for a new stream format
    ///
    /// Called on the control thread before the processor is published.
    fn prepare(&mut self, spec: &ProcessSpec);

    /// Process a block of audio in place
    fn process(&mut self, block: &mut AudioBlock);

    /// Clear internal state (envelopes, delay lines, FFT rings)
    fn reset(&mut self);

    /// Delay in samples introduced by the processor
    fn latency(&self) -> usize {
        0
    }

    /// Get processor name for debugging/display
    fn name(&self) -> &str;
}

/// Parameter constraints shared by the processors
///
/// All parameters are clamped to these ranges when a snapshot is stored.
pub mod params {
    /// Floor for every dB conversion (avoids -inf)
    pub const DB_FLOOR: f32 = -100.0;

    /// Threshold range for dynamics processors
    pub const THRESHOLD_MIN: f32 = -100.0;
    pub const THRESHOLD_MAX: f32 = 0.0;

    /// Static gain range
    pub const GAIN_MIN: f32 = -60.0;
    pub const GAIN_MAX: f32 = 24.0;

    /// Compressor ratio range; limiting uses the top of the range
    pub const RATIO_MIN: f32 = 1.0;
    pub const RATIO_MAX: f32 = 1000.0;

    /// Attack/Release time ranges in milliseconds
    pub const ATTACK_MIN_MS: f32 = 0.0;
    pub const ATTACK_MAX_MS: f32 = 500.0;
    pub const RELEASE_MIN_MS: f32 = 0.0;
    pub const RELEASE_MAX_MS: f32 = 5000.0;

    /// Hold time for gate (in milliseconds)
    pub const HOLD_MIN_MS: f32 = 0.0;
    pub const HOLD_MAX_MS: f32 = 2000.0;

    /// EQ band gain range (dB)
    pub const EQ_GAIN_MIN: f32 = -12.0;
    pub const EQ_GAIN_MAX: f32 = 12.0;
}

/// Convert decibels to linear gain
#[inline]
pub fn db_to_gain(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Convert linear gain to decibels, floored at -100 dBFS
#[inline]
pub fn gain_to_db(gain: f32) -> f32 {
    if gain <= 1e-5 {
        params::DB_FLOOR
    } else {
        (20.0 * gain.log10()).max(params::DB_FLOOR)
    }
}

// ============================================================================
// BIQUAD FILTER (Low-level IIR filter)
// ============================================================================

/// Biquad filter coefficients
///
/// Direct Form I implementation for numerical stability.
/// Coefficients are pre-computed to avoid per-sample calculations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiquadCoeffs {
    /// Numerator coefficients
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    /// Denominator coefficients (a0 is normalized to 1.0)
    pub a1: f32,
    pub a2: f32,
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        // Unity gain (no filtering)
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }
}

impl BiquadCoeffs {
    /// Angular frequency terms shared by the RBJ cookbook designs
    ///
    /// The frequency is kept strictly inside (0, Nyquist).
    fn prewarp(sample_rate: f32, freq: f32, q: f32) -> (f32, f32) {
        let freq = freq.clamp(1.0, sample_rate * 0.49);
        let w0 = 2.0 * PI * freq / sample_rate;
        let alpha = w0.sin() / (2.0 * q.max(0.05));
        (w0.cos(), alpha)
    }

    fn normalized(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Calculate coefficients for a second-order low-pass filter
    ///
    /// Passes frequencies below the cutoff (the EQ's low band extractor).
    #[must_use]
    pub fn low_pass(sample_rate: f32, freq: f32, q: f32) -> Self {
        let (cos_w0, alpha) = Self::prewarp(sample_rate, freq, q);
        let b1 = 1.0 - cos_w0;
        Self::normalized(b1 / 2.0, b1, b1 / 2.0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
    }

    /// Calculate coefficients for a second-order high-pass filter
    #[must_use]
    pub fn high_pass(sample_rate: f32, freq: f32, q: f32) -> Self {
        let (cos_w0, alpha) = Self::prewarp(sample_rate, freq, q);
        let b0 = (1.0 + cos_w0) / 2.0;
        Self::normalized(b0, -(1.0 + cos_w0), b0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
    }

    /// Calculate coefficients for a band-pass filter with 0 dB peak gain
    ///
    /// A tone at the centre frequency passes at unity.
    #[must_use]
    pub fn band_pass(sample_rate: f32, freq: f32, q: f32) -> Self {
        let (cos_w0, alpha) = Self::prewarp(sample_rate, freq, q);
        Self::normalized(alpha, 0.0, -alpha, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
    }

    /// Complex frequency response at `freq`
    pub fn response(&self, sample_rate: f32, freq: f32) -> Complex32 {
        let w = 2.0 * PI * freq / sample_rate;
        let z1 = Complex32::from_polar(1.0, -w);
        let z2 = z1 * z1;
        let num = Complex32::new(self.b0, 0.0) + z1 * self.b1 + z2 * self.b2;
        let den = Complex32::new(1.0, 0.0) + z1 * self.a1 + z2 * self.a2;
        num / den
    }
}

/// Stateful biquad filter using Direct Form I
///
/// Direct Form I is chosen over Transposed Direct Form II for:
/// - Better numerical stability with low-frequency filters
/// - Easier coefficient updates without artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiquadFilter {
    coeffs: BiquadCoeffs,
    // Previous input samples (x[n-1], x[n-2])
    x1: f32,
    x2: f32,
    // Previous output samples (y[n-1], y[n-2])
    y1: f32,
    y2: f32,
}

impl BiquadFilter {
    /// Create a new biquad filter with given coefficients
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    /// Create a bypass filter (unity gain)
    pub fn bypass() -> Self {
        Self::new(BiquadCoeffs::default())
    }

    /// Update filter coefficients
    ///
    /// Can be called in real-time for parameter changes.
    pub fn set_coeffs(&mut self, coeffs: BiquadCoeffs) {
        self.coeffs = coeffs;
    }

    pub fn coeffs(&self) -> &BiquadCoeffs {
        &self.coeffs
    }

    /// Process a single sample
    #[inline]
    pub fn process_sample(&mut self, x: f32) -> f32 {
        // Direct Form I: y[n] = b0*x[n] + b1*x[n-1] + b2*x[n-2]
        //                        - a1*y[n-1] - a2*y[n-2]
        let y = self.coeffs.b0 * x
            + self.coeffs.b1 * self.x1
            + self.coeffs.b2 * self.x2
            - self.coeffs.a1 * self.y1
            - self.coeffs.a2 * self.y2;

        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;

        y
    }

    /// Process a buffer of samples
    pub fn process(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            *sample = self.process_sample(*sample);
        }
    }

    /// Reset filter state
    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

// ============================================================================
// ENVELOPE FOLLOWER
// ============================================================================

/// Keeps `sample_rate * ms` away from zero so 0 ms means "instant"
const COEFF_EPSILON: f32 = 1e-6;

/// Exponential attack/release smoother
///
/// Shared by the gate, compressor and de-esser so all three follow their
/// target with identical ballistics; only the target signal differs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeFollower {
    level: f32,
    attack_coeff: f32,
    release_coeff: f32,
}

impl Default for EnvelopeFollower {
    fn default() -> Self {
        Self {
            level: 0.0,
            attack_coeff: 0.0,
            release_coeff: 0.0,
        }
    }
}

impl EnvelopeFollower {
    pub fn new(sample_rate: f32, attack_ms: f32, release_ms: f32) -> Self {
        let mut follower = Self::default();
        follower.configure(sample_rate, attack_ms, release_ms);
        follower
    }

    /// Convert a time constant to a one-pole smoothing coefficient
    #[inline]
    pub fn time_to_coeff(sample_rate: f32, time_ms: f32) -> f32 {
        let samples = sample_rate * time_ms.max(0.0) / 1000.0;
        (-1.0 / (samples + COEFF_EPSILON)).exp()
    }

    /// Recompute coefficients (only on attack/release/sample-rate change)
    pub fn configure(&mut self, sample_rate: f32, attack_ms: f32, release_ms: f32) {
        self.attack_coeff = Self::time_to_coeff(sample_rate, attack_ms);
        self.release_coeff = Self::time_to_coeff(sample_rate, release_ms);
        trace!(
            "Envelope configured: attack={:.2}ms ({:.6}), release={:.2}ms ({:.6})",
            attack_ms,
            self.attack_coeff,
            release_ms,
            self.release_coeff
        );
    }

    /// Move one sample towards `target`
    #[inline]
    pub fn update(&mut self, target: f32) -> f32 {
        let coeff = if target > self.level {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        // coeff * level + (1 - coeff) * target, arranged to stay within [level, target]
        self.level = target + coeff * (self.level - target);
        self.level
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn reset(&mut self) {
        self.level = 0.0;
    }
}

// ============================================================================
// TESTS
// ============================================================================
