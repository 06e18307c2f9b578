//! Parallel 3-band equalizer
//!
//! Each band is extracted by its own filter (low-pass, band-pass, high-pass)
//! from the dry input, and only the *difference* from unity is mixed back:
//!
//! `y = x + (g_low - 1)·low(x) + (g_mid - 1)·mid(x) + (g_high - 1)·high(x)`
//!
//! With every gain at 0 dB the extractors contribute nothing and the output
//! is bit-identical to the input.

use crate::domain::audio::{AudioBlock, ProcessSpec};
use crate::domain::dsp::{params, db_to_gain, gain_to_db, BiquadCoeffs, BiquadFilter, Processor};
use crate::domain::params::{log_frequencies, ParamCell, Params, SpectrumPoint};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

/// Butterworth Q for the low and high extractors
const SHELF_Q: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Equalizer parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqualizerParams {
    pub low_gain_db: f32,
    pub low_freq: f32,
    pub mid_gain_db: f32,
    pub mid_freq: f32,
    pub mid_q: f32,
    pub high_gain_db: f32,
    pub high_freq: f32,
}

impl Default for EqualizerParams {
    fn default() -> Self {
        Self {
            low_gain_db: 0.0,
            low_freq: Equalizer::DEFAULT_LOW_FREQ,
            mid_gain_db: 0.0,
            mid_freq: Equalizer::DEFAULT_MID_FREQ,
            mid_q: 1.0,
            high_gain_db: 0.0,
            high_freq: Equalizer::DEFAULT_HIGH_FREQ,
        }
    }
}

impl Params for EqualizerParams {
    fn clamped(self) -> Self {
        let gain = |db: f32| db.clamp(params::EQ_GAIN_MIN, params::EQ_GAIN_MAX);
        Self {
            low_gain_db: gain(self.low_gain_db),
            low_freq: self.low_freq.clamp(20.0, 500.0),
            mid_gain_db: gain(self.mid_gain_db),
            mid_freq: self.mid_freq.clamp(200.0, 5000.0),
            mid_q: self.mid_q.clamp(0.1, 5.0),
            high_gain_db: gain(self.high_gain_db),
            high_freq: self.high_freq.clamp(1000.0, 16000.0),
        }
    }
}

impl EqualizerParams {
    fn band_coeffs(&self, sample_rate: f32) -> [BiquadCoeffs; 3] {
        [
            BiquadCoeffs::low_pass(sample_rate, self.low_freq, SHELF_Q),
            BiquadCoeffs::band_pass(sample_rate, self.mid_freq, self.mid_q),
            BiquadCoeffs::high_pass(sample_rate, self.high_freq, SHELF_Q),
        ]
    }

    /// Per-band mix weights (`g - 1`)
    fn band_weights(&self) -> [f32; 3] {
        [
            db_to_gain(self.low_gain_db) - 1.0,
            db_to_gain(self.mid_gain_db) - 1.0,
            db_to_gain(self.high_gain_db) - 1.0,
        ]
    }

    /// Combined magnitude response for display
    ///
    /// Computed from the parameters alone, so it is safe to call from the
    /// control thread at any time.
    pub fn response_curve(&self, sample_rate: f32, points: usize) -> Vec<SpectrumPoint> {
        let coeffs = self.band_coeffs(sample_rate);
        let weights = self.band_weights();

        log_frequencies(20.0, sample_rate * 0.5, points)
            .map(|frequency| {
                let response = coeffs.iter().zip(weights).fold(
                    Complex32::new(1.0, 0.0),
                    |acc, (c, w)| acc + c.response(sample_rate, frequency) * w,
                );
                SpectrumPoint {
                    frequency,
                    magnitude_db: gain_to_db(response.norm()),
                }
            })
            .collect()
    }
}

/// 3-band equalizer with parallel band extraction
pub struct Equalizer {
    params: Arc<ParamCell<EqualizerParams>>,
    applied: EqualizerParams,
    sample_rate: f32,
    weights: [f32; 3],
    // One [low, mid, high] extractor set per channel
    bands: Vec<[BiquadFilter; 3]>,
}

impl Equalizer {
    /// Default cutoff of the low band
    pub const DEFAULT_LOW_FREQ: f32 = 200.0;
    /// Default center frequency of the mid band
    pub const DEFAULT_MID_FREQ: f32 = 1000.0;
    /// Default cutoff of the high band
    pub const DEFAULT_HIGH_FREQ: f32 = 2000.0;

    /// Create a new 3-band equalizer (flat)
    pub fn new(sample_rate: f32) -> Self {
        Self::with_params(sample_rate, EqualizerParams::default())
    }

    pub fn with_params(sample_rate: f32, params: EqualizerParams) -> Self {
        let params = params.clamped();
        let mut eq = Self {
            params: ParamCell::shared(params),
            applied: params,
            sample_rate,
            weights: [0.0; 3],
            bands: vec![Self::band_set(); 2],
        };
        eq.update_coefficients(params);
        eq
    }

    fn band_set() -> [BiquadFilter; 3] {
        [BiquadFilter::bypass(), BiquadFilter::bypass(), BiquadFilter::bypass()]
    }

    /// Set all parameters at once
    pub fn set_params(&mut self, params: EqualizerParams) {
        self.params.store(params);
        self.update_coefficients(self.params.load());
    }

    /// Set the mid band gain
    pub fn set_mid_gain(&mut self, gain_db: f32) {
        self.set_params(EqualizerParams {
            mid_gain_db: gain_db,
            ..self.applied
        });
    }

    pub fn params(&self) -> EqualizerParams {
        self.applied
    }

    pub fn params_handle(&self) -> Arc<ParamCell<EqualizerParams>> {
        Arc::clone(&self.params)
    }

    /// Update all filter coefficients based on current parameters
    fn update_coefficients(&mut self, params: EqualizerParams) {
        self.applied = params;
        self.weights = params.band_weights();
        let coeffs = params.band_coeffs(self.sample_rate);
        for set in &mut self.bands {
            for (filter, c) in set.iter_mut().zip(coeffs) {
                filter.set_coeffs(c);
            }
        }

        trace!(
            "EQ updated: L={:.1}dB@{:.0}Hz, M={:.1}dB@{:.0}Hz, H={:.1}dB@{:.0}Hz",
            params.low_gain_db,
            params.low_freq,
            params.mid_gain_db,
            params.mid_freq,
            params.high_gain_db,
            params.high_freq
        );
    }
}

impl Processor for Equalizer {
    fn prepare(&mut self, spec: &ProcessSpec) {
        self.sample_rate = spec.sample_rate;
        self.bands = vec![Self::band_set(); spec.channels];
        self.update_coefficients(self.params.load());
    }

    fn process(&mut self, block: &mut AudioBlock) {
        let params = self.params.load();
        if params != self.applied {
            self.update_coefficients(params);
        }

        let weights = self.weights;
        for (channel, set) in block.channels_mut().zip(self.bands.iter_mut()) {
            for sample in channel.iter_mut() {
                let x = *sample;
                let mut y = x;
                for (filter, w) in set.iter_mut().zip(weights) {
                    y += w * filter.process_sample(x);
                }
                *sample = y;
            }
        }
    }

    fn reset(&mut self) {
        for filter in self.bands.iter_mut().flatten() {
            filter.reset();
        }
    }

    fn name(&self) -> &str {
        "Equalizer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    const SAMPLE_RATE: f32 = 48000.0;

    fn generate_test_signal(samples: usize, frequency: f32) -> Vec<f32> {
        (0..samples)
            .map(|i| 0.25 * (2.0 * PI * frequency * i as f32 / SAMPLE_RATE).sin())
            .collect()
    }

    fn rms(buffer: &[f32]) -> f32 {
        (buffer.iter().map(|s| s * s).sum::<f32>() / buffer.len() as f32).sqrt()
    }

    fn process_mono(eq: &mut Equalizer, signal: &[f32]) -> Vec<f32> {
        eq.prepare(&ProcessSpec::new(SAMPLE_RATE, signal.len(), 1));
        let mut block = AudioBlock::from_mono(signal);
        eq.process(&mut block);
        block.channel(0).to_vec()
    }

    #[test]
    fn test_equalizer_flat_is_unity() {
        let mut eq = Equalizer::new(SAMPLE_RATE);
        let signal = generate_test_signal(4800, 440.0);
        let output = process_mono(&mut eq, &signal);
        assert_eq!(output, signal);
        assert_eq!(rms(&output), rms(&signal));
    }

    #[test]
    fn test_equalizer_mid_boost_raises_tone() {
        let mut eq = Equalizer::new(SAMPLE_RATE);
        eq.set_mid_gain(6.0);
        let signal = generate_test_signal(9600, Equalizer::DEFAULT_MID_FREQ);
        let output = process_mono(&mut eq, &signal);

        let gain = rms(&output[4800..]) / rms(&signal[4800..]);
        assert!((gain_to_db(gain) - 6.0).abs() < 0.5);
    }

    #[test]
    fn test_equalizer_low_boost_raises_low_tone() {
        let mut eq = Equalizer::with_params(
            SAMPLE_RATE,
            EqualizerParams {
                low_gain_db: 12.0,
                ..Default::default()
            },
        );
        let signal = generate_test_signal(9600, 60.0);
        let output = process_mono(&mut eq, &signal);
        assert!(rms(&output[4800..]) > rms(&signal[4800..]) * 2.0);
    }

    #[test]
    fn test_equalizer_high_cut_attenuates_high_tone() {
        let mut eq = Equalizer::with_params(
            SAMPLE_RATE,
            EqualizerParams {
                high_gain_db: -12.0,
                ..Default::default()
            },
        );
        let signal = generate_test_signal(9600, 8000.0);
        let output = process_mono(&mut eq, &signal);
        assert!(rms(&output[4800..]) < rms(&signal[4800..]) * 0.5);
    }

    #[test]
    fn test_equalizer_params_clamped() {
        let mut eq = Equalizer::new(SAMPLE_RATE);
        eq.set_params(EqualizerParams {
            low_gain_db: 40.0,
            mid_freq: 50_000.0,
            high_gain_db: -40.0,
            ..Default::default()
        });
        let params = eq.params();
        assert_eq!(params.low_gain_db, params::EQ_GAIN_MAX);
        assert_eq!(params.mid_freq, 5000.0);
        assert_eq!(params.high_gain_db, params::EQ_GAIN_MIN);
    }

    #[test]
    fn test_equalizer_response_curve() {
        let flat = EqualizerParams::default().response_curve(SAMPLE_RATE, 64);
        assert!(flat.iter().all(|p| p.magnitude_db.abs() < 1e-3));

        let boosted = EqualizerParams {
            mid_gain_db: 12.0,
            ..Default::default()
        }
        .response_curve(SAMPLE_RATE, 256);
        let loudest = boosted
            .iter()
            .max_by(|a, b| a.magnitude_db.total_cmp(&b.magnitude_db))
            .unwrap();
        assert!((loudest.frequency - 1000.0).abs() < 150.0);
        assert!((loudest.magnitude_db - 12.0).abs() < 0.5);
    }

    #[test]
    fn test_equalizer_snapshot_applied_at_block_start() {
        let mut eq = Equalizer::new(SAMPLE_RATE);
        eq.prepare(&ProcessSpec::new(SAMPLE_RATE, 64, 1));
        eq.params_handle().update(|p| p.high_gain_db = 3.0);

        let mut block = AudioBlock::from_mono(&[0.0; 64]);
        eq.process(&mut block);
        assert_eq!(eq.params().high_gain_db, 3.0);
    }
}
