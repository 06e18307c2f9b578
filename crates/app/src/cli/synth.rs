//! Synthetic voice used as CLI input

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::f32::consts::PI;

/// Noise-only lead-in before the voice starts (for noise learning)
pub const NOISE_LEAD_SECS: f32 = 0.5;

const NOISE_LEVEL: f32 = 0.01;
/// Fixed so every render of the same arguments is identical
const NOISE_SEED: u64 = 0x9E37_79B9;
const VIBRATO_HZ: f32 = 5.5;
const VIBRATO_DEPTH: f32 = 0.01;
const HARMONICS: usize = 24;
/// Rough /a/ vowel resonances (Hz, bandwidth Hz)
const VOWEL: [(f32, f32); 3] = [(700.0, 130.0), (1220.0, 70.0), (2600.0, 160.0)];

/// Harmonic "voice" with vibrato, a vowel envelope, background hiss and a
/// periodic sibilant burst
pub struct VoiceSynth {
    sample_rate: f32,
    pitch: f32,
    phase: f32,
    vibrato_phase: f32,
    weights: [f32; HARMONICS],
    noise: Pcg32,
    position: usize,
}

impl VoiceSynth {
    pub fn new(sample_rate: f32, pitch: f32) -> Self {
        let mut weights = [0.0; HARMONICS];
        for (h, weight) in weights.iter_mut().enumerate() {
            let frequency = pitch * (h + 1) as f32;
            let resonance: f32 = VOWEL
                .iter()
                .map(|&(center, width)| 1.0 / (1.0 + ((frequency - center) / width).powi(2)))
                .sum();
            *weight = 0.08 * resonance / (h + 1) as f32;
        }
        Self {
            sample_rate,
            pitch,
            phase: 0.0,
            vibrato_phase: 0.0,
            weights,
            noise: Pcg32::seed_from_u64(NOISE_SEED),
            position: 0,
        }
    }

    /// Uniform noise in [-1, 1)
    fn white(&mut self) -> f32 {
        self.noise.gen_range(-1.0..1.0)
    }

    pub fn next_sample(&mut self) -> f32 {
        let t = self.position as f32 / self.sample_rate;
        self.position += 1;
        let hiss = NOISE_LEVEL * self.white();
        if t < NOISE_LEAD_SECS {
            return hiss;
        }

        self.vibrato_phase = (self.vibrato_phase + VIBRATO_HZ / self.sample_rate).fract();
        let vibrato = 1.0 + VIBRATO_DEPTH * (2.0 * PI * self.vibrato_phase).sin();
        self.phase = (self.phase + self.pitch * vibrato / self.sample_rate).fract();

        let voiced: f32 = self
            .weights
            .iter()
            .enumerate()
            .map(|(h, w)| w * (2.0 * PI * self.phase * (h + 1) as f32).sin())
            .sum();

        // 80 ms "s" every second; differenced noise tilts it toward the top
        let sibilant = if (t - NOISE_LEAD_SECS).fract() > 0.92 {
            let a = self.white();
            let b = self.white();
            0.15 * (a - b)
        } else {
            0.0
        };

        voiced + sibilant + hiss
    }

    pub fn fill(&mut self, buffer: &mut [f32], channels: usize) {
        for frame in buffer.chunks_exact_mut(channels.max(1)) {
            frame.fill(self.next_sample());
        }
    }
}
