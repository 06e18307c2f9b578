//! Fundamental-frequency tracking and scale-quantized pitch correction
//!
//! [`PitchDetector`] runs YIN once per block over the most recent window;
//! [`PitchCorrector`] turns its estimate into a smoothed shift ratio and
//! drives a [`PitchShifter`] with it.

use crate::domain::audio::{AudioBlock, ProcessSpec};
use crate::domain::dsp::Processor;
use crate::domain::params::{ParamCell, Params};
use crate::domain::stretch::{PitchShifter, MAX_PITCH_RATIO, MIN_PITCH_RATIO};
use atomic_float::AtomicF32;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

/// Absolute threshold on the normalized difference function
pub const YIN_THRESHOLD: f32 = 0.15;
/// Global-minimum fallback is only trusted below this value
pub const VOICING_CEILING: f32 = 0.5;
/// Frames quieter than this RMS are unvoiced without analysis
const SILENCE_RMS: f32 = 1e-4;
/// Candidate lists are capped at this length
const MAX_CANDIDATES: usize = 8;

const NOTE_NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

/// Fractional MIDI note number of `frequency` (A4 = 69 = 440 Hz)
pub fn midi_from_frequency(frequency: f32) -> f32 {
    69.0 + 12.0 * (frequency / 440.0).log2()
}

/// Frequency of a (possibly fractional) MIDI note
pub fn frequency_from_midi(midi: f32) -> f32 {
    440.0 * 2.0_f32.powf((midi - 69.0) / 12.0)
}

/// Semitone distance from `reference` (`12·log2(f/ref)`)
pub fn semitone_offset(frequency: f32, reference: f32) -> f32 {
    12.0 * (frequency / reference).log2()
}

/// Note name with octave, e.g. `A4`
pub fn note_name(midi: i32) -> String {
    let octave = midi.div_euclid(12) - 1;
    format!("{}{}", NOTE_NAMES[midi.rem_euclid(12) as usize], octave)
}

// ============================================================================
// PITCH DETECTOR (YIN)
// ============================================================================

/// Lag selection strategy over the normalized difference function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Tracking {
    /// First dip under the absolute threshold (plain YIN)
    #[default]
    Single,
    /// Score every dip against the previous estimate (pYIN-style)
    Candidates,
}

/// YIN fundamental-frequency estimator
///
/// Keeps the last `window_size` mono samples in a circular buffer. The
/// difference function over `window_size / 2` lags is built from one FFT
/// cross-correlation plus running energies, so each detection costs
/// O(W log W) rather than O(W²).
pub struct PitchDetector {
    sample_rate: f32,
    window_size: usize,
    history: Vec<f32>,
    write_pos: usize,
    frame: Vec<f32>,
    difference: Vec<f32>,
    correlation: Vec<Complex32>,
    kernel: Vec<Complex32>,
    scratch: Vec<Complex32>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    frequency: f32,
    tracking: Tracking,
}

impl PitchDetector {
    pub const DEFAULT_WINDOW: usize = 2048;

    pub fn new(sample_rate: f32) -> Self {
        Self::with_window(sample_rate, Self::DEFAULT_WINDOW)
    }

    pub fn with_window(sample_rate: f32, window_size: usize) -> Self {
        let window_size = window_size.max(64).next_power_of_two();
        let mut planner = FftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(window_size);
        let inverse = planner.plan_fft_inverse(window_size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        Self {
            sample_rate,
            window_size,
            history: vec![0.0; window_size],
            write_pos: 0,
            frame: vec![0.0; window_size],
            difference: vec![0.0; window_size / 2],
            correlation: vec![Complex32::new(0.0, 0.0); window_size],
            kernel: vec![Complex32::new(0.0, 0.0); window_size],
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
            forward,
            inverse,
            frequency: 0.0,
            tracking: Tracking::Single,
        }
    }

    pub fn set_tracking(&mut self, tracking: Tracking) {
        self.tracking = tracking;
    }

    pub fn prepare(&mut self, spec: &ProcessSpec) {
        self.sample_rate = spec.sample_rate;
        self.reset();
    }

    /// Current estimate in Hz (0 = unvoiced)
    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Feed the mono mix of a block and run one detection
    pub fn push(&mut self, block: &AudioBlock) -> f32 {
        if block.is_empty() {
            self.frequency = 0.0;
            return 0.0;
        }
        for frame in 0..block.len() {
            self.write(block.mono_sample(frame));
        }
        self.detect()
    }

    /// Feed mono samples and run one detection
    pub fn push_samples(&mut self, samples: &[f32]) -> f32 {
        if samples.is_empty() {
            self.frequency = 0.0;
            return 0.0;
        }
        for &sample in samples {
            self.write(sample);
        }
        self.detect()
    }

    pub fn reset(&mut self) {
        self.history.fill(0.0);
        self.write_pos = 0;
        self.frequency = 0.0;
    }

    #[inline]
    fn write(&mut self, sample: f32) {
        self.history[self.write_pos] = sample;
        self.write_pos = (self.write_pos + 1) % self.window_size;
    }

    /// Run YIN over the unwrapped window
    fn detect(&mut self) -> f32 {
        // Oldest sample first
        let (newer, older) = self.history.split_at(self.write_pos);
        self.frame[..older.len()].copy_from_slice(older);
        self.frame[older.len()..].copy_from_slice(newer);

        let energy = self.frame.iter().map(|s| s * s).sum::<f32>() / self.window_size as f32;
        if energy.sqrt() < SILENCE_RMS {
            self.frequency = 0.0;
            return 0.0;
        }

        self.difference_function();
        self.cumulative_mean_normalize();

        let lag = match self.tracking {
            Tracking::Single => self.absolute_threshold(),
            Tracking::Candidates => self.best_candidate(),
        };

        self.frequency = match lag {
            Some(tau) => {
                let refined = self.parabolic(tau);
                if refined > 0.0 {
                    self.sample_rate / refined
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.frequency
    }

    /// `d(τ) = r(0) + r_τ(0) − 2·acf(τ)` for τ in `[0, W/2)`
    fn difference_function(&mut self) {
        let half = self.window_size / 2;

        for (dst, &x) in self.correlation.iter_mut().zip(&self.frame) {
            *dst = Complex32::new(x, 0.0);
        }
        for (i, dst) in self.kernel.iter_mut().enumerate() {
            let x = if i < half { self.frame[i] } else { 0.0 };
            *dst = Complex32::new(x, 0.0);
        }
        self.forward
            .process_with_scratch(&mut self.correlation, &mut self.scratch);
        self.forward
            .process_with_scratch(&mut self.kernel, &mut self.scratch);
        for (a, b) in self.correlation.iter_mut().zip(&self.kernel) {
            *a *= b.conj();
        }
        self.inverse
            .process_with_scratch(&mut self.correlation, &mut self.scratch);

        let scale = 1.0 / self.window_size as f32;
        let energy_head: f32 = self.frame[..half].iter().map(|s| s * s).sum();
        let mut energy_shifted = energy_head;
        for tau in 0..half {
            let acf = self.correlation[tau].re * scale;
            self.difference[tau] = (energy_head + energy_shifted - 2.0 * acf).max(0.0);
            let leaving = self.frame[tau];
            let entering = self.frame[tau + half];
            energy_shifted += entering * entering - leaving * leaving;
        }
        self.difference[0] = 1.0;
    }

    /// `d'(τ) = d(τ)·τ / Σ d(1..=τ)`, with `d'(0) = 1`
    fn cumulative_mean_normalize(&mut self) {
        let mut running = 0.0;
        for tau in 1..self.difference.len() {
            running += self.difference[tau];
            self.difference[tau] = if running > 0.0 {
                self.difference[tau] * tau as f32 / running
            } else {
                1.0
            };
        }
        self.difference[0] = 1.0;
    }

    fn absolute_threshold(&self) -> Option<usize> {
        let d = &self.difference;
        let mut tau = 2;
        while tau < d.len() {
            if d[tau] < YIN_THRESHOLD {
                while tau + 1 < d.len() && d[tau + 1] < d[tau] {
                    tau += 1;
                }
                return Some(tau);
            }
            tau += 1;
        }

        let (best, value) = d
            .iter()
            .enumerate()
            .skip(2)
            .fold((0, f32::MAX), |acc, (i, &v)| if v < acc.1 { (i, v) } else { acc });
        (best > 0 && value < VOICING_CEILING).then_some(best)
    }

    /// Pick among all local minima, preferring low d' and continuity with
    /// the previous estimate
    fn best_candidate(&self) -> Option<usize> {
        let d = &self.difference;
        let mut candidates = [(0_usize, 0.0_f32); MAX_CANDIDATES];
        let mut count = 0;
        for tau in 2..d.len().saturating_sub(1) {
            if d[tau] < VOICING_CEILING && d[tau] < d[tau - 1] && d[tau] <= d[tau + 1] {
                candidates[count] = (tau, d[tau]);
                count += 1;
                if count == MAX_CANDIDATES {
                    break;
                }
            }
        }

        let previous = self.frequency;
        candidates[..count]
            .iter()
            .enumerate()
            .map(|(order, &(tau, value))| {
                let mut score = value + 0.02 * order as f32;
                if previous > 0.0 {
                    let frequency = self.sample_rate / tau as f32;
                    score += 0.1 * (frequency / previous).log2().abs();
                }
                (tau, score)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(tau, _)| tau)
    }

    /// Sub-sample lag from a parabola through the three neighbours
    fn parabolic(&self, tau: usize) -> f32 {
        let d = &self.difference;
        if tau < 1 || tau + 1 >= d.len() {
            return tau as f32;
        }
        tau as f32 + parabolic_offset(d[tau - 1], d[tau], d[tau + 1])
    }
}

/// Vertex offset of the parabola through `(-1, a)`, `(0, b)`, `(1, c)`
///
/// Kept within half a lag; the neighbours of a threshold crossing need not
/// bracket a true minimum.
fn parabolic_offset(a: f32, b: f32, c: f32) -> f32 {
    let denominator = a - 2.0 * b + c;
    if denominator.abs() < f32::EPSILON {
        return 0.0;
    }
    (0.5 * (a - c) / denominator).clamp(-0.5, 0.5)
}

// ============================================================================
// SCALES
// ============================================================================

/// Pitch classes a corrected note may land on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Scale {
    #[default]
    Chromatic,
    Major,
    Minor,
    PentatonicMajor,
    PentatonicMinor,
    Blues,
}

impl Scale {
    /// Semitone offsets from the key
    pub fn intervals(&self) -> &'static [i32] {
        match self {
            Scale::Chromatic => &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11],
            Scale::Major => &[0, 2, 4, 5, 7, 9, 11],
            Scale::Minor => &[0, 2, 3, 5, 7, 8, 10],
            Scale::PentatonicMajor => &[0, 2, 4, 7, 9],
            Scale::PentatonicMinor => &[0, 3, 5, 7, 10],
            Scale::Blues => &[0, 3, 5, 6, 7, 10],
        }
    }

    pub fn contains(&self, key: u8, midi: i32) -> bool {
        let degree = (midi - key as i32).rem_euclid(12);
        self.intervals().contains(&degree)
    }

    /// Closest member of the scale to `midi`, searching an octave each way
    /// (ties resolve downward)
    pub fn quantize(&self, key: u8, midi: i32) -> i32 {
        (0..=12)
            .flat_map(|distance| [midi - distance, midi + distance])
            .find(|&candidate| self.contains(key, candidate))
            .unwrap_or(midi)
    }
}

// ============================================================================
// PITCH CORRECTOR
// ============================================================================

/// Pitch correction parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PitchCorrectorParams {
    /// Tonic pitch class, 0 = C
    pub key: u8,
    pub scale: Scale,
    /// Per-block ratio smoothing in [0, 1); 0 snaps immediately
    pub smoothing: f32,
    #[serde(default)]
    pub tracking: Tracking,
}

impl Default for PitchCorrectorParams {
    fn default() -> Self {
        Self {
            key: 0,
            scale: Scale::Chromatic,
            smoothing: 0.8,
            tracking: Tracking::Single,
        }
    }
}

impl Params for PitchCorrectorParams {
    fn clamped(self) -> Self {
        Self {
            key: self.key % 12,
            smoothing: self.smoothing.clamp(0.0, 0.999),
            ..self
        }
    }
}

/// Detected pitch and applied ratio, readable from any thread
#[derive(Debug)]
pub struct PitchMonitor {
    frequency: AtomicF32,
    ratio: AtomicF32,
}

impl Default for PitchMonitor {
    fn default() -> Self {
        Self {
            frequency: AtomicF32::new(0.0),
            ratio: AtomicF32::new(1.0),
        }
    }
}

impl PitchMonitor {
    /// Detected pitch in Hz (0 = unvoiced)
    pub fn current_pitch(&self) -> f32 {
        self.frequency.load(Ordering::Relaxed)
    }

    /// Nearest MIDI note, `None` while unvoiced
    pub fn current_note(&self) -> Option<i32> {
        let frequency = self.current_pitch();
        (frequency > 0.0).then(|| midi_from_frequency(frequency).round() as i32)
    }

    pub fn current_note_name(&self) -> Option<String> {
        self.current_note().map(note_name)
    }

    /// Offset from `reference` Hz in semitones, `None` while unvoiced
    pub fn semitone_offset(&self, reference: f32) -> Option<f32> {
        let frequency = self.current_pitch();
        (frequency > 0.0).then(|| semitone_offset(frequency, reference))
    }

    /// Shift ratio currently applied
    pub fn current_ratio(&self) -> f32 {
        self.ratio.load(Ordering::Relaxed)
    }

    fn publish(&self, frequency: f32, ratio: f32) {
        self.frequency.store(frequency, Ordering::Relaxed);
        self.ratio.store(ratio, Ordering::Relaxed);
    }
}

/// Automatic pitch correction
///
/// Unvoiced blocks force the ratio to exactly 1.0; the shifter keeps
/// running so the node latency never changes.
pub struct PitchCorrector {
    params: Arc<ParamCell<PitchCorrectorParams>>,
    applied: PitchCorrectorParams,
    detector: PitchDetector,
    shifter: PitchShifter,
    ratio: f32,
    monitor: Arc<PitchMonitor>,
}

impl PitchCorrector {
    pub fn new(sample_rate: f32) -> Self {
        Self::with_params(sample_rate, PitchCorrectorParams::default())
    }

    pub fn with_params(sample_rate: f32, params: PitchCorrectorParams) -> Self {
        let params = params.clamped();
        let mut detector = PitchDetector::new(sample_rate);
        detector.set_tracking(params.tracking);
        Self {
            params: ParamCell::shared(params),
            applied: params,
            detector,
            shifter: PitchShifter::new(),
            ratio: 1.0,
            monitor: Arc::new(PitchMonitor::default()),
        }
    }

    pub fn params_handle(&self) -> Arc<ParamCell<PitchCorrectorParams>> {
        Arc::clone(&self.params)
    }

    pub fn monitor(&self) -> Arc<PitchMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Ratio applied to the most recent block
    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    /// Smoothed ratio for a voiced detection
    fn target_ratio(&self, detected: f32) -> f32 {
        let params = &self.applied;
        let note = midi_from_frequency(detected).round() as i32;
        let quantized = params.scale.quantize(params.key, note);
        let target = (frequency_from_midi(quantized as f32) / detected).clamp(MIN_PITCH_RATIO, MAX_PITCH_RATIO);
        self.ratio * params.smoothing + target * (1.0 - params.smoothing)
    }
}

impl Processor for PitchCorrector {
    fn prepare(&mut self, spec: &ProcessSpec) {
        self.detector.prepare(spec);
        self.shifter.prepare(spec);
        self.ratio = 1.0;
        debug!("Pitch corrector prepared at {}Hz", spec.sample_rate);
    }

    fn process(&mut self, block: &mut AudioBlock) {
        let params = self.params.load();
        if params != self.applied {
            self.applied = params;
            self.detector.set_tracking(params.tracking);
            trace!("Pitch correction: key={}, scale={:?}", params.key, params.scale);
        }

        let detected = self.detector.push(block);
        self.ratio = if detected > 0.0 {
            self.target_ratio(detected)
        } else {
            1.0
        };

        self.shifter.set_ratio(self.ratio);
        self.shifter.process(block);
        self.monitor.publish(detected, self.ratio);
    }

    fn reset(&mut self) {
        self.detector.reset();
        self.shifter.reset();
        self.ratio = 1.0;
        self.monitor.publish(0.0, 1.0);
    }

    fn latency(&self) -> usize {
        self.shifter.latency()
    }

    fn name(&self) -> &str {
        "PitchCorrector"
    }
}
