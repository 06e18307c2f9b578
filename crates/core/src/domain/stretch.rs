//! Pitch shifting behind a narrow time-stretch interface
//!
//! [`PitchShifter`] owns the buffering: it feeds its stretch primitive
//! exactly the number of input samples the primitive asks for, collects
//! whatever output is ready, and plays it back one sample per input sample.
//! Any primitive implementing [`TimeStretch`] can be substituted; the
//! bundled one is [`PhaseVocoder`].

use crate::domain::audio::{AudioBlock, ProcessSpec};
use crate::domain::dsp::Processor;
use crate::domain::params::{ParamCell, Params};
use crate::domain::spectral::{OverlapAdd, FRAME_SIZE, OVERLAP};
use atomic_float::AtomicF32;
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

/// Lowest pitch ratio accepted by the shifter (one octave down)
pub const MIN_PITCH_RATIO: f32 = 0.5;
/// Highest pitch ratio accepted by the shifter (one octave up)
pub const MAX_PITCH_RATIO: f32 = 2.0;

// ============================================================================
// SAMPLE RING
// ============================================================================

/// Fixed-capacity FIFO of samples
///
/// One slot is kept free to tell full from empty, so `capacity - 1`
/// samples fit. Never reallocates after construction.
#[derive(Debug, Clone)]
pub struct SampleRing {
    buffer: Vec<f32>,
    capacity: usize,
    write_pos: usize,
    read_pos: usize,
}

impl SampleRing {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            buffer: vec![0.0; capacity],
            capacity,
            write_pos: 0,
            read_pos: 0,
        }
    }

    /// Write as many samples as fit, returning the count written
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let to_write = samples.len().min(self.available_write());
        for &sample in &samples[..to_write] {
            self.buffer[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.capacity;
        }
        to_write
    }

    /// Read up to `output.len()` samples, returning the count read
    pub fn read(&mut self, output: &mut [f32]) -> usize {
        let to_read = output.len().min(self.available_read());
        for slot in &mut output[..to_read] {
            *slot = self.buffer[self.read_pos];
            self.read_pos = (self.read_pos + 1) % self.capacity;
        }
        to_read
    }

    #[inline]
    pub fn push(&mut self, sample: f32) -> bool {
        self.write(&[sample]) == 1
    }

    #[inline]
    pub fn pop(&mut self) -> Option<f32> {
        let mut sample = [0.0];
        (self.read(&mut sample) == 1).then_some(sample[0])
    }

    pub fn available_write(&self) -> usize {
        self.capacity - self.available_read() - 1
    }

    pub fn available_read(&self) -> usize {
        if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.capacity - (self.read_pos - self.write_pos)
        }
    }

    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
        self.read_pos = 0;
    }
}

// ============================================================================
// TIME-STRETCH PRIMITIVE
// ============================================================================

/// Real-time pitch/time scaling primitive
///
/// Consumes and produces mono samples in whatever quantities suit the
/// algorithm; [`PitchShifter`] adapts it to fixed host blocks.
pub trait TimeStretch: Send {
    /// Allocate for the stream; called off the audio thread
    fn prepare(&mut self, sample_rate: f32, max_block_size: usize);

    /// Set the pitch ratio (already clamped by the caller)
    fn set_pitch_ratio(&mut self, ratio: f32);

    /// Input samples needed before the next output becomes available
    fn samples_required(&self) -> usize;

    /// Feed input samples
    fn push(&mut self, input: &[f32]);

    /// Output samples ready to be pulled
    fn available(&self) -> usize;

    /// Move ready output into `output`, returning the count written
    fn pull(&mut self, output: &mut [f32]) -> usize;

    /// Delay between a pushed sample and its pulled counterpart
    fn latency(&self) -> usize;

    fn reset(&mut self);
}

/// Moving-average half width (bins) used for spectral envelopes
pub(crate) const ENVELOPE_RADIUS: usize = 12;

/// Smooth `magnitudes` into `envelope` with a centred moving average
pub(crate) fn spectral_envelope(magnitudes: &[f32], envelope: &mut [f32]) {
    let n = magnitudes.len();
    if n == 0 {
        return;
    }
    let mut sum: f32 = magnitudes[..ENVELOPE_RADIUS.min(n)].iter().sum();
    for k in 0..n {
        let enter = k + ENVELOPE_RADIUS;
        if enter < n {
            sum += magnitudes[enter];
        }
        if k > ENVELOPE_RADIUS {
            sum -= magnitudes[k - ENVELOPE_RADIUS - 1];
        }
        let lo = k.saturating_sub(ENVELOPE_RADIUS);
        let hi = (k + ENVELOPE_RADIUS).min(n - 1);
        envelope[k] = (sum / (hi - lo + 1) as f32).max(1e-9);
    }
}

/// Linear interpolation into `values` at fractional index `position`
#[inline]
pub(crate) fn interpolate(values: &[f32], position: f32) -> f32 {
    let last = values.len().saturating_sub(1);
    let position = position.clamp(0.0, last as f32);
    let index = position as usize;
    let frac = position - index as f32;
    let next = (index + 1).min(last);
    values[index] + (values[next] - values[index]) * frac
}

/// Per-bin analysis/synthesis state of the phase vocoder
struct VocoderBins {
    last_phase: Vec<f32>,
    sum_phase: Vec<f32>,
    magnitude: Vec<f32>,
    frequency: Vec<f32>,
    envelope: Vec<f32>,
    synth_magnitude: Vec<f32>,
    synth_frequency: Vec<f32>,
}

impl VocoderBins {
    fn new(bins: usize) -> Self {
        Self {
            last_phase: vec![0.0; bins],
            sum_phase: vec![0.0; bins],
            magnitude: vec![0.0; bins],
            frequency: vec![0.0; bins],
            envelope: vec![0.0; bins],
            synth_magnitude: vec![0.0; bins],
            synth_frequency: vec![0.0; bins],
        }
    }

    fn reset(&mut self) {
        self.last_phase.fill(0.0);
        self.sum_phase.fill(0.0);
    }

    /// Shift every partial by `ratio`, optionally re-imposing the original
    /// spectral envelope so formants stay put
    fn shift(&mut self, spectrum: &mut [Complex32], ratio: f32, hop: usize, size: usize, preserve_formants: bool) {
        let bins = spectrum.len();
        let oversample = (size / hop) as f32;
        let expected = 2.0 * PI * hop as f32 / size as f32;

        // Analysis: true frequency of each bin, in bins
        for (k, bin) in spectrum.iter().enumerate() {
            let phase = bin.arg();
            let mut delta = phase - self.last_phase[k] - k as f32 * expected;
            self.last_phase[k] = phase;
            delta -= 2.0 * PI * (delta / (2.0 * PI)).round();
            self.magnitude[k] = bin.norm();
            self.frequency[k] = k as f32 + delta * oversample / (2.0 * PI);
        }

        if preserve_formants {
            spectral_envelope(&self.magnitude, &mut self.envelope);
        }

        // Remap partials
        self.synth_magnitude.fill(0.0);
        self.synth_frequency.fill(0.0);
        for k in 0..bins {
            let target = (k as f32 * ratio).round() as usize;
            if target >= bins {
                continue;
            }
            let gain = if preserve_formants {
                (self.envelope[target] / self.envelope[k]).clamp(0.25, 4.0)
            } else {
                1.0
            };
            self.synth_magnitude[target] += self.magnitude[k] * gain;
            self.synth_frequency[target] = self.frequency[k] * ratio;
        }

        // Synthesis: accumulate phase at the remapped true frequency
        for (k, bin) in spectrum.iter_mut().enumerate() {
            let deviation = self.synth_frequency[k] - k as f32;
            let advance = deviation * 2.0 * PI / oversample + k as f32 * expected;
            self.sum_phase[k] = (self.sum_phase[k] + advance).rem_euclid(2.0 * PI);
            *bin = Complex32::from_polar(self.synth_magnitude[k], self.sum_phase[k]);
        }
    }
}

/// Phase-vocoder pitch shifter on the overlap-add engine
///
/// Produces one output sample per input sample after a fixed latency of
/// one frame; partial frequencies are scaled by the ratio and, when
/// formant preservation is on, the original spectral envelope is kept.
pub struct PhaseVocoder {
    engine: OverlapAdd,
    bins: VocoderBins,
    ratio: f32,
    preserve_formants: bool,
    pushed_in_hop: usize,
    output: SampleRing,
}

impl PhaseVocoder {
    pub fn new(preserve_formants: bool) -> Self {
        let engine = OverlapAdd::new(FRAME_SIZE);
        let bins = VocoderBins::new(engine.bins());
        Self {
            output: SampleRing::with_capacity(engine.size() + 1),
            engine,
            bins,
            ratio: 1.0,
            preserve_formants,
            pushed_in_hop: 0,
        }
    }

    pub fn ratio(&self) -> f32 {
        self.ratio
    }
}

impl Default for PhaseVocoder {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TimeStretch for PhaseVocoder {
    fn prepare(&mut self, _sample_rate: f32, max_block_size: usize) {
        self.output = SampleRing::with_capacity(self.engine.size() + max_block_size + 1);
        self.reset();
    }

    fn set_pitch_ratio(&mut self, ratio: f32) {
        self.ratio = ratio;
    }

    fn samples_required(&self) -> usize {
        self.engine.hop() - self.pushed_in_hop
    }

    fn push(&mut self, input: &[f32]) {
        let hop = self.engine.hop();
        let size = self.engine.size();
        let ratio = self.ratio;
        let preserve = self.preserve_formants;
        let Self {
            engine, bins, output, ..
        } = self;

        let mut transform = |spectrum: &mut [Complex32]| {
            if (ratio - 1.0).abs() > f32::EPSILON || preserve {
                bins.shift(spectrum, ratio, hop, size, preserve);
            }
        };

        for &sample in input {
            let shifted = engine.process_sample(sample, &mut transform);
            output.push(shifted);
        }
        self.pushed_in_hop = (self.pushed_in_hop + input.len()) % hop;
    }

    fn available(&self) -> usize {
        self.output.available_read()
    }

    fn pull(&mut self, output: &mut [f32]) -> usize {
        self.output.read(output)
    }

    fn latency(&self) -> usize {
        self.engine.latency()
    }

    fn reset(&mut self) {
        self.engine.reset();
        self.bins.reset();
        self.output.clear();
        self.pushed_in_hop = 0;
    }
}

// ============================================================================
// PITCH SHIFTER
// ============================================================================

/// Ratio-controlled pitch shifter with its own input/output buffering
///
/// The mono mix of the block is shifted and copied to every channel. The
/// ratio is set through `&self`, so the pitch corrector retunes it between
/// blocks without re-preparing.
pub struct PitchShifter<S: TimeStretch = PhaseVocoder> {
    stretch: S,
    ratio: AtomicF32,
    input: SampleRing,
    output: SampleRing,
    scratch: Vec<f32>,
    prime: usize,
}

impl PitchShifter<PhaseVocoder> {
    pub fn new() -> Self {
        Self::with_stretch(PhaseVocoder::default())
    }
}

impl Default for PitchShifter<PhaseVocoder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: TimeStretch> PitchShifter<S> {
    pub fn with_stretch(stretch: S) -> Self {
        let mut shifter = Self {
            stretch,
            ratio: AtomicF32::new(1.0),
            input: SampleRing::with_capacity(2),
            output: SampleRing::with_capacity(2),
            scratch: Vec::new(),
            prime: 0,
        };
        let spec = ProcessSpec::default();
        shifter.allocate(spec.sample_rate, spec.max_block_size);
        shifter
    }

    /// Set the pitch ratio, clamped to one octave either way
    pub fn set_ratio(&self, ratio: f32) {
        self.ratio
            .store(ratio.clamp(MIN_PITCH_RATIO, MAX_PITCH_RATIO), Ordering::Relaxed);
    }

    pub fn ratio(&self) -> f32 {
        self.ratio.load(Ordering::Relaxed)
    }

    fn allocate(&mut self, sample_rate: f32, max_block_size: usize) {
        self.stretch.prepare(sample_rate, max_block_size);
        // Samples the primitive may ask for at once; queued output never
        // exceeds one chunk plus the priming silence
        let chunk = self.stretch.samples_required().max(1);
        self.prime = chunk;
        self.scratch = vec![0.0; chunk.max(max_block_size)];
        self.input = SampleRing::with_capacity(chunk + max_block_size + 1);
        self.output = SampleRing::with_capacity(2 * chunk + max_block_size + 1);
        self.reset();
    }

    /// Hand the primitive one chunk and collect what it produced
    fn feed(&mut self) {
        let need = self.stretch.samples_required().min(self.scratch.len());
        let read = self.input.read(&mut self.scratch[..need]);
        self.stretch.push(&self.scratch[..read]);

        while self.stretch.available() > 0 {
            let pulled = self.stretch.pull(&mut self.scratch);
            if pulled == 0 {
                break;
            }
            self.output.write(&self.scratch[..pulled]);
        }
    }
}

impl<S: TimeStretch> Processor for PitchShifter<S> {
    fn prepare(&mut self, spec: &ProcessSpec) {
        self.allocate(spec.sample_rate, spec.max_block_size);
        debug!(
            "Pitch shifter prepared: latency={} samples",
            self.latency()
        );
    }

    fn process(&mut self, block: &mut AudioBlock) {
        if block.is_empty() {
            return;
        }
        self.stretch.set_pitch_ratio(self.ratio());

        for frame in 0..block.len() {
            self.input.push(block.mono_sample(frame));
            if self.input.available_read() >= self.stretch.samples_required() {
                self.feed();
            }

            let shifted = self.output.pop().unwrap_or(0.0);
            for channel in block.channels_mut() {
                channel[frame] = shifted;
            }
        }
    }

    fn reset(&mut self) {
        self.stretch.reset();
        self.input.clear();
        self.output.clear();
        for _ in 0..self.prime {
            self.output.push(0.0);
        }
    }

    fn latency(&self) -> usize {
        self.stretch.latency() + self.prime
    }

    fn name(&self) -> &str {
        "PitchShifter"
    }
}

// ============================================================================
// MANUAL TRANSPOSE
// ============================================================================

/// Manual pitch shift parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PitchShiftParams {
    /// Shift in semitones, ±12
    pub semitones: f32,
}

impl Default for PitchShiftParams {
    fn default() -> Self {
        Self { semitones: 0.0 }
    }
}

impl Params for PitchShiftParams {
    fn clamped(self) -> Self {
        Self {
            semitones: self.semitones.clamp(-12.0, 12.0),
        }
    }
}

impl PitchShiftParams {
    pub fn ratio(&self) -> f32 {
        2.0_f32.powf(self.semitones / 12.0)
    }
}

/// Fixed transposition through a [`PitchShifter`]
pub struct Transposer {
    params: Arc<ParamCell<PitchShiftParams>>,
    applied: PitchShiftParams,
    shifter: PitchShifter,
}

impl Transposer {
    pub fn new(params: PitchShiftParams) -> Self {
        let params = params.clamped();
        let shifter = PitchShifter::new();
        shifter.set_ratio(params.ratio());
        Self {
            params: ParamCell::shared(params),
            applied: params,
            shifter,
        }
    }

    pub fn params_handle(&self) -> Arc<ParamCell<PitchShiftParams>> {
        Arc::clone(&self.params)
    }

    pub fn shifter(&self) -> &PitchShifter {
        &self.shifter
    }
}

impl Processor for Transposer {
    fn prepare(&mut self, spec: &ProcessSpec) {
        self.shifter.prepare(spec);
    }

    fn process(&mut self, block: &mut AudioBlock) {
        let params = self.params.load();
        if params != self.applied {
            self.applied = params;
            self.shifter.set_ratio(params.ratio());
            trace!("Transpose set to {:+.2} semitones", params.semitones);
        }
        self.shifter.process(block);
    }

    fn reset(&mut self) {
        self.shifter.reset();
    }

    fn latency(&self) -> usize {
        self.shifter.latency()
    }

    fn name(&self) -> &str {
        "PitchShift"
    }
}
