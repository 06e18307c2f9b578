//! Formant detection and envelope-warping formant shift

use crate::domain::audio::{AudioBlock, ProcessSpec};
use crate::domain::dsp::Processor;
use crate::domain::params::{ParamCell, Params, SnapshotCell};
use crate::domain::spectral::{FormantDetector, OverlapAdd, FRAME_SIZE};
use crate::domain::stretch::{interpolate, spectral_envelope, MAX_PITCH_RATIO, MIN_PITCH_RATIO};
use atomic_float::AtomicF32;
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

/// Up to three formant frequencies, strongest first
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FormantSet {
    frequencies: [f32; 3],
    len: usize,
}

impl FormantSet {
    pub const CAPACITY: usize = 3;

    /// Append a frequency; ignored once full
    pub fn push(&mut self, frequency: f32) {
        if self.len < Self::CAPACITY {
            self.frequencies[self.len] = frequency;
            self.len += 1;
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.frequencies[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Map a user amount in [-50, 50] to an envelope warp ratio (±2 octaves)
pub fn amount_to_ratio(amount: f32) -> f32 {
    let normalized = (amount / 50.0).clamp(-1.0, 1.0);
    2.0_f32
        .powf(2.0 * normalized)
        .clamp(MIN_PITCH_RATIO, MAX_PITCH_RATIO)
}

/// Spectral scratch shared by all channels of a [`FormantShifter`]
struct EnvelopeWarp {
    magnitudes: Vec<f32>,
    envelope: Vec<f32>,
}

impl EnvelopeWarp {
    fn new(bins: usize) -> Self {
        Self {
            magnitudes: vec![0.0; bins],
            envelope: vec![0.0; bins],
        }
    }

    /// Re-impose the envelope read at `k / ratio` onto bin `k`
    fn apply(&mut self, spectrum: &mut [Complex32], ratio: f32) {
        for (dst, bin) in self.magnitudes.iter_mut().zip(spectrum.iter()) {
            *dst = bin.norm();
        }
        spectral_envelope(&self.magnitudes, &mut self.envelope);

        for (k, bin) in spectrum.iter_mut().enumerate() {
            let source = interpolate(&self.envelope, k as f32 / ratio);
            let gain = (source / self.envelope[k]).clamp(0.25, 4.0);
            *bin *= gain;
        }
    }
}

/// Moves the spectral envelope by a ratio while keeping the harmonics
///
/// The ratio is set through `&self` and picked up at the next block.
pub struct FormantShifter {
    engines: Vec<OverlapAdd>,
    warp: EnvelopeWarp,
    ratio: AtomicF32,
}

impl FormantShifter {
    pub fn new() -> Self {
        Self {
            engines: vec![OverlapAdd::new(FRAME_SIZE)],
            warp: EnvelopeWarp::new(FRAME_SIZE / 2 + 1),
            ratio: AtomicF32::new(1.0),
        }
    }

    /// Set the warp ratio, clamped to [0.5, 2.0]
    pub fn set_ratio(&self, ratio: f32) {
        self.ratio
            .store(ratio.clamp(MIN_PITCH_RATIO, MAX_PITCH_RATIO), Ordering::Relaxed);
    }

    pub fn ratio(&self) -> f32 {
        self.ratio.load(Ordering::Relaxed)
    }
}

impl Default for FormantShifter {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for FormantShifter {
    fn prepare(&mut self, spec: &ProcessSpec) {
        self.engines = (0..spec.channels)
            .map(|_| OverlapAdd::new(FRAME_SIZE))
            .collect();
        debug!("Formant shifter prepared: {} channels", spec.channels);
    }

    fn process(&mut self, block: &mut AudioBlock) {
        let ratio = self.ratio();
        let warp = &mut self.warp;
        for (channel, engine) in block.channels_mut().zip(self.engines.iter_mut()) {
            engine.process(channel, |spectrum| warp.apply(spectrum, ratio));
        }
    }

    fn reset(&mut self) {
        for engine in &mut self.engines {
            engine.reset();
        }
    }

    fn latency(&self) -> usize {
        self.engines.first().map(OverlapAdd::latency).unwrap_or(FRAME_SIZE)
    }

    fn name(&self) -> &str {
        "FormantShifter"
    }
}

// ============================================================================
// FORMANT ENGINE
// ============================================================================

/// Formant node parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FormantParams {
    /// Shift amount in [-50, 50]; ±50 moves the envelope two octaves
    pub amount: f32,
    /// Dry/wet mix in [0, 1]
    pub mix: f32,
}

impl Default for FormantParams {
    fn default() -> Self {
        Self { amount: 0.0, mix: 1.0 }
    }
}

impl Params for FormantParams {
    fn clamped(self) -> Self {
        Self {
            amount: self.amount.clamp(-50.0, 50.0),
            mix: self.mix.clamp(0.0, 1.0),
        }
    }
}

/// Detected formants for control-thread readers
#[derive(Debug, Clone)]
pub struct FormantMonitor {
    formants: Arc<SnapshotCell<FormantSet>>,
}

impl FormantMonitor {
    pub fn formants(&self) -> FormantSet {
        self.formants.read()
    }

    pub fn formant_frequencies(&self) -> Vec<f32> {
        self.formants().as_slice().to_vec()
    }
}

/// Fixed-length per-channel delay keeping the dry path aligned with the
/// shifter output
struct DryDelay {
    lines: Vec<Vec<f32>>,
    position: usize,
}

impl DryDelay {
    fn new(channels: usize, length: usize) -> Self {
        Self {
            lines: vec![vec![0.0; length.max(1)]; channels],
            position: 0,
        }
    }

    /// Push `dry` through the delay and mix it into `wet`
    fn mix_into(&mut self, dry: &AudioBlock, wet: &mut AudioBlock, mix: f32) {
        let start = self.position;
        let mut end = start;
        for ((line, input), output) in self.lines.iter_mut().zip(dry.channels()).zip(wet.channels_mut()) {
            let length = line.len();
            let mut position = start;
            for (&x, y) in input.iter().zip(output.iter_mut()) {
                let delayed = line[position];
                line[position] = x;
                position = (position + 1) % length;
                *y = delayed * (1.0 - mix) + *y * mix;
            }
            end = position;
        }
        self.position = end;
    }

    fn clear(&mut self) {
        for line in &mut self.lines {
            line.fill(0.0);
        }
        self.position = 0;
    }
}

/// Formant node: detection on the input, envelope shift, dry/wet mix
pub struct FormantEngine {
    params: Arc<ParamCell<FormantParams>>,
    applied: FormantParams,
    detector: FormantDetector,
    shifter: FormantShifter,
    dry: AudioBlock,
    delay: DryDelay,
}

impl FormantEngine {
    pub fn new(sample_rate: f32) -> Self {
        Self::with_params(sample_rate, FormantParams::default())
    }

    pub fn with_params(sample_rate: f32, params: FormantParams) -> Self {
        let params = params.clamped();
        let shifter = FormantShifter::new();
        shifter.set_ratio(amount_to_ratio(params.amount));
        let spec = ProcessSpec::default();
        let delay = DryDelay::new(spec.channels, shifter.latency());
        Self {
            params: ParamCell::shared(params),
            applied: params,
            detector: FormantDetector::new(sample_rate),
            shifter,
            dry: AudioBlock::for_spec(&spec),
            delay,
        }
    }

    pub fn params_handle(&self) -> Arc<ParamCell<FormantParams>> {
        Arc::clone(&self.params)
    }

    pub fn monitor(&self) -> FormantMonitor {
        FormantMonitor {
            formants: self.detector.snapshot(),
        }
    }

    /// Latest detection (audio-thread view)
    pub fn formants(&self) -> FormantSet {
        self.detector.formants()
    }

    pub fn shifter(&self) -> &FormantShifter {
        &self.shifter
    }
}

impl Processor for FormantEngine {
    fn prepare(&mut self, spec: &ProcessSpec) {
        self.detector.prepare(spec);
        self.shifter.prepare(spec);
        self.dry = AudioBlock::for_spec(spec);
        self.delay = DryDelay::new(spec.channels, self.shifter.latency());
        debug!("Formant engine prepared at {}Hz", spec.sample_rate);
    }

    fn process(&mut self, block: &mut AudioBlock) {
        let params = self.params.load();
        if params != self.applied {
            self.applied = params;
            self.shifter.set_ratio(amount_to_ratio(params.amount));
            trace!("Formant shift: amount={:.1}, mix={:.2}", params.amount, params.mix);
        }

        self.detector.analyze(block);
        if block.is_empty() {
            return;
        }

        self.dry.copy_from(block);
        self.shifter.process(block);
        self.delay.mix_into(&self.dry, block, self.applied.mix);
    }

    fn reset(&mut self) {
        self.detector.reset();
        self.shifter.reset();
        self.delay.clear();
    }

    fn latency(&self) -> usize {
        self.shifter.latency()
    }

    fn name(&self) -> &str {
        "Formant"
    }
}
