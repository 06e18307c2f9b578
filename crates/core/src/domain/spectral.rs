//! Overlap-add spectral engine and its analysis/processing specializations
//!
//! [`OverlapAdd`] owns the framing: samples stream in one at a time, a frame
//! of `size` samples fires every `hop` samples, and reconstructed output
//! streams back out one sample per input sample. Block size is therefore
//! independent of the FFT size. The frequency-domain step is a closure.
//!
//! Specializations:
//! - [`DeNoiser`]: learned-profile spectral subtraction
//! - [`FormantDetector`]: analysis only, peak picking in the formant band

use crate::domain::audio::{AudioBlock, ProcessSpec};
use crate::domain::dsp::{gain_to_db, Processor};
use crate::domain::formant::FormantSet;
use crate::domain::params::{ParamCell, Params, SnapshotCell, SpectrumPoint};
use atomic_float::AtomicF32;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

/// Default analysis frame length
pub const FRAME_SIZE: usize = 2048;

/// Frames overlap by `size - size / OVERLAP`
pub const OVERLAP: usize = 4;

// ============================================================================
// OVERLAP-ADD ENGINE
// ============================================================================

/// Streaming overlap-add STFT framework (Hann analysis and synthesis)
///
/// Input and output are both delayed through fixed FIFOs, so the engine
/// adds exactly [`OverlapAdd::latency`] samples of delay and never
/// allocates after construction.
pub struct OverlapAdd {
    size: usize,
    hop: usize,
    rover: usize,
    window: Vec<f32>,
    input: Vec<f32>,
    output: Vec<f32>,
    accumulator: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    normalization: f32,
}

impl OverlapAdd {
    /// Create an engine with `size` (power of two) and hop `size / 4`
    pub fn new(size: usize) -> Self {
        let size = size.max(OVERLAP).next_power_of_two();
        let hop = size / OVERLAP;

        let mut planner = FftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        // Periodic Hann: squared windows at 4x overlap sum to 3/2
        let window = (0..size)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / size as f32).cos()))
            .collect();

        debug!("Overlap-add engine: size={}, hop={}", size, hop);

        Self {
            size,
            hop,
            rover: size - hop,
            window,
            input: vec![0.0; size],
            output: vec![0.0; hop],
            accumulator: vec![0.0; size],
            spectrum: vec![Complex32::new(0.0, 0.0); size],
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
            forward,
            inverse,
            // Unnormalized inverse FFT (x size) times the 3/2 window gain
            normalization: 2.0 / (3.0 * size as f32),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    /// Number of non-redundant bins handed to transforms (`size / 2 + 1`)
    pub fn bins(&self) -> usize {
        self.size / 2 + 1
    }

    /// Input-to-output delay in samples
    pub fn latency(&self) -> usize {
        self.size
    }

    /// Centre frequency of `bin` at `sample_rate`
    #[inline]
    pub fn bin_frequency(&self, bin: usize, sample_rate: f32) -> f32 {
        bin as f32 * sample_rate / self.size as f32
    }

    /// Push one sample, returning one reconstructed sample
    ///
    /// `transform` runs on bins `0..=size/2` each time a frame fires; the
    /// upper half is rebuilt by conjugate symmetry afterwards.
    #[inline]
    pub fn process_sample<F>(&mut self, input: f32, transform: &mut F) -> f32
    where
        F: FnMut(&mut [Complex32]),
    {
        let fifo_latency = self.size - self.hop;
        self.input[self.rover] = input;
        let output = self.output[self.rover - fifo_latency];
        self.rover += 1;

        if self.rover >= self.size {
            self.rover = fifo_latency;
            self.analyze_frame();
            let half = self.size / 2;
            transform(&mut self.spectrum[..=half]);
            self.synthesize_frame();
            self.advance_input();
        }

        output
    }

    /// Process a buffer in place
    pub fn process<F>(&mut self, samples: &mut [f32], mut transform: F)
    where
        F: FnMut(&mut [Complex32]),
    {
        for sample in samples.iter_mut() {
            *sample = self.process_sample(*sample, &mut transform);
        }
    }

    /// Push one sample without reconstruction (analysis-only use)
    #[inline]
    pub fn analyze_sample<F>(&mut self, input: f32, inspect: &mut F)
    where
        F: FnMut(&[Complex32]),
    {
        self.input[self.rover] = input;
        self.rover += 1;

        if self.rover >= self.size {
            self.rover = self.size - self.hop;
            self.analyze_frame();
            inspect(&self.spectrum[..=self.size / 2]);
            self.advance_input();
        }
    }

    pub fn reset(&mut self) {
        self.rover = self.size - self.hop;
        self.input.fill(0.0);
        self.output.fill(0.0);
        self.accumulator.fill(0.0);
    }

    /// Window the input FIFO and take the forward FFT
    fn analyze_frame(&mut self) {
        for ((bin, &x), &w) in self.spectrum.iter_mut().zip(&self.input).zip(&self.window) {
            *bin = Complex32::new(x * w, 0.0);
        }
        self.forward
            .process_with_scratch(&mut self.spectrum, &mut self.scratch);
    }

    /// Inverse FFT, window, normalize and overlap into the output FIFO
    fn synthesize_frame(&mut self) {
        let half = self.size / 2;
        self.spectrum[0].im = 0.0;
        self.spectrum[half].im = 0.0;
        for k in 1..half {
            self.spectrum[self.size - k] = self.spectrum[k].conj();
        }

        self.inverse
            .process_with_scratch(&mut self.spectrum, &mut self.scratch);

        for ((acc, bin), &w) in self
            .accumulator
            .iter_mut()
            .zip(&self.spectrum)
            .zip(&self.window)
        {
            *acc += bin.re * w * self.normalization;
        }

        self.output.copy_from_slice(&self.accumulator[..self.hop]);
        self.accumulator.copy_within(self.hop.., 0);
        let tail = self.size - self.hop;
        self.accumulator[tail..].fill(0.0);
    }

    fn advance_input(&mut self) {
        self.input.copy_within(self.hop.., 0);
        let tail = self.size - self.hop;
        self.input[tail..].fill(0.0);
    }
}

/// Convert raw FFT magnitude of a Hann-windowed frame to sine amplitude
#[inline]
fn bin_amplitude(magnitude: f32, size: usize) -> f32 {
    magnitude * 4.0 / size as f32
}

// ============================================================================
// SPECTRUM MONITOR
// ============================================================================

/// Read-only display snapshots published by spectral processors
#[derive(Debug)]
pub struct SpectrumMonitor {
    spectrum: SnapshotCell<Vec<f32>>,
    noise_profile: SnapshotCell<Vec<f32>>,
    sample_rate: AtomicF32,
    frame_size: usize,
}

impl SpectrumMonitor {
    fn new(frame_size: usize, sample_rate: f32) -> Self {
        let bins = frame_size / 2 + 1;
        Self {
            spectrum: SnapshotCell::new(vec![0.0; bins]),
            noise_profile: SnapshotCell::new(vec![0.0; bins]),
            sample_rate: AtomicF32::new(sample_rate),
            frame_size,
        }
    }

    /// Most recent input spectrum (first channel), one point per bin
    pub fn spectrum_data(&self) -> Vec<SpectrumPoint> {
        self.points(&self.spectrum.read())
    }

    /// Learned noise profile, one point per bin
    pub fn noise_profile_data(&self) -> Vec<SpectrumPoint> {
        self.points(&self.noise_profile.read())
    }

    fn points(&self, magnitudes: &[f32]) -> Vec<SpectrumPoint> {
        let sample_rate = self.sample_rate.load(Ordering::Relaxed);
        magnitudes
            .iter()
            .enumerate()
            .skip(1)
            .map(|(bin, &magnitude)| SpectrumPoint {
                frequency: bin as f32 * sample_rate / self.frame_size as f32,
                magnitude_db: gain_to_db(bin_amplitude(magnitude, self.frame_size)),
            })
            .collect()
    }
}

// ============================================================================
// DE-NOISER
// ============================================================================

/// De-noiser parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeNoiserParams {
    /// Reduction amount in [0, 1]
    pub amount: f32,
    /// While true, frames feed the noise profile and audio passes through
    #[serde(default)]
    pub learning: bool,
}

impl Default for DeNoiserParams {
    fn default() -> Self {
        Self {
            amount: 0.5,
            learning: false,
        }
    }
}

impl Params for DeNoiserParams {
    fn clamped(self) -> Self {
        Self {
            amount: self.amount.clamp(0.0, 1.0),
            learning: self.learning,
        }
    }
}

/// Spectral-subtraction noise reducer with a learned profile
///
/// Each bin's magnitude is lowered by `2 · amount · profile[bin]`, floored at
/// `(1 - amount) · magnitude`; phase is left untouched.
pub struct DeNoiser {
    params: Arc<ParamCell<DeNoiserParams>>,
    applied: DeNoiserParams,
    engines: Vec<OverlapAdd>,
    profile: Vec<f32>,
    accumulated: Vec<f32>,
    learned_frames: u32,
    display: Vec<f32>,
    profile_pending: bool,
    monitor: Arc<SpectrumMonitor>,
}

impl DeNoiser {
    pub fn new(sample_rate: f32) -> Self {
        Self::with_params(sample_rate, DeNoiserParams::default())
    }

    pub fn with_params(sample_rate: f32, params: DeNoiserParams) -> Self {
        let params = params.clamped();
        let bins = FRAME_SIZE / 2 + 1;
        Self {
            params: ParamCell::shared(params),
            applied: params,
            engines: vec![OverlapAdd::new(FRAME_SIZE)],
            profile: vec![0.0; bins],
            accumulated: vec![0.0; bins],
            learned_frames: 0,
            display: vec![0.0; bins],
            profile_pending: false,
            monitor: Arc::new(SpectrumMonitor::new(FRAME_SIZE, sample_rate)),
        }
    }

    pub fn params_handle(&self) -> Arc<ParamCell<DeNoiserParams>> {
        Arc::clone(&self.params)
    }

    pub fn monitor(&self) -> Arc<SpectrumMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Start accumulating a fresh noise profile
    pub fn start_learning(&mut self) {
        self.params.update(|p| p.learning = true);
        self.sync_params();
    }

    /// Finish learning and install the averaged profile
    pub fn stop_learning(&mut self) {
        self.params.update(|p| p.learning = false);
        self.sync_params();
    }

    pub fn is_learning(&self) -> bool {
        self.applied.learning
    }

    /// Learned per-bin magnitudes (raw FFT scale)
    pub fn profile(&self) -> &[f32] {
        &self.profile
    }

    fn sync_params(&mut self) {
        let params = self.params.load();
        if params == self.applied {
            return;
        }

        match (self.applied.learning, params.learning) {
            (false, true) => {
                self.accumulated.fill(0.0);
                self.learned_frames = 0;
                debug!("Noise profile learning started");
            }
            (true, false) => {
                if self.learned_frames > 0 {
                    let frames = self.learned_frames as f32;
                    for (dst, &sum) in self.profile.iter_mut().zip(&self.accumulated) {
                        *dst = sum / frames;
                    }
                    self.profile_pending = true;
                }
                debug!("Noise profile learned from {} frames", self.learned_frames);
            }
            _ => trace!("De-noiser amount set to {:.2}", params.amount),
        }

        self.applied = params;
    }
}

impl Processor for DeNoiser {
    fn prepare(&mut self, spec: &ProcessSpec) {
        self.engines = (0..spec.channels)
            .map(|_| OverlapAdd::new(FRAME_SIZE))
            .collect();
        self.monitor
            .sample_rate
            .store(spec.sample_rate, Ordering::Relaxed);
    }

    fn process(&mut self, block: &mut AudioBlock) {
        self.sync_params();
        if block.is_empty() {
            return;
        }

        let learning = self.applied.learning;
        let amount = self.applied.amount;
        let Self {
            engines,
            profile,
            accumulated,
            learned_frames,
            display,
            ..
        } = self;

        for (index, (engine, channel)) in engines.iter_mut().zip(block.channels_mut()).enumerate() {
            engine.process(channel, |bins| {
                if index == 0 {
                    for (dst, bin) in display.iter_mut().zip(bins.iter()) {
                        *dst = bin.norm();
                    }
                }

                if learning {
                    for (sum, bin) in accumulated.iter_mut().zip(bins.iter()) {
                        *sum += bin.norm();
                    }
                    *learned_frames += 1;
                    return;
                }

                for (bin, &noise) in bins.iter_mut().zip(profile.iter()) {
                    let magnitude = bin.norm();
                    if magnitude <= f32::EPSILON {
                        continue;
                    }
                    let reduced = (magnitude - noise * 2.0 * amount).max(magnitude * (1.0 - amount));
                    *bin *= reduced / magnitude;
                }
            });
        }

        self.monitor
            .spectrum
            .try_publish(|snapshot| snapshot.copy_from_slice(&self.display));
        if self.profile_pending {
            self.profile_pending = !self
                .monitor
                .noise_profile
                .try_publish(|snapshot| snapshot.copy_from_slice(&self.profile));
        }
    }

    fn reset(&mut self) {
        for engine in &mut self.engines {
            engine.reset();
        }
    }

    fn latency(&self) -> usize {
        self.engines.first().map(OverlapAdd::latency).unwrap_or(0)
    }

    fn name(&self) -> &str {
        "DeNoiser"
    }
}

// ============================================================================
// FORMANT DETECTOR
// ============================================================================

/// Lowest frequency searched for formants
pub const FORMANT_BAND_LOW: f32 = 300.0;
/// Highest frequency searched for formants
pub const FORMANT_BAND_HIGH: f32 = 5000.0;
/// Block RMS below which the formant list is cleared
const SILENCE_RMS: f32 = 1e-3;
/// In-band peak amplitude below which nothing is reported
const MAGNITUDE_FLOOR: f32 = 1e-2;
/// Peaks must exceed this fraction of the in-band maximum
const RELATIVE_PEAK: f32 = 0.3;

/// Formant peak picker (analysis only, audio is never modified)
pub struct FormantDetector {
    engine: OverlapAdd,
    sample_rate: f32,
    magnitudes: Vec<f32>,
    formants: FormantSet,
    published: Arc<SnapshotCell<FormantSet>>,
}

impl FormantDetector {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            engine: OverlapAdd::new(FRAME_SIZE),
            sample_rate,
            magnitudes: vec![0.0; FRAME_SIZE / 2 + 1],
            formants: FormantSet::default(),
            published: Arc::new(SnapshotCell::new(FormantSet::default())),
        }
    }

    pub fn prepare(&mut self, spec: &ProcessSpec) {
        self.sample_rate = spec.sample_rate;
        self.reset();
    }

    /// Latest detection (audio-thread view)
    pub fn formants(&self) -> FormantSet {
        self.formants
    }

    /// Shared snapshot for control-thread readers
    pub fn snapshot(&self) -> Arc<SnapshotCell<FormantSet>> {
        Arc::clone(&self.published)
    }

    /// Feed one block; the formant list updates whenever a frame fires
    pub fn analyze(&mut self, block: &AudioBlock) {
        if block.is_empty() {
            self.formants.clear();
            self.publish();
            return;
        }

        let gated = block.rms() < SILENCE_RMS;
        if gated {
            self.formants.clear();
        }

        let sample_rate = self.sample_rate;
        let size = self.engine.size();
        let Self {
            engine,
            magnitudes,
            formants,
            ..
        } = self;

        let mut inspect = |bins: &[Complex32]| {
            if gated {
                return;
            }
            for (dst, bin) in magnitudes.iter_mut().zip(bins) {
                *dst = bin_amplitude(bin.norm(), size);
            }
            *formants = pick_peaks(magnitudes, sample_rate, size);
        };

        for frame in 0..block.len() {
            engine.analyze_sample(block.mono_sample(frame), &mut inspect);
        }

        self.publish();
    }

    pub fn reset(&mut self) {
        self.engine.reset();
        self.formants.clear();
        self.publish();
    }

    fn publish(&self) {
        let formants = self.formants;
        self.published.try_publish(|snapshot| *snapshot = formants);
    }
}

/// Strongest local maxima in the formant band, strongest first
fn pick_peaks(magnitudes: &[f32], sample_rate: f32, size: usize) -> FormantSet {
    let mut formants = FormantSet::default();
    let per_bin = sample_rate / size as f32;
    let low = ((FORMANT_BAND_LOW / per_bin).ceil() as usize).max(1);
    let high = ((FORMANT_BAND_HIGH / per_bin).floor() as usize).min(magnitudes.len().saturating_sub(2));
    if low >= high {
        return formants;
    }

    let band = &magnitudes[low..=high];
    let band_max = band.iter().copied().fold(0.0_f32, f32::max);
    if band_max < MAGNITUDE_FLOOR {
        return formants;
    }

    // (magnitude, bin), kept sorted descending
    let mut strongest = [(0.0_f32, 0_usize); FormantSet::CAPACITY];
    let mut found = 0;
    for k in low..=high {
        let m = magnitudes[k];
        let is_peak = m > magnitudes[k - 1] && m >= magnitudes[k + 1] && m > RELATIVE_PEAK * band_max;
        if !is_peak {
            continue;
        }

        let mut slot = found.min(FormantSet::CAPACITY);
        while slot > 0 && strongest[slot - 1].0 < m {
            if slot < FormantSet::CAPACITY {
                strongest[slot] = strongest[slot - 1];
            }
            slot -= 1;
        }
        if slot < FormantSet::CAPACITY {
            strongest[slot] = (m, k);
            found = (found + 1).min(FormantSet::CAPACITY);
        }
    }

    for &(_, bin) in &strongest[..found] {
        formants.push(bin as f32 * per_bin);
    }
    formants
}

// ============================================================================
// TESTS
// ============================================================================
