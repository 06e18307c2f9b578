//! Envelope-driven gain processors
//!
//! This module provides:
//! - Static gain stage
//! - Noise gate (binary open/closed target, optional hold)
//! - Compressor (limiter = compressor with extreme settings)
//! - De-esser (compressor law driven by a band-passed sidechain)
//!
//! Gate, compressor and de-esser share [`EnvelopeFollower`]; they differ
//! only in the target signal the follower tracks.

use crate::domain::audio::{AudioBlock, ProcessSpec};
use crate::domain::dsp::{params, db_to_gain, gain_to_db, BiquadCoeffs, BiquadFilter, EnvelopeFollower, Processor};
use crate::domain::params::{log_frequencies, ParamCell, Params, SpectrumPoint};
use atomic_float::AtomicF32;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::trace;

/// Gain reduction in dB for the shared compressor law
///
/// `envelope_db` must already be floored (see [`gain_to_db`]).
#[inline]
pub fn reduction_db(envelope_db: f32, threshold_db: f32, ratio: f32) -> f32 {
    ((envelope_db - threshold_db) * (1.0 - 1.0 / ratio)).max(0.0)
}

/// Gain reduction published for metering
#[derive(Debug, Default)]
pub struct DynamicsMeter {
    gain_reduction_db: AtomicF32,
}

impl DynamicsMeter {
    pub fn gain_reduction_db(&self) -> f32 {
        self.gain_reduction_db.load(Ordering::Relaxed)
    }

    fn publish(&self, db: f32) {
        self.gain_reduction_db.store(db, Ordering::Relaxed);
    }
}

// ============================================================================
// GAIN STAGE
// ============================================================================

/// Static gain parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainParams {
    pub gain_db: f32,
}

impl Default for GainParams {
    fn default() -> Self {
        Self { gain_db: 0.0 }
    }
}

impl Params for GainParams {
    fn clamped(self) -> Self {
        Self {
            gain_db: self.gain_db.clamp(params::GAIN_MIN, params::GAIN_MAX),
        }
    }
}

/// Static gain in dB, with an output peak meter
pub struct GainStage {
    params: Arc<ParamCell<GainParams>>,
    applied: GainParams,
    gain: f32,
    output_peak_db: Arc<AtomicF32>,
}

impl GainStage {
    pub fn new(params: GainParams) -> Self {
        let params = params.clamped();
        Self {
            params: ParamCell::shared(params),
            applied: params,
            gain: db_to_gain(params.gain_db),
            output_peak_db: Arc::new(AtomicF32::new(params::DB_FLOOR)),
        }
    }

    pub fn params_handle(&self) -> Arc<ParamCell<GainParams>> {
        Arc::clone(&self.params)
    }

    /// Peak of the last processed block, in dBFS
    pub fn output_meter(&self) -> Arc<AtomicF32> {
        Arc::clone(&self.output_peak_db)
    }

    fn sync_params(&mut self) {
        let params = self.params.load();
        if params != self.applied {
            self.applied = params;
            self.gain = db_to_gain(params.gain_db);
        }
    }
}

impl Processor for GainStage {
    fn prepare(&mut self, _spec: &ProcessSpec) {}

    fn process(&mut self, block: &mut AudioBlock) {
        self.sync_params();
        block.scale(self.gain);
        self.output_peak_db
            .store(gain_to_db(block.peak()), Ordering::Relaxed);
    }

    fn reset(&mut self) {}

    fn name(&self) -> &str {
        "Gain"
    }
}

// ============================================================================
// NOISE GATE
// ============================================================================

/// Noise gate parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseGateParams {
    pub threshold_db: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    #[serde(default)]
    pub hold_ms: f32,
}

impl Default for NoiseGateParams {
    fn default() -> Self {
        Self {
            threshold_db: -40.0,
            attack_ms: 1.0,
            release_ms: 50.0,
            hold_ms: 0.0,
        }
    }
}

impl Params for NoiseGateParams {
    fn clamped(self) -> Self {
        Self {
            threshold_db: self.threshold_db.clamp(params::THRESHOLD_MIN, params::THRESHOLD_MAX),
            attack_ms: self.attack_ms.clamp(params::ATTACK_MIN_MS, params::ATTACK_MAX_MS),
            release_ms: self.release_ms.clamp(params::RELEASE_MIN_MS, params::RELEASE_MAX_MS),
            hold_ms: self.hold_ms.clamp(params::HOLD_MIN_MS, params::HOLD_MAX_MS),
        }
    }
}

/// Noise gate
///
/// Silences audio whose peak (across channels) stays below a threshold.
/// The follower chases a binary target: 1 while open, 0 while closed.
pub struct NoiseGate {
    params: Arc<ParamCell<NoiseGateParams>>,
    applied: NoiseGateParams,
    sample_rate: f32,
    // Threshold stored linear so the per-sample test is a plain compare
    threshold: f32,
    hold_samples: u32,
    hold_counter: u32,
    envelope: EnvelopeFollower,
    meter: Arc<DynamicsMeter>,
}

impl NoiseGate {
    /// Create a new noise gate with default parameters
    pub fn new(sample_rate: f32) -> Self {
        Self::with_params(sample_rate, NoiseGateParams::default())
    }

    pub fn with_params(sample_rate: f32, params: NoiseGateParams) -> Self {
        let params = params.clamped();
        let mut gate = Self {
            params: ParamCell::shared(params),
            applied: params,
            sample_rate,
            threshold: 0.0,
            hold_samples: 0,
            hold_counter: 0,
            envelope: EnvelopeFollower::default(),
            meter: Arc::new(DynamicsMeter::default()),
        };
        gate.apply(params);
        gate
    }

    /// Set all parameters at once
    pub fn set_params(&mut self, params: NoiseGateParams) {
        self.params.store(params);
        self.apply(self.params.load());
    }

    /// Set the gate threshold in dB
    pub fn set_threshold(&mut self, threshold_db: f32) {
        self.set_params(NoiseGateParams {
            threshold_db,
            ..self.applied
        });
    }

    pub fn params(&self) -> NoiseGateParams {
        self.applied
    }

    pub fn params_handle(&self) -> Arc<ParamCell<NoiseGateParams>> {
        Arc::clone(&self.params)
    }

    pub fn meter(&self) -> Arc<DynamicsMeter> {
        Arc::clone(&self.meter)
    }

    /// Current gate gain (0 = closed, 1 = open)
    pub fn gain(&self) -> f32 {
        self.envelope.level()
    }

    fn apply(&mut self, params: NoiseGateParams) {
        self.applied = params;
        self.threshold = db_to_gain(params.threshold_db);
        self.hold_samples = (params.hold_ms * self.sample_rate / 1000.0) as u32;
        self.envelope
            .configure(self.sample_rate, params.attack_ms, params.release_ms);
        trace!(
            "Gate updated: threshold={:.1}dB, hold={} samples",
            params.threshold_db,
            self.hold_samples
        );
    }

    fn sync_params(&mut self) {
        let params = self.params.load();
        if params != self.applied {
            self.apply(params);
        }
    }
}

impl Processor for NoiseGate {
    fn prepare(&mut self, spec: &ProcessSpec) {
        self.sample_rate = spec.sample_rate;
        self.apply(self.params.load());
        self.reset();
    }

    fn process(&mut self, block: &mut AudioBlock) {
        self.sync_params();
        if block.is_empty() {
            return;
        }

        for frame in 0..block.len() {
            let target = if block.frame_peak(frame) > self.threshold {
                self.hold_counter = self.hold_samples;
                1.0
            } else if self.hold_counter > 0 {
                self.hold_counter -= 1;
                1.0
            } else {
                0.0
            };

            let gain = self.envelope.update(target);
            block.scale_frame(frame, gain);
        }

        self.meter.publish(-gain_to_db(self.envelope.level()));
    }

    fn reset(&mut self) {
        self.envelope.reset();
        self.hold_counter = 0;
    }

    fn name(&self) -> &str {
        "NoiseGate"
    }
}

// ============================================================================
// DYNAMIC RANGE COMPRESSOR
// ============================================================================

/// Compressor parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressorParams {
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    #[serde(default)]
    pub makeup_gain_db: f32,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            threshold_db: -18.0,
            ratio: 4.0,
            attack_ms: 5.0,
            release_ms: 100.0,
            makeup_gain_db: 0.0,
        }
    }
}

impl CompressorParams {
    /// Brick-wall limiting expressed as compressor settings
    pub fn limiter(threshold_db: f32) -> Self {
        Self {
            threshold_db,
            ratio: params::RATIO_MAX,
            attack_ms: 0.01,
            release_ms: 50.0,
            makeup_gain_db: 0.0,
        }
    }
}

impl Params for CompressorParams {
    fn clamped(self) -> Self {
        Self {
            threshold_db: self.threshold_db.clamp(params::THRESHOLD_MIN, params::THRESHOLD_MAX),
            ratio: self.ratio.clamp(params::RATIO_MIN, params::RATIO_MAX),
            attack_ms: self.attack_ms.clamp(params::ATTACK_MIN_MS, params::ATTACK_MAX_MS),
            release_ms: self.release_ms.clamp(params::RELEASE_MIN_MS, params::RELEASE_MAX_MS),
            makeup_gain_db: self.makeup_gain_db.clamp(0.0, params::GAIN_MAX),
        }
    }
}

/// Dynamic range compressor
///
/// The follower tracks the frame peak directly; gain reduction is applied
/// identically to every channel.
pub struct Compressor {
    params: Arc<ParamCell<CompressorParams>>,
    applied: CompressorParams,
    sample_rate: f32,
    makeup_gain: f32,
    envelope: EnvelopeFollower,
    meter: Arc<DynamicsMeter>,
}

impl Compressor {
    /// Create a new compressor with default parameters
    pub fn new(sample_rate: f32) -> Self {
        Self::with_params(sample_rate, CompressorParams::default())
    }

    pub fn with_params(sample_rate: f32, params: CompressorParams) -> Self {
        let params = params.clamped();
        let mut comp = Self {
            params: ParamCell::shared(params),
            applied: params,
            sample_rate,
            makeup_gain: 1.0,
            envelope: EnvelopeFollower::default(),
            meter: Arc::new(DynamicsMeter::default()),
        };
        comp.apply(params);
        comp
    }

    /// Set all parameters at once
    pub fn set_params(&mut self, params: CompressorParams) {
        self.params.store(params);
        self.apply(self.params.load());
    }

    /// Set the compression ratio (1:1 = no compression)
    pub fn set_ratio(&mut self, ratio: f32) {
        self.set_params(CompressorParams {
            ratio,
            ..self.applied
        });
    }

    pub fn params(&self) -> CompressorParams {
        self.applied
    }

    pub fn params_handle(&self) -> Arc<ParamCell<CompressorParams>> {
        Arc::clone(&self.params)
    }

    pub fn meter(&self) -> Arc<DynamicsMeter> {
        Arc::clone(&self.meter)
    }

    fn apply(&mut self, params: CompressorParams) {
        self.applied = params;
        self.makeup_gain = db_to_gain(params.makeup_gain_db);
        self.envelope
            .configure(self.sample_rate, params.attack_ms, params.release_ms);
        trace!(
            "Compressor updated: threshold={:.1}dB, ratio={:.1}:1",
            params.threshold_db,
            params.ratio
        );
    }

    fn sync_params(&mut self) {
        let params = self.params.load();
        if params != self.applied {
            self.apply(params);
        }
    }
}

impl Processor for Compressor {
    fn prepare(&mut self, spec: &ProcessSpec) {
        self.sample_rate = spec.sample_rate;
        self.apply(self.params.load());
        self.reset();
    }

    fn process(&mut self, block: &mut AudioBlock) {
        self.sync_params();
        if block.is_empty() {
            return;
        }

        let mut reduction = 0.0;
        for frame in 0..block.len() {
            let envelope = self.envelope.update(block.frame_peak(frame));
            reduction = reduction_db(gain_to_db(envelope), self.applied.threshold_db, self.applied.ratio);
            block.scale_frame(frame, db_to_gain(-reduction) * self.makeup_gain);
        }

        self.meter.publish(reduction);
    }

    fn reset(&mut self) {
        self.envelope.reset();
    }

    fn name(&self) -> &str {
        "Compressor"
    }
}

// ============================================================================
// DE-ESSER
// ============================================================================

/// Sidechain band-pass Q (fixed)
pub const DEESSER_Q: f32 = 2.0;

/// De-esser parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeEsserParams {
    pub threshold_db: f32,
    pub ratio: f32,
    pub frequency: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
}

impl Default for DeEsserParams {
    fn default() -> Self {
        Self {
            threshold_db: -30.0,
            ratio: 4.0,
            frequency: 6500.0,
            attack_ms: 0.5,
            release_ms: 50.0,
        }
    }
}

impl Params for DeEsserParams {
    fn clamped(self) -> Self {
        Self {
            threshold_db: self.threshold_db.clamp(params::THRESHOLD_MIN, params::THRESHOLD_MAX),
            ratio: self.ratio.clamp(params::RATIO_MIN, params::RATIO_MAX),
            frequency: self.frequency.clamp(2000.0, 16000.0),
            attack_ms: self.attack_ms.clamp(params::ATTACK_MIN_MS, params::ATTACK_MAX_MS),
            release_ms: self.release_ms.clamp(params::RELEASE_MIN_MS, params::RELEASE_MAX_MS),
        }
    }
}

impl DeEsserParams {
    /// Sidechain filter magnitude for display
    pub fn response_curve(&self, sample_rate: f32, points: usize) -> Vec<SpectrumPoint> {
        let coeffs = BiquadCoeffs::band_pass(sample_rate, self.frequency, DEESSER_Q);
        log_frequencies(20.0, sample_rate * 0.5, points)
            .map(|frequency| SpectrumPoint {
                frequency,
                magnitude_db: gain_to_db(coeffs.response(sample_rate, frequency).norm()),
            })
            .collect()
    }
}

/// Sibilance reducer
///
/// Same gain law as [`Compressor`], but the follower tracks the peak of a
/// band-passed copy of the input so only energy near `frequency` triggers
/// reduction. The filtered copy is never emitted.
pub struct DeEsser {
    params: Arc<ParamCell<DeEsserParams>>,
    applied: DeEsserParams,
    sample_rate: f32,
    sidechain: Vec<BiquadFilter>,
    envelope: EnvelopeFollower,
    meter: Arc<DynamicsMeter>,
}

impl DeEsser {
    pub fn new(sample_rate: f32) -> Self {
        Self::with_params(sample_rate, DeEsserParams::default())
    }

    pub fn with_params(sample_rate: f32, params: DeEsserParams) -> Self {
        let params = params.clamped();
        let mut de_esser = Self {
            params: ParamCell::shared(params),
            applied: params,
            sample_rate,
            sidechain: vec![BiquadFilter::bypass(); 2],
            envelope: EnvelopeFollower::default(),
            meter: Arc::new(DynamicsMeter::default()),
        };
        de_esser.apply(params, true);
        de_esser
    }

    pub fn set_params(&mut self, params: DeEsserParams) {
        self.params.store(params);
        self.apply(self.params.load(), false);
    }

    pub fn params(&self) -> DeEsserParams {
        self.applied
    }

    pub fn params_handle(&self) -> Arc<ParamCell<DeEsserParams>> {
        Arc::clone(&self.params)
    }

    pub fn meter(&self) -> Arc<DynamicsMeter> {
        Arc::clone(&self.meter)
    }

    fn apply(&mut self, params: DeEsserParams, force_filters: bool) {
        let retune = force_filters || params.frequency != self.applied.frequency;
        self.applied = params;
        self.envelope
            .configure(self.sample_rate, params.attack_ms, params.release_ms);

        if retune {
            let coeffs = BiquadCoeffs::band_pass(self.sample_rate, params.frequency, DEESSER_Q);
            for filter in &mut self.sidechain {
                filter.set_coeffs(coeffs);
            }
            trace!("De-esser sidechain tuned to {:.0}Hz", params.frequency);
        }
    }

    fn sync_params(&mut self) {
        let params = self.params.load();
        if params != self.applied {
            self.apply(params, false);
        }
    }
}

impl Processor for DeEsser {
    fn prepare(&mut self, spec: &ProcessSpec) {
        self.sample_rate = spec.sample_rate;
        self.sidechain = vec![BiquadFilter::bypass(); spec.channels];
        self.apply(self.params.load(), true);
        self.reset();
    }

    fn process(&mut self, block: &mut AudioBlock) {
        self.sync_params();
        if block.is_empty() {
            return;
        }

        let channels = block.num_channels().min(self.sidechain.len());
        let mut reduction = 0.0;
        for frame in 0..block.len() {
            let mut sidechain_peak = 0.0_f32;
            for (index, filter) in self.sidechain.iter_mut().take(channels).enumerate() {
                let filtered = filter.process_sample(block.channel(index)[frame]);
                sidechain_peak = sidechain_peak.max(filtered.abs());
            }

            let envelope = self.envelope.update(sidechain_peak);
            reduction = reduction_db(gain_to_db(envelope), self.applied.threshold_db, self.applied.ratio);
            block.scale_frame(frame, db_to_gain(-reduction));
        }

        self.meter.publish(reduction);
    }

    fn reset(&mut self) {
        self.envelope.reset();
        for filter in &mut self.sidechain {
            filter.reset();
        }
    }

    fn name(&self) -> &str {
        "DeEsser"
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::f32::consts::PI;

    const SAMPLE_RATE: f32 = 48000.0;

    fn spec() -> ProcessSpec {
        ProcessSpec::new(SAMPLE_RATE, 512, 1)
    }

    fn generate_test_signal(samples: usize, frequency: f32, amplitude: f32) -> Vec<f32> {
        (0..samples)
            .map(|i| amplitude * (2.0 * PI * frequency * i as f32 / SAMPLE_RATE).sin())
            .collect()
    }

    /// Run a mono signal through a processor in host-sized blocks
    fn run<P: Processor>(processor: &mut P, signal: &[f32]) -> Vec<f32> {
        let mut output = Vec::with_capacity(signal.len());
        for chunk in signal.chunks(512) {
            let mut block = AudioBlock::from_mono(chunk);
            processor.process(&mut block);
            output.extend_from_slice(block.channel(0));
        }
        output
    }

    fn peak_db(buffer: &[f32]) -> f32 {
        gain_to_db(buffer.iter().map(|s| s.abs()).fold(0.0_f32, f32::max))
    }

    // -------------------------------------------------------------------------
    // Gain Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_gain_stage_applies_db() {
        let mut gain = GainStage::new(GainParams { gain_db: -6.0 });
        let output = run(&mut gain, &[1.0; 16]);
        assert!((output[15] - 0.501).abs() < 0.01);
        assert!((gain.output_meter().load(Ordering::Relaxed) - (-6.0)).abs() < 0.01);

        gain.params_handle().store(GainParams { gain_db: 100.0 });
        let output = run(&mut gain, &[0.1; 4]);
        assert!((output[0] - 0.1 * db_to_gain(params::GAIN_MAX)).abs() < 1e-3);
    }

    // -------------------------------------------------------------------------
    // Noise Gate Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_noise_gate_creation() {
        let gate = NoiseGate::new(SAMPLE_RATE);
        assert_eq!(gate.name(), "NoiseGate");
        assert_eq!(gate.params().threshold_db, -40.0);
    }

    #[test]
    fn test_noise_gate_closes_below_threshold() {
        let mut gate = NoiseGate::with_params(
            SAMPLE_RATE,
            NoiseGateParams {
                threshold_db: -30.0,
                ..Default::default()
            },
        );
        gate.prepare(&spec());

        // -40 dBFS steady input
        let output = run(&mut gate, &vec![0.01; 24000]);
        assert!(gate.gain() < 1e-3);
        assert!(output[23999].abs() < 1e-5);
    }

    #[test]
    fn test_noise_gate_opens_above_threshold() {
        let mut gate = NoiseGate::with_params(
            SAMPLE_RATE,
            NoiseGateParams {
                threshold_db: -30.0,
                ..Default::default()
            },
        );
        gate.prepare(&spec());

        // -20 dBFS steady input
        let output = run(&mut gate, &vec![0.1; 24000]);
        assert!(gate.gain() > 0.999);
        assert!((output[23999] - 0.1).abs() < 1e-3);
    }

    #[test]
    fn test_noise_gate_hold() {
        let mut gate = NoiseGate::with_params(
            SAMPLE_RATE,
            NoiseGateParams {
                threshold_db: -20.0,
                attack_ms: 1.0,
                release_ms: 1.0,
                hold_ms: 50.0,
            },
        );
        gate.prepare(&spec());

        run(&mut gate, &vec![0.5; 4800]);

        // 20 ms of silence is still inside the hold window
        run(&mut gate, &vec![0.0; 960]);
        assert!(gate.gain() > 0.99);

        // 100 ms more and the gate has released
        run(&mut gate, &vec![0.0; 4800]);
        assert!(gate.gain() < 0.01);
    }

    #[test]
    fn test_noise_gate_uses_loudest_channel() {
        let mut gate = NoiseGate::with_params(
            SAMPLE_RATE,
            NoiseGateParams {
                threshold_db: -30.0,
                ..Default::default()
            },
        );
        gate.prepare(&ProcessSpec::new(SAMPLE_RATE, 4800, 2));

        let mut block = AudioBlock::from_channels(vec![vec![0.001; 4800], vec![0.5; 4800]]);
        gate.process(&mut block);
        // Quiet left channel passes because the right channel opened the gate
        assert!((block.channel(0)[4799] - 0.001).abs() < 1e-5);
    }

    // -------------------------------------------------------------------------
    // Compressor Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_compressor_creation() {
        let comp = Compressor::new(SAMPLE_RATE);
        assert_eq!(comp.name(), "Compressor");
        assert_eq!(comp.params().threshold_db, -18.0);
        assert_eq!(comp.params().ratio, 4.0);
    }

    #[test]
    fn test_compressor_steady_state() {
        let mut comp = Compressor::with_params(
            SAMPLE_RATE,
            CompressorParams {
                threshold_db: -20.0,
                ratio: 4.0,
                ..Default::default()
            },
        );
        comp.prepare(&spec());

        // -12 dBFS in, -20 + (-12 - -20) / 4 = -18 dBFS out
        let output = run(&mut comp, &vec![db_to_gain(-12.0); 48000]);
        assert!((peak_db(&output[40000..]) - (-18.0)).abs() < 0.1);
        assert!((comp.meter().gain_reduction_db() - 6.0).abs() < 0.1);
    }

    #[test]
    fn test_compressor_below_threshold_is_transparent() {
        let mut comp = Compressor::new(SAMPLE_RATE);
        comp.prepare(&spec());
        let output = run(&mut comp, &vec![db_to_gain(-30.0); 4800]);
        assert!((peak_db(&output[4000..]) - (-30.0)).abs() < 0.01);
    }

    #[test]
    fn test_compressor_makeup_gain() {
        let mut comp = Compressor::with_params(
            SAMPLE_RATE,
            CompressorParams {
                threshold_db: -20.0,
                makeup_gain_db: 6.0,
                ..Default::default()
            },
        );
        comp.prepare(&spec());
        let output = run(&mut comp, &vec![0.01; 1024]);
        assert!(output[1023] > 0.019);
    }

    #[test]
    fn test_limiter_holds_ceiling() {
        let mut limiter = Compressor::with_params(SAMPLE_RATE, CompressorParams::limiter(-6.0));
        limiter.prepare(&spec());
        let output = run(&mut limiter, &vec![db_to_gain(0.0); 4800]);
        assert!(peak_db(&output[480..]) < -5.9);
    }

    #[test]
    fn test_compressor_ratio_clamped() {
        let mut comp = Compressor::new(SAMPLE_RATE);
        comp.set_ratio(0.25);
        assert_eq!(comp.params().ratio, params::RATIO_MIN);
    }

    #[test]
    fn test_compressor_picks_up_new_snapshot() {
        let mut comp = Compressor::new(SAMPLE_RATE);
        comp.prepare(&spec());
        comp.params_handle().update(|p| p.threshold_db = -6.0);
        run(&mut comp, &[0.0; 8]);
        assert_eq!(comp.params().threshold_db, -6.0);
    }

    // -------------------------------------------------------------------------
    // De-Esser Tests
    // -------------------------------------------------------------------------

    fn test_de_esser() -> DeEsser {
        let mut de_esser = DeEsser::with_params(
            SAMPLE_RATE,
            DeEsserParams {
                threshold_db: -20.0,
                ratio: 4.0,
                frequency: 6000.0,
                attack_ms: 0.1,
                release_ms: 100.0,
            },
        );
        de_esser.prepare(&spec());
        de_esser
    }

    #[test]
    fn test_de_esser_reduces_sibilant_band() {
        let mut de_esser = test_de_esser();
        let signal = generate_test_signal(48000, 6000.0, db_to_gain(-12.0));
        let output = run(&mut de_esser, &signal);
        assert!((peak_db(&output[36000..]) - (-18.0)).abs() < 1.0);
    }

    #[test]
    fn test_de_esser_ignores_low_band() {
        let mut de_esser = test_de_esser();
        let signal = generate_test_signal(48000, 500.0, db_to_gain(-12.0));
        let output = run(&mut de_esser, &signal);
        assert!((peak_db(&output[36000..]) - peak_db(&signal[36000..])).abs() < 0.1);
        assert!(de_esser.meter().gain_reduction_db() < 0.01);
    }

    #[test]
    fn test_de_esser_response_curve_peaks_at_centre() {
        let params = DeEsserParams {
            frequency: 6000.0,
            ..Default::default()
        };
        let curve = params.response_curve(SAMPLE_RATE, 128);
        assert_eq!(curve.len(), 128);
        let loudest = curve
            .iter()
            .max_by(|a, b| a.magnitude_db.total_cmp(&b.magnitude_db))
            .unwrap();
        assert!((loudest.frequency - 6000.0).abs() < 600.0);
        assert!(loudest.magnitude_db.abs() < 0.5);
    }

    #[test]
    fn test_empty_block_is_noop() {
        let mut comp = Compressor::new(SAMPLE_RATE);
        let mut block = AudioBlock::new(0, 0);
        comp.process(&mut block);
        assert!(block.is_empty());
    }

    proptest! {
        #[test]
        fn prop_reduction_never_negative(
            envelope_db in -100.0_f32..24.0,
            threshold_db in -100.0_f32..0.0,
            ratio in 1.0_f32..1000.0,
        ) {
            let reduction = reduction_db(envelope_db, threshold_db, ratio);
            prop_assert!(reduction >= 0.0);
            prop_assert!(reduction <= (envelope_db - threshold_db).max(0.0) + 1e-4);
        }

        #[test]
        fn prop_gate_params_clamped(
            threshold_db in -1000.0_f32..1000.0,
            attack_ms in -10.0_f32..10000.0,
            hold_ms in -10.0_f32..10000.0,
        ) {
            let params = NoiseGateParams { threshold_db, attack_ms, release_ms: 10.0, hold_ms }.clamped();
            prop_assert!((params::THRESHOLD_MIN..=params::THRESHOLD_MAX).contains(&params.threshold_db));
            prop_assert!((params::ATTACK_MIN_MS..=params::ATTACK_MAX_MS).contains(&params.attack_ms));
            prop_assert!((params::HOLD_MIN_MS..=params::HOLD_MAX_MS).contains(&params.hold_ms));
        }
    }
}
