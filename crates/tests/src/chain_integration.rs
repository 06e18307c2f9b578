//! Integration tests for the vocal chain
//!
//! These tests drive complete chains, built from configuration, through the
//! real-time engine and read results back through the control surface.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::f32::consts::PI;
use std::time::Duration;
use vocalist_core::domain::audio::{AudioBlock, ProcessSpec};
use vocalist_core::domain::config::{ChainConfig, EngineConfig, NodeConfig, VocalistConfig};
use vocalist_core::domain::dsp::{db_to_gain, gain_to_db, Processor};
use vocalist_core::domain::dynamics::GainParams;
use vocalist_core::domain::equalizer::EqualizerParams;
use vocalist_core::domain::formant::FormantParams;
use vocalist_core::domain::graph::{ChainMode, EffectType, NodeControls};
use vocalist_core::domain::pitch::{PitchCorrectorParams, PitchDetector, Scale};
use vocalist_core::domain::spectral::DeNoiserParams;
use vocalist_core::domain::stretch::PitchShiftParams;
use vocalist_infra::audio::{EngineController, RealtimeEngine};

const SAMPLE_RATE: u32 = 48000;
const BLOCK: usize = 256;

fn engine_config(channels: usize) -> EngineConfig {
    EngineConfig {
        sample_rate: SAMPLE_RATE,
        max_block_size: BLOCK,
        channels,
    }
}

fn create(nodes: Vec<NodeConfig>, channels: usize) -> (EngineController, RealtimeEngine) {
    let config = VocalistConfig {
        engine: engine_config(channels),
        chain: ChainConfig { nodes },
    };
    EngineController::create(&config).unwrap()
}

fn generate_sine_wave(frequency: f32, amplitude: f32, samples: usize) -> Vec<f32> {
    (0..samples)
        .map(|i| amplitude * (2.0 * PI * frequency * i as f32 / SAMPLE_RATE as f32).sin())
        .collect()
}

/// Harmonic series with a resonance near 1 kHz
fn generate_voice(pitch: f32, samples: usize) -> Vec<f32> {
    (0..samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            (1..=16)
                .map(|h| {
                    let f = pitch * h as f32;
                    let amp = 0.15 * (-((f - 1000.0) / 500.0).powi(2)).exp() + 0.01;
                    amp * (2.0 * PI * f * t).sin()
                })
                .sum()
        })
        .collect()
}

/// Seeded white noise in [-amplitude, amplitude)
fn generate_noise(amplitude: f32, samples: usize) -> Vec<f32> {
    let mut rng = Pcg32::seed_from_u64(7);
    (0..samples).map(|_| rng.gen_range(-amplitude..amplitude)).collect()
}

/// Run a mono signal through a mono engine, returning the output
fn run_mono(engine: &mut RealtimeEngine, signal: &[f32]) -> Vec<f32> {
    let mut output = signal.to_vec();
    engine.process_interleaved(&mut output);
    output
}

fn rms(buffer: &[f32]) -> f32 {
    (buffer.iter().map(|s| s * s).sum::<f32>() / buffer.len() as f32).sqrt()
}

// ============================================================================
// END-TO-END CHAINS
// ============================================================================

#[test]
fn test_voice_chain_reports_pitch_and_formants() {
    let (controller, mut engine) = create(
        vec![
            NodeConfig::new("Gate", EffectType::NoiseGate(Default::default())),
            NodeConfig::new("Formant", EffectType::Formant(FormantParams::default())),
            NodeConfig::new("Tune", EffectType::PitchCorrect(PitchCorrectorParams::default())),
        ],
        1,
    );

    let output = run_mono(&mut engine, &generate_voice(220.0, SAMPLE_RATE as usize));
    let surface = controller.control_surface();

    assert!(output.iter().all(|s| s.is_finite()));
    assert!((surface.current_pitch() - 220.0).abs() < 3.0);
    assert_eq!(surface.current_note(), Some(57));
    assert_eq!(surface.current_note_name().as_deref(), Some("A3"));

    let formants = surface.formant_frequencies();
    assert!(!formants.is_empty() && formants.len() <= 3);
    assert!(formants.iter().all(|&f| (300.0..=5000.0).contains(&f)));
    assert!(controller.output_level_db() > -40.0);
}

#[test]
fn test_gate_silences_low_level_noise() {
    let (controller, mut engine) = create(
        vec![NodeConfig::new("Gate", EffectType::NoiseGate(Default::default()))],
        1,
    );

    // -60 dBFS hiss against the default -40 dB threshold
    let output = run_mono(&mut engine, &generate_noise(0.001, SAMPLE_RATE as usize));
    let tail = &output[output.len() - 4800..];
    assert!(tail.iter().all(|s| s.abs() < 1e-6));
    assert!(controller.control_surface().nodes()[0].gain_reduction_db().unwrap() > 40.0);
}

#[test]
fn test_compressor_from_toml() {
    let text = r#"
        [engine]
        sample_rate = 48000
        max_block_size = 256
        channels = 2

        [[chain.nodes]]
        name = "Comp"
        effect = { type = "Compressor", params = { threshold_db = -18.0, ratio = 4.0, attack_ms = 5.0, release_ms = 100.0 } }
    "#;
    let config = VocalistConfig::from_toml_str(text).unwrap();
    let (controller, mut engine) = EngineController::create(&config).unwrap();

    // Stereo -12 dBFS level: 6 dB over threshold at 4:1 leaves 1.5 dB, so 4.5 dB of reduction
    let level = db_to_gain(-12.0);
    let mut data = vec![level; SAMPLE_RATE as usize];
    engine.process_interleaved(&mut data);

    let out_db = gain_to_db(data[data.len() - 1]);
    assert!((out_db - -16.5).abs() < 0.5, "output {:.2} dB", out_db);
    let reduction = controller.control_surface().node("Comp").unwrap().gain_reduction_db().unwrap();
    assert!((reduction - 4.5).abs() < 0.5);
}

#[test]
fn test_denoiser_learns_through_control_surface() {
    let (controller, mut engine) = create(
        vec![NodeConfig::new(
            "DeNoise",
            EffectType::DeNoiser(DeNoiserParams {
                amount: 1.0,
                learning: true,
            }),
        )],
        1,
    );
    let surface = controller.control_surface().clone();
    let hum = generate_sine_wave(440.0, 0.1, SAMPLE_RATE as usize);

    run_mono(&mut engine, &hum);

    match surface.node("DeNoise").unwrap().controls() {
        NodeControls::DeNoiser { params, .. } => params.update(|p| p.learning = false),
        _ => panic!("expected de-noiser controls"),
    }

    let output = run_mono(&mut engine, &hum);
    let tail = &output[output.len() / 2..];
    assert!(rms(tail) < 1e-3, "residual rms {}", rms(tail));

    let profile = surface.noise_profile_data();
    assert_eq!(profile.len(), 1024);
    let peak = profile
        .iter()
        .max_by(|a, b| a.magnitude_db.total_cmp(&b.magnitude_db))
        .unwrap();
    assert!((peak.frequency - 440.0).abs() < 30.0);
    assert!(!surface.spectrum_data().is_empty());
}

#[test]
fn test_pitch_correction_pulls_to_note() {
    let (controller, mut engine) = create(
        vec![NodeConfig::new(
            "Tune",
            EffectType::PitchCorrect(PitchCorrectorParams {
                scale: Scale::Chromatic,
                smoothing: 0.5,
                ..Default::default()
            }),
        )],
        1,
    );

    let output = run_mono(&mut engine, &generate_sine_wave(450.0, 0.5, 2 * SAMPLE_RATE as usize));
    let surface = controller.control_surface();
    assert_eq!(surface.current_note_name().as_deref(), Some("A4"));

    let mut detector = PitchDetector::new(SAMPLE_RATE as f32);
    let corrected = detector.push_samples(&output[output.len() - 4096..]);
    assert!((corrected - 440.0).abs() < 8.0, "corrected to {}", corrected);
}

#[test]
fn test_flat_equalizer_is_transparent_in_stereo() {
    let (_controller, mut engine) = create(
        vec![NodeConfig::new("EQ", EffectType::Equalizer(EqualizerParams::default()))],
        2,
    );
    let mut data = generate_noise(0.5, 4000);
    let expected = data.clone();
    engine.process_interleaved(&mut data);
    assert_eq!(data, expected);
}

// ============================================================================
// ROUTING
// ============================================================================

#[test]
fn test_harmony_split_and_unite() {
    let mut split = NodeConfig::new("Split", EffectType::Gain(GainParams::default()));
    split.mode = ChainMode::Split;
    split.successors = Some(vec![1, 2]);
    let mut dry = NodeConfig::new("Dry", EffectType::Gain(GainParams::default()));
    dry.successors = Some(vec![3]);
    let mut shifted = NodeConfig::new("Up", EffectType::PitchShift(PitchShiftParams { semitones: 12.0 }));
    shifted.successors = Some(vec![3]);
    let mut bus = NodeConfig::new("Bus", EffectType::Gain(GainParams::default()));
    bus.mode = ChainMode::Unite;

    let chain = ChainConfig {
        nodes: vec![split, dry, shifted, bus],
    };
    let mut graph = chain.build(ProcessSpec::new(SAMPLE_RATE as f32, BLOCK, 1)).unwrap();
    assert_eq!(graph.order(), &[0, 1, 2, 3]);
    assert!(graph.latency() > 0);

    let tone = generate_sine_wave(300.0, 0.25, 4 * 4096);
    let mut tail = Vec::new();
    for chunk in tone.chunks(BLOCK) {
        let mut block = AudioBlock::from_mono(chunk);
        graph.process(&mut block);
        assert_eq!(
            graph.node_output(1).unwrap().len(),
            graph.node_output(2).unwrap().len()
        );
        tail.extend_from_slice(block.channel(0));
    }

    // Both the dry 300 Hz and the octave at 600 Hz survive the merge
    let tail = &tail[tail.len() - 4096..];
    let energy_at = |frequency: f32| {
        let (re, im) = tail.iter().enumerate().fold((0.0, 0.0), |(re, im), (i, &s)| {
            let phase = 2.0 * PI * frequency * i as f32 / SAMPLE_RATE as f32;
            (re + s * phase.cos(), im + s * phase.sin())
        });
        (re * re + im * im).sqrt() / tail.len() as f32
    };
    assert!(energy_at(300.0) > 0.04);
    assert!(energy_at(600.0) > 0.04);
    assert!(energy_at(450.0) < 0.02);
}

#[test]
fn test_bypass_from_control_thread() {
    let (controller, mut engine) = create(
        vec![NodeConfig::new("Quiet", EffectType::Gain(GainParams { gain_db: -20.0 }))],
        1,
    );
    let handle = controller.control_surface().node("Quiet").unwrap().clone();

    let signal = generate_sine_wave(440.0, 0.5, BLOCK);
    handle.set_bypass(true);
    assert_eq!(run_mono(&mut engine, &signal), signal);

    handle.set_bypass(false);
    let output = run_mono(&mut engine, &signal);
    assert!(rms(&output) < rms(&signal) * 0.2);
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[test]
fn test_hot_swap_while_audio_runs() {
    let (mut controller, mut engine) = create(Vec::new(), 2);

    let audio = std::thread::spawn(move || {
        let mut buffer = vec![0.1; BLOCK * 2];
        for _ in 0..2000 {
            engine.process_interleaved(&mut buffer);
            buffer.fill(0.1);
        }
        engine
    });

    let mut last_db = 0.0;
    for step in 0..20 {
        let db = -(step as f32);
        let chain = ChainConfig {
            nodes: vec![NodeConfig::new("Gain", EffectType::Gain(GainParams { gain_db: db }))],
        };
        if controller.publish(&chain).is_ok() {
            last_db = db;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    let mut engine = audio.join().unwrap();
    controller.collect_retired();

    let mut buffer = vec![1.0; BLOCK * 2];
    engine.process_interleaved(&mut buffer);
    assert!((buffer[0] - db_to_gain(last_db)).abs() < 1e-4);
    assert_eq!(controller.control_surface().nodes()[0].name(), "Gain");
}
