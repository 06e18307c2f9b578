//! Criterion benchmarks for individual vocal processors
//!
//! Measures:
//! - Dynamics throughput (gate, compressor, de-esser)
//! - Equalizer throughput and buffer size sensitivity
//! - Spectral processors (de-noiser, formant shift)
//! - Pitch detection, shifting and correction

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use vocalist_benchmarks::{generate_voice, generate_white_noise};
use vocalist_core::domain::audio::{AudioBlock, ProcessSpec};
use vocalist_core::domain::dsp::Processor;
use vocalist_core::domain::dynamics::{Compressor, DeEsser, NoiseGate};
use vocalist_core::domain::equalizer::{Equalizer, EqualizerParams};
use vocalist_core::domain::formant::{FormantEngine, FormantParams};
use vocalist_core::domain::pitch::{PitchCorrector, PitchDetector};
use vocalist_core::domain::spectral::DeNoiser;
use vocalist_core::domain::stretch::{PitchShiftParams, Transposer};

const SAMPLE_RATE: u32 = 48000;
const BLOCK_SIZES: [usize; 4] = [64, 256, 512, 1024];

fn prepared<P: Processor>(mut processor: P, block: usize) -> P {
    processor.prepare(&ProcessSpec::new(SAMPLE_RATE as f32, block, 1));
    processor
}

fn voice_block(block: usize) -> AudioBlock {
    AudioBlock::from_mono(&generate_voice(220.0, SAMPLE_RATE, block))
}

/// Run `processor` on a fresh copy of `input` each iteration
fn bench_processor<P: Processor>(c: &mut Criterion, group_name: &str, make: impl Fn() -> P) {
    let mut group = c.benchmark_group(group_name);

    for &size in BLOCK_SIZES.iter() {
        let mut processor = prepared(make(), size);
        let input = voice_block(size);
        let mut block = input.clone();

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                block.copy_from(&input);
                processor.process(black_box(&mut block));
                black_box(&mut block);
            })
        });
    }

    group.finish();
}

fn bench_dynamics(c: &mut Criterion) {
    let sr = SAMPLE_RATE as f32;
    bench_processor(c, "noise_gate", || NoiseGate::new(sr));
    bench_processor(c, "compressor", || Compressor::new(sr));
    bench_processor(c, "deesser", || DeEsser::new(sr));
}

fn bench_equalizer(c: &mut Criterion) {
    let sr = SAMPLE_RATE as f32;
    bench_processor(c, "equalizer", || {
        Equalizer::with_params(
            sr,
            EqualizerParams {
                low_gain_db: 3.0,
                mid_gain_db: -4.0,
                high_gain_db: 6.0,
                ..Default::default()
            },
        )
    });
}

fn bench_spectral(c: &mut Criterion) {
    let sr = SAMPLE_RATE as f32;
    bench_processor(c, "denoiser", || DeNoiser::new(sr));
    bench_processor(c, "formant_shift", || {
        FormantEngine::with_params(sr, FormantParams { amount: 15.0, mix: 1.0 })
    });
}

fn bench_pitch(c: &mut Criterion) {
    let sr = SAMPLE_RATE as f32;
    bench_processor(c, "pitch_shift", || Transposer::new(PitchShiftParams { semitones: 7.0 }));
    bench_processor(c, "pitch_correct", || PitchCorrector::new(sr));

    let mut group = c.benchmark_group("pitch_detect");
    for window in [1024, 2048, 4096] {
        let signal = generate_voice(220.0, SAMPLE_RATE, window);
        let mut detector = PitchDetector::with_window(sr, window);

        group.bench_with_input(BenchmarkId::from_parameter(window), &window, |b, _| {
            b.iter(|| black_box(detector.push_samples(black_box(&signal))))
        });
    }
    group.finish();
}

/// Detection on noise never settles on a candidate and walks the whole lag range
fn bench_pitch_detect_unvoiced(c: &mut Criterion) {
    let noise = generate_white_noise(2048);
    let mut detector = PitchDetector::new(SAMPLE_RATE as f32);

    c.bench_function("pitch_detect_noise_2048", |b| {
        b.iter(|| black_box(detector.push_samples(black_box(&noise))))
    });
}

criterion_group!(
    benches,
    bench_dynamics,
    bench_equalizer,
    bench_spectral,
    bench_pitch,
    bench_pitch_detect_unvoiced,
);

criterion_main!(benches);
