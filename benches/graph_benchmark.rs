//! Criterion benchmarks for complete chains
//!
//! Measures:
//! - Graph traversal overhead (empty and gain-only chains)
//! - The factory vocal chain at several block sizes
//! - Parallel routing (split / unite)
//! - Engine round trip through interleaved buffers
//! - Graph build and publish cost on the control thread

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use vocalist_benchmarks::{generate_voice, interleave};
use vocalist_core::domain::audio::{AudioBlock, ProcessSpec};
use vocalist_core::domain::config::{ChainConfig, EngineConfig, NodeConfig, VocalistConfig};
use vocalist_core::domain::dsp::Processor;
use vocalist_core::domain::dynamics::{CompressorParams, GainParams};
use vocalist_core::domain::graph::{ChainMode, EffectType};
use vocalist_core::domain::stretch::PitchShiftParams;
use vocalist_infra::audio::EngineController;

const SAMPLE_RATE: u32 = 48000;

fn gain_chain(length: usize) -> ChainConfig {
    ChainConfig {
        nodes: (0..length)
            .map(|i| NodeConfig::new(format!("Gain {}", i), EffectType::Gain(GainParams::default())))
            .collect(),
    }
}

fn harmony_chain() -> ChainConfig {
    let mut split = NodeConfig::new("Split", EffectType::Gain(GainParams::default()));
    split.mode = ChainMode::Split;
    split.successors = Some(vec![1, 2]);
    let mut dry = NodeConfig::new("Dry", EffectType::Gain(GainParams::default()));
    dry.successors = Some(vec![3]);
    let mut third = NodeConfig::new("Third", EffectType::PitchShift(PitchShiftParams { semitones: 4.0 }));
    third.successors = Some(vec![3]);
    let mut bus = NodeConfig::new("Bus", EffectType::Compressor(CompressorParams::default()));
    bus.mode = ChainMode::Unite;

    ChainConfig {
        nodes: vec![split, dry, third, bus],
    }
}

fn spec(block: usize) -> ProcessSpec {
    ProcessSpec::new(SAMPLE_RATE as f32, block, 2)
}

fn stereo_voice(block: usize) -> AudioBlock {
    let voice = generate_voice(220.0, SAMPLE_RATE, block);
    AudioBlock::from_channels(vec![voice.clone(), voice])
}

/// Traversal cost as the chain grows
fn bench_chain_length(c: &mut Criterion) {
    let mut group = c.benchmark_group("gain_chain_length");

    for length in [0, 1, 4, 16] {
        let Ok(mut graph) = gain_chain(length).build(spec(256)) else {
            continue;
        };
        let input = stereo_voice(256);
        let mut block = input.clone();

        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, _| {
            b.iter(|| {
                block.copy_from(&input);
                graph.process(black_box(&mut block));
                black_box(&mut block);
            })
        });
    }

    group.finish();
}

fn bench_factory_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("factory_chain");
    let chain = VocalistConfig::factory_default().chain;

    for block_size in [64, 256, 512] {
        let Ok(mut graph) = chain.build(spec(block_size)) else {
            continue;
        };
        let input = stereo_voice(block_size);
        let mut block = input.clone();

        group.bench_with_input(BenchmarkId::from_parameter(block_size), &block_size, |b, _| {
            b.iter(|| {
                block.copy_from(&input);
                graph.process(black_box(&mut block));
                black_box(&mut block);
            })
        });
    }

    group.finish();
}

fn bench_parallel_routing(c: &mut Criterion) {
    let Ok(mut graph) = harmony_chain().build(spec(256)) else {
        return;
    };
    let input = stereo_voice(256);
    let mut block = input.clone();

    c.bench_function("harmony_split_unite_256", |b| {
        b.iter(|| {
            block.copy_from(&input);
            graph.process(black_box(&mut block));
            black_box(&mut block);
        })
    });
}

fn bench_engine_interleaved(c: &mut Criterion) {
    let config = VocalistConfig {
        engine: EngineConfig {
            sample_rate: SAMPLE_RATE,
            max_block_size: 256,
            channels: 2,
        },
        chain: VocalistConfig::factory_default().chain,
    };
    let Ok((_controller, mut engine)) = EngineController::create(&config) else {
        return;
    };
    let input = interleave(&generate_voice(220.0, SAMPLE_RATE, 1024), 2);
    let mut buffer = input.clone();

    c.bench_function("engine_factory_interleaved_1024", |b| {
        b.iter(|| {
            buffer.copy_from_slice(&input);
            engine.process_interleaved(black_box(&mut buffer));
            black_box(&mut buffer);
        })
    });
}

/// Control-thread cost of building, validating and preparing a chain
fn bench_build_and_publish(c: &mut Criterion) {
    let chain = VocalistConfig::factory_default().chain;
    c.bench_function("build_factory_chain", |b| {
        b.iter(|| black_box(chain.build(spec(512))))
    });

    let config = VocalistConfig::default();
    let Ok((mut controller, mut engine)) = EngineController::create(&config) else {
        return;
    };
    let mut buffer = vec![0.0; 2 * 512];
    c.bench_function("publish_and_swap_gain_chain", |b| {
        b.iter(|| {
            let surface = controller.publish(black_box(&gain_chain(2)));
            engine.process_interleaved(&mut buffer);
            controller.collect_retired();
            black_box(surface.is_ok())
        })
    });
}

criterion_group!(
    benches,
    bench_chain_length,
    bench_factory_chain,
    bench_parallel_routing,
    bench_engine_interleaved,
    bench_build_and_publish,
);

criterion_main!(benches);
