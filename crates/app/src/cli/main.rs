//! Vocalist CLI Application
//!
//! Renders a synthetic voice through a vocal chain on a dedicated audio
//! task while a control loop reads pitch, formant and level monitors.

mod synth;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use synth::{VoiceSynth, NOISE_LEAD_SECS};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use vocalist_core::domain::config::{ChainConfig, EngineConfig, NodeConfig, VocalistConfig};
use vocalist_core::domain::dsp::gain_to_db;
use vocalist_core::domain::dynamics::{CompressorParams, GainParams, NoiseGateParams};
use vocalist_core::domain::formant::FormantParams;
use vocalist_core::domain::graph::{ChainMode, ControlSurface, EffectType, NodeControls};
use vocalist_core::domain::stretch::PitchShiftParams;
use vocalist_infra::audio::{EngineController, RealtimeEngine};

#[derive(Parser)]
#[command(name = "vocalist")]
#[command(about = "Real-time vocal effects chain", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Render a synthetic voice through a chain and report the analysis
    Render(RenderArgs),
    /// Print a built-in chain as TOML
    Show {
        #[arg(value_enum, default_value_t = Preset::Factory)]
        preset: Preset,
    },
}

#[derive(Args)]
struct RenderArgs {
    /// Chain to render through
    #[arg(long, value_enum, default_value_t = Preset::Factory)]
    preset: Preset,

    /// Length of the rendered signal in seconds
    #[arg(long, default_value_t = 3.0)]
    seconds: f32,

    /// Fundamental of the synthetic voice in Hz
    #[arg(long, default_value_t = 226.0)]
    pitch: f32,

    #[arg(long, default_value_t = 48000)]
    sample_rate: u32,

    /// Host buffer size in frames
    #[arg(long, default_value_t = 256)]
    block_size: usize,

    /// Interval between analysis reports in milliseconds
    #[arg(long, default_value_t = 250)]
    report_ms: u64,

    /// Render as fast as possible instead of in real time
    #[arg(long)]
    fast: bool,

    /// Print the final summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
enum Preset {
    /// Gate, de-noise, compressor, de-esser, EQ, pitch correction
    Factory,
    /// Gate, formant shift, limiter
    Formant,
    /// Dry voice plus a fifth above, summed and limited
    Harmony,
}

impl Preset {
    fn chain(self) -> ChainConfig {
        match self {
            Preset::Factory => VocalistConfig::factory_default().chain,
            Preset::Formant => ChainConfig {
                nodes: vec![
                    NodeConfig::new("Gate", EffectType::NoiseGate(NoiseGateParams::default())),
                    NodeConfig::new(
                        "Formant",
                        EffectType::Formant(FormantParams { amount: 12.0, mix: 1.0 }),
                    ),
                    NodeConfig::new("Limiter", EffectType::Limiter { threshold_db: -1.0 }),
                ],
            },
            Preset::Harmony => {
                let mut split = NodeConfig::new("Split", EffectType::Gain(GainParams::default()));
                split.mode = ChainMode::Split;
                split.successors = Some(vec![1, 2]);
                let mut dry = NodeConfig::new("Dry", EffectType::Gain(GainParams { gain_db: -3.0 }));
                dry.successors = Some(vec![3]);
                let mut fifth = NodeConfig::new("Fifth", EffectType::PitchShift(PitchShiftParams { semitones: 7.0 }));
                fifth.successors = Some(vec![3]);
                let mut unite = NodeConfig::new("Bus", EffectType::Compressor(CompressorParams::default()));
                unite.mode = ChainMode::Unite;

                ChainConfig {
                    nodes: vec![
                        split,
                        dry,
                        fifth,
                        unite,
                        NodeConfig::new("Limiter", EffectType::Limiter { threshold_db: -1.0 }),
                    ],
                }
            }
        }
    }
}

/// What the audio task measured
#[derive(Debug, Default)]
struct RenderStats {
    frames: usize,
    input_sum_sq: f64,
    output_sum_sq: f64,
}

impl RenderStats {
    fn rms_db(sum_sq: f64, count: usize) -> f32 {
        if count == 0 {
            return gain_to_db(0.0);
        }
        gain_to_db((sum_sq / count as f64).sqrt() as f32)
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    preset: Preset,
    seconds: f32,
    sample_rate: u32,
    latency_samples: usize,
    latency_ms: f32,
    input_rms_db: f32,
    output_rms_db: f32,
    output_level_db: f32,
    pitch_hz: f32,
    note: Option<String>,
    formants_hz: Vec<f32>,
    gain_reduction_db: BTreeMap<String, f32>,
    noise_profile_peak_hz: Option<f32>,
}

/// Audio-thread loop: synthesize, process, measure
fn render(mut engine: RealtimeEngine, mut synth: VoiceSynth, total_frames: usize, block: usize, realtime: bool) -> RenderStats {
    let channels = engine.spec().channels;
    let block_time = Duration::from_secs_f32(block as f32 / engine.spec().sample_rate);
    let mut buffer = vec![0.0; block * channels];
    let mut stats = RenderStats::default();
    let start = Instant::now();

    while stats.frames < total_frames {
        let frames = block.min(total_frames - stats.frames);
        let data = &mut buffer[..frames * channels];
        synth.fill(data, channels);
        stats.input_sum_sq += data.iter().map(|&s| (s * s) as f64).sum::<f64>();

        engine.process_interleaved(data);
        stats.output_sum_sq += data.iter().map(|&s| (s * s) as f64).sum::<f64>();
        stats.frames += frames;

        if realtime {
            let due = block_time * (stats.frames / block) as u32;
            if let Some(wait) = due.checked_sub(start.elapsed()) {
                std::thread::sleep(wait);
            }
        }
    }
    stats
}

fn set_learning(surface: &ControlSurface, learning: bool) -> bool {
    let mut found = false;
    for node in surface.nodes() {
        if let NodeControls::DeNoiser { params, .. } = node.controls() {
            params.update(|p| p.learning = learning);
            found = true;
        }
    }
    found
}

fn report(surface: &ControlSurface, controller: &EngineController) {
    let note = surface.current_note_name().unwrap_or_else(|| "-".to_string());
    info!(
        pitch_hz = %format!("{:.1}", surface.current_pitch()),
        note = %note,
        formants = ?surface.formant_frequencies(),
        level_db = %format!("{:.1}", controller.output_level_db()),
        "Analysis"
    );
    for node in surface.nodes() {
        if let Some(reduction) = node.gain_reduction_db() {
            debug!(node = node.name(), reduction_db = reduction, "Gain reduction");
        }
    }
}

async fn run_render(args: RenderArgs) -> anyhow::Result<()> {
    let config = VocalistConfig {
        engine: EngineConfig {
            sample_rate: args.sample_rate,
            max_block_size: args.block_size,
            channels: 2,
        },
        chain: args.preset.chain(),
    };
    let (controller, engine) = EngineController::create(&config).context("Failed to build the vocal chain")?;
    let surface = controller.control_surface().clone();
    let sample_rate = args.sample_rate as f32;

    let mut learning = set_learning(&surface, true);
    if learning {
        info!("Learning noise profile for {:.1}s", NOISE_LEAD_SECS);
    }

    let total_frames = (args.seconds.max(0.0) * sample_rate) as usize;
    let synth = VoiceSynth::new(sample_rate, args.pitch);
    let block = args.block_size;
    let realtime = !args.fast;
    let mut audio = tokio::task::spawn_blocking(move || render(engine, synth, total_frames, block, realtime));

    let mut ticker = tokio::time::interval(Duration::from_millis(args.report_ms.max(10)));
    let stats = loop {
        tokio::select! {
            result = &mut audio => break result.context("Audio task panicked")?,
            _ = ticker.tick() => {
                let rendered = controller.meter().blocks() as f32 * block as f32 / sample_rate;
                if learning && rendered >= NOISE_LEAD_SECS {
                    set_learning(&surface, false);
                    learning = false;
                    info!("Noise profile captured");
                }
                report(&surface, &controller);
            }
        }
    };
    if learning {
        warn!("Render finished before the noise lead-in was captured");
        set_learning(&surface, false);
    }

    let noise_profile_peak_hz = surface
        .noise_profile_data()
        .into_iter()
        .max_by(|a, b| a.magnitude_db.total_cmp(&b.magnitude_db))
        .filter(|p| p.magnitude_db > -100.0)
        .map(|p| p.frequency);

    let summary = Summary {
        preset: args.preset,
        seconds: stats.frames as f32 / sample_rate,
        sample_rate: args.sample_rate,
        latency_samples: controller.latency(),
        latency_ms: controller.latency() as f32 * 1000.0 / sample_rate,
        input_rms_db: RenderStats::rms_db(stats.input_sum_sq, stats.frames * 2),
        output_rms_db: RenderStats::rms_db(stats.output_sum_sq, stats.frames * 2),
        output_level_db: controller.output_level_db(),
        pitch_hz: surface.current_pitch(),
        note: surface.current_note_name(),
        formants_hz: surface.formant_frequencies(),
        gain_reduction_db: surface
            .nodes()
            .iter()
            .filter_map(|node| node.gain_reduction_db().map(|db| (node.name().to_string(), db)))
            .collect(),
        noise_profile_peak_hz,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!(
            "Rendered {:.2}s, latency {:.1}ms, RMS {:.1}dB -> {:.1}dB",
            summary.seconds, summary.latency_ms, summary.input_rms_db, summary.output_rms_db
        );
        info!("Final pitch {:.1}Hz ({})", summary.pitch_hz, summary.note.as_deref().unwrap_or("unvoiced"));
        for (node, reduction) in &summary.gain_reduction_db {
            info!("{}: {:.1}dB gain reduction", node, reduction);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    info!("Vocalist starting...");

    match cli.command {
        Command::Render(args) => run_render(args).await,
        Command::Show { preset } => {
            let config = VocalistConfig {
                engine: EngineConfig::default(),
                chain: preset.chain(),
            };
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
