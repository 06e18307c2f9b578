//! Real-time engine driving the effect graph
//!
//! The engine is split in two halves joined by bounded crossbeam channels:
//! - [`RealtimeEngine`] lives on the audio thread. It never allocates, logs
//!   or blocks; a new graph is picked up with a single `try_recv`.
//! - [`EngineController`] lives on the control thread. It builds and
//!   prepares graphs, publishes them, and frees the graphs the audio thread
//!   retires.

use atomic_float::AtomicF32;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use vocalist_core::domain::audio::{AudioBlock, AudioError, ProcessSpec};
use vocalist_core::domain::config::{ChainConfig, ConfigError, VocalistConfig};
use vocalist_core::domain::dsp::{gain_to_db, params, Processor};
use vocalist_core::domain::graph::{ControlSurface, EffectGraph};

/// Graphs waiting for the audio thread
const PUBLISH_SLOTS: usize = 1;
/// Retired graphs waiting for the control thread
const RETIRE_SLOTS: usize = 4;
/// Output meter fall rate
pub const METER_DECAY_DB_PER_SEC: f32 = 12.0;

/// Errors reported to the control thread
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    /// The previous graph has not been picked up yet
    #[error("A graph is already waiting to be swapped in")]
    SwapPending,

    #[error("Audio side of the engine is gone")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Peak output level with a linear-in-dB fall
#[derive(Debug)]
pub struct OutputMeter {
    level_db: AtomicF32,
    blocks: AtomicU64,
    rejected: AtomicU64,
}

impl Default for OutputMeter {
    fn default() -> Self {
        Self {
            level_db: AtomicF32::new(params::DB_FLOOR),
            blocks: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }
}

impl OutputMeter {
    pub fn level_db(&self) -> f32 {
        self.level_db.load(Ordering::Relaxed)
    }

    /// Blocks processed since the engine started
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Blocks left untouched because they did not fit the engine layout
    pub fn rejected_blocks(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn publish(&self, peak: f32, block_seconds: f32) {
        let fallen = self.level_db() - METER_DECAY_DB_PER_SEC * block_seconds;
        let level = gain_to_db(peak).max(fallen).max(params::DB_FLOOR);
        self.level_db.store(level, Ordering::Relaxed);
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }
}

/// Audio-thread half
pub struct RealtimeEngine {
    graph: EffectGraph,
    spec: ProcessSpec,
    scratch: AudioBlock,
    incoming: Receiver<EffectGraph>,
    retired: Sender<EffectGraph>,
    // Holds a retired graph while the return channel is full or the
    // controller is gone; freed when the engine itself is dropped
    parked: Option<EffectGraph>,
    meter: Arc<OutputMeter>,
}

impl RealtimeEngine {
    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Latency of the graph currently in use
    pub fn latency(&self) -> usize {
        self.graph.latency()
    }

    /// Check a host block against the prepared layout
    pub fn check_block(&self, block: &AudioBlock) -> std::result::Result<(), AudioError> {
        self.spec.check_block(block)
    }

    /// Process one planar block in place
    ///
    /// The block must have the engine's channel count and at most
    /// `max_block_size` frames; anything else is left untouched and counted
    /// in [`OutputMeter::rejected_blocks`].
    pub fn process_block(&mut self, block: &mut AudioBlock) {
        if self.spec.check_block(block).is_err() {
            self.meter.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.swap_pending_graph();
        self.graph.process(block);
        let seconds = block.len() as f32 / self.spec.sample_rate;
        self.meter.publish(block.peak(), seconds);
    }

    /// Process interleaved host samples in place, in chunks of at most
    /// `max_block_size` frames
    pub fn process_interleaved(&mut self, data: &mut [f32]) {
        let chunk_len = self.spec.max_block_size * self.spec.channels;
        if chunk_len == 0 {
            return;
        }
        let mut scratch = std::mem::take(&mut self.scratch);
        for chunk in data.chunks_mut(chunk_len) {
            scratch.read_interleaved(chunk);
            self.process_block(&mut scratch);
            scratch.write_interleaved(chunk);
        }
        self.scratch = scratch;
    }

    fn swap_pending_graph(&mut self) {
        if let Some(graph) = self.parked.take() {
            self.retire(graph);
        }
        if self.parked.is_some() {
            return;
        }
        if let Ok(next) = self.incoming.try_recv() {
            let old = std::mem::replace(&mut self.graph, next);
            self.retire(old);
        }
    }

    fn retire(&mut self, graph: EffectGraph) {
        match self.retired.try_send(graph) {
            Ok(()) => {}
            Err(TrySendError::Full(graph)) | Err(TrySendError::Disconnected(graph)) => {
                self.parked = Some(graph)
            }
        }
    }
}

/// Control-thread half
pub struct EngineController {
    spec: ProcessSpec,
    publish: Sender<EffectGraph>,
    retired: Receiver<EffectGraph>,
    meter: Arc<OutputMeter>,
    surface: ControlSurface,
    latency: usize,
}

impl EngineController {
    /// Build the configured chain and return both halves of the engine
    #[instrument(skip(config), fields(nodes = config.chain.nodes.len()))]
    pub fn create(config: &VocalistConfig) -> Result<(EngineController, RealtimeEngine)> {
        let spec = config.engine.process_spec()?;
        let graph = config.chain.build(spec)?;
        let (publish, incoming) = bounded(PUBLISH_SLOTS);
        let (retired_tx, retired) = bounded(RETIRE_SLOTS);
        let meter = Arc::new(OutputMeter::default());

        let controller = EngineController {
            spec,
            publish,
            retired,
            meter: Arc::clone(&meter),
            surface: graph.control_surface(),
            latency: graph.latency(),
        };
        let engine = RealtimeEngine {
            graph,
            spec,
            scratch: AudioBlock::for_spec(&spec),
            incoming,
            retired: retired_tx,
            parked: None,
            meter,
        };

        info!(
            "Engine created: {}Hz, {} frames, {} channels, latency {} samples",
            spec.sample_rate, spec.max_block_size, spec.channels, controller.latency
        );
        Ok((controller, engine))
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Handles of the most recently published graph
    pub fn control_surface(&self) -> &ControlSurface {
        &self.surface
    }

    /// Latency of the most recently published graph
    pub fn latency(&self) -> usize {
        self.latency
    }

    pub fn output_level_db(&self) -> f32 {
        self.meter.level_db()
    }

    pub fn meter(&self) -> Arc<OutputMeter> {
        Arc::clone(&self.meter)
    }

    /// Build, validate and prepare `chain`, then hand it to the audio thread
    ///
    /// The audio thread swaps it in at the start of its next block. The new
    /// control surface is returned and also kept as the current one.
    #[instrument(skip(self, chain), fields(nodes = chain.nodes.len()))]
    pub fn publish(&mut self, chain: &ChainConfig) -> Result<ControlSurface> {
        self.collect_retired();
        let graph = chain.build(self.spec)?;
        let surface = graph.control_surface();
        let latency = graph.latency();

        match self.publish.try_send(graph) {
            Ok(()) => {
                debug!("Published graph with {} nodes", surface.nodes().len());
                self.surface = surface.clone();
                self.latency = latency;
                Ok(surface)
            }
            Err(TrySendError::Full(_)) => {
                warn!("Graph swap already pending, new chain discarded");
                Err(EngineError::SwapPending)
            }
            Err(TrySendError::Disconnected(_)) => Err(EngineError::Disconnected),
        }
    }

    /// Free graphs the audio thread has retired; returns how many
    pub fn collect_retired(&self) -> usize {
        let count = self.retired.try_iter().count();
        if count > 0 {
            debug!("Released {} retired graph(s)", count);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vocalist_core::domain::config::{EngineConfig, NodeConfig};
    use vocalist_core::domain::dynamics::GainParams;
    use vocalist_core::domain::graph::EffectType;

    fn config(nodes: Vec<NodeConfig>) -> VocalistConfig {
        VocalistConfig {
            engine: EngineConfig {
                sample_rate: 48000,
                max_block_size: 64,
                channels: 2,
            },
            chain: ChainConfig { nodes },
        }
    }

    fn gain_chain(db: f32) -> ChainConfig {
        ChainConfig {
            nodes: vec![NodeConfig::new("Gain", EffectType::Gain(GainParams { gain_db: db }))],
        }
    }

    #[test]
    fn test_empty_chain_passes_through() {
        let (_controller, mut engine) = EngineController::create(&config(Vec::new())).unwrap();
        let mut data: Vec<f32> = (0..300).map(|i| (i as f32 * 0.01).sin()).collect();
        let expected = data.clone();
        engine.process_interleaved(&mut data);
        assert_eq!(data, expected);
    }

    #[test]
    fn test_interleaved_larger_than_block() {
        let (_controller, mut engine) = EngineController::create(&config(gain_chain(-6.0206).nodes)).unwrap();
        // 1000 frames of stereo, processed in 64-frame chunks
        let mut data = vec![0.5; 2000];
        engine.process_interleaved(&mut data);
        assert!(data.iter().all(|s| (s - 0.25).abs() < 1e-4));
    }

    #[test]
    fn test_publish_swaps_at_next_block() {
        let (mut controller, mut engine) = EngineController::create(&config(Vec::new())).unwrap();
        let surface = controller.publish(&gain_chain(-20.0)).unwrap();
        assert_eq!(surface.nodes().len(), 1);
        assert_eq!(controller.control_surface().nodes()[0].name(), "Gain");

        let mut data = vec![1.0; 128];
        engine.process_interleaved(&mut data);
        assert!(data[0] < 0.2);

        // The old graph comes back for release on this thread
        assert_eq!(controller.collect_retired(), 1);
    }

    #[test]
    fn test_second_publish_before_swap_is_rejected() {
        let (mut controller, mut engine) = EngineController::create(&config(Vec::new())).unwrap();
        controller.publish(&gain_chain(0.0)).unwrap();
        assert!(matches!(
            controller.publish(&gain_chain(-6.0)),
            Err(EngineError::SwapPending)
        ));

        engine.process_interleaved(&mut [0.0; 128]);
        assert!(controller.publish(&gain_chain(-6.0)).is_ok());
    }

    #[test]
    fn test_invalid_chain_reported_before_publication() {
        let (mut controller, _engine) = EngineController::create(&config(Vec::new())).unwrap();
        let mut chain = gain_chain(0.0);
        chain.nodes[0].successors = Some(vec![3]);
        assert!(matches!(controller.publish(&chain), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_output_meter_tracks_peak_and_decays() {
        let (controller, mut engine) = EngineController::create(&config(Vec::new())).unwrap();
        assert_eq!(controller.output_level_db(), params::DB_FLOOR);

        let mut loud = vec![0.5; 128];
        engine.process_interleaved(&mut loud);
        let level = controller.output_level_db();
        assert!((level - gain_to_db(0.5)).abs() < 1e-3);

        let mut quiet = vec![0.0; 128];
        engine.process_interleaved(&mut quiet);
        let fallen = controller.output_level_db();
        assert!(fallen < level);
        assert!(fallen > level - 1.0);
        assert_eq!(controller.meter().blocks(), 2);
    }

    #[test]
    fn test_retired_graphs_parked_when_return_full() {
        let (mut controller, mut engine) = EngineController::create(&config(Vec::new())).unwrap();
        for _ in 0..RETIRE_SLOTS + 2 {
            controller.publish.try_send(gain_chain(0.0).build(controller.spec).unwrap()).unwrap();
            engine.process_interleaved(&mut [0.0; 128]);
        }
        assert!(engine.parked.is_some());
        assert_eq!(controller.collect_retired(), RETIRE_SLOTS);

        // Parked graph returns, then the waiting graph is swapped in
        engine.process_interleaved(&mut [0.0; 128]);
        assert!(engine.parked.is_none());
        assert_eq!(controller.collect_retired(), 2);
    }

    #[test]
    fn test_mismatched_block_left_untouched() {
        let mut mono = config(gain_chain(-20.0).nodes);
        mono.engine.channels = 1;
        let (controller, mut engine) = EngineController::create(&mono).unwrap();

        let mut block = AudioBlock::from_channels(vec![vec![0.5; 128], vec![0.5; 128]]);
        assert_eq!(
            engine.check_block(&block),
            Err(AudioError::ChannelMismatch { expected: 1, got: 2 })
        );
        engine.process_block(&mut block);
        assert_eq!(block.len(), 128);
        assert!(block.channels().all(|ch| ch.iter().all(|&s| s == 0.5)));

        let mut long = AudioBlock::from_mono(&[0.5; 128]);
        assert!(matches!(engine.check_block(&long), Err(AudioError::BlockTooLarge { .. })));
        engine.process_block(&mut long);
        assert!(long.channel(0).iter().all(|&s| s == 0.5));

        assert_eq!(controller.meter().rejected_blocks(), 2);
        assert_eq!(controller.meter().blocks(), 0);
    }

    #[test]
    fn test_retired_graph_parked_after_controller_dropped() {
        let (mut controller, mut engine) = EngineController::create(&config(Vec::new())).unwrap();
        controller.publish(&gain_chain(-20.0)).unwrap();
        drop(controller);

        let mut data = vec![1.0; 128];
        engine.process_interleaved(&mut data);
        assert!(data[0] < 0.2);
        assert!(engine.parked.is_some());

        // Stays parked rather than being freed inside the callback
        engine.process_interleaved(&mut [0.0; 128]);
        assert!(engine.parked.is_some());
    }
}
