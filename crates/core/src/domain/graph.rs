//! Effect graph: node arena, routing modes and control handles
//!
//! Topology is fixed at construction. Nodes are visited in a precomputed
//! topological order; each one pulls its input from its predecessors'
//! buffers, so a block is processed without recursion or re-entrancy.

use crate::domain::audio::{AudioBlock, ProcessSpec};
use crate::domain::dsp::Processor;
use crate::domain::dynamics::{
    Compressor, CompressorParams, DeEsser, DeEsserParams, DynamicsMeter, GainParams, GainStage, NoiseGate,
    NoiseGateParams,
};
use crate::domain::equalizer::{Equalizer, EqualizerParams};
use crate::domain::formant::{FormantEngine, FormantMonitor, FormantParams, FormantSet};
use crate::domain::params::{ParamCell, SpectrumPoint};
use crate::domain::pitch::{PitchCorrector, PitchCorrectorParams, PitchMonitor};
use crate::domain::spectral::{DeNoiser, DeNoiserParams, SpectrumMonitor};
use crate::domain::stretch::{PitchShiftParams, Transposer};
use atomic_float::AtomicF32;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors detected while building a graph
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The successor lists contain a cycle
    #[error("Effect chain contains a cycle")]
    Cycle,

    /// A successor index does not name a node
    #[error("Node {node} references missing successor {successor}")]
    DanglingSuccessor { node: usize, successor: usize },

    /// Too many or too few outgoing edges for the node's mode
    #[error("Node {node} in {mode:?} mode cannot have {count} successor(s)")]
    SuccessorArity { node: usize, mode: ChainMode, count: usize },

    /// Too many or too few incoming edges for the node's mode
    #[error("Node {node} in {mode:?} mode cannot merge {count} input(s)")]
    PredecessorArity { node: usize, mode: ChainMode, count: usize },
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// Per-node routing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChainMode {
    /// At most one successor, at most one input
    #[default]
    SeriesDown,
    /// Processed buffer goes to two or more successors
    Split,
    /// Exactly two inputs, averaged
    DoubleParallel,
    /// Any number of inputs, summed
    Unite,
}

impl ChainMode {
    fn check_successors(self, node: usize, count: usize) -> Result<()> {
        let valid = match self {
            ChainMode::Split => count >= 2,
            _ => count <= 1,
        };
        if valid {
            Ok(())
        } else {
            Err(GraphError::SuccessorArity { node, mode: self, count })
        }
    }

    fn check_predecessors(self, node: usize, count: usize) -> Result<()> {
        let valid = match self {
            ChainMode::DoubleParallel => count == 2,
            ChainMode::Unite => true,
            ChainMode::SeriesDown | ChainMode::Split => count <= 1,
        };
        if valid {
            Ok(())
        } else {
            Err(GraphError::PredecessorArity { node, mode: self, count })
        }
    }
}

/// Serializable effect description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum EffectType {
    Gain(GainParams),
    NoiseGate(NoiseGateParams),
    Compressor(CompressorParams),
    Limiter { threshold_db: f32 },
    DeEsser(DeEsserParams),
    DeNoiser(DeNoiserParams),
    Formant(FormantParams),
    PitchShift(PitchShiftParams),
    PitchCorrect(PitchCorrectorParams),
    Equalizer(EqualizerParams),
}

impl EffectType {
    /// Get the effect name
    pub fn name(&self) -> &'static str {
        match self {
            EffectType::Gain(_) => "Gain",
            EffectType::NoiseGate(_) => "NoiseGate",
            EffectType::Compressor(_) => "Compressor",
            EffectType::Limiter { .. } => "Limiter",
            EffectType::DeEsser(_) => "DeEsser",
            EffectType::DeNoiser(_) => "DeNoiser",
            EffectType::Formant(_) => "Formant",
            EffectType::PitchShift(_) => "PitchShift",
            EffectType::PitchCorrect(_) => "PitchCorrect",
            EffectType::Equalizer(_) => "Equalizer",
        }
    }

    /// Instantiate the processor for this description
    pub fn create(&self, sample_rate: f32) -> Effect {
        match *self {
            EffectType::Gain(params) => Effect::Gain(GainStage::new(params)),
            EffectType::NoiseGate(params) => Effect::NoiseGate(NoiseGate::with_params(sample_rate, params)),
            EffectType::Compressor(params) => Effect::Compressor(Compressor::with_params(sample_rate, params)),
            EffectType::Limiter { threshold_db } => {
                Effect::Compressor(Compressor::with_params(sample_rate, CompressorParams::limiter(threshold_db)))
            }
            EffectType::DeEsser(params) => Effect::DeEsser(DeEsser::with_params(sample_rate, params)),
            EffectType::DeNoiser(params) => Effect::DeNoiser(DeNoiser::with_params(sample_rate, params)),
            EffectType::Formant(params) => Effect::Formant(FormantEngine::with_params(sample_rate, params)),
            EffectType::PitchShift(params) => Effect::PitchShift(Transposer::new(params)),
            EffectType::PitchCorrect(params) => {
                Effect::PitchCorrect(PitchCorrector::with_params(sample_rate, params))
            }
            EffectType::Equalizer(params) => Effect::Equalizer(Equalizer::with_params(sample_rate, params)),
        }
    }
}

/// Closed set of processors a node can own
pub enum Effect {
    Gain(GainStage),
    NoiseGate(NoiseGate),
    Compressor(Compressor),
    DeEsser(DeEsser),
    DeNoiser(DeNoiser),
    Formant(FormantEngine),
    PitchShift(Transposer),
    PitchCorrect(PitchCorrector),
    Equalizer(Equalizer),
}

macro_rules! dispatch {
    ($effect:expr, $p:ident => $body:expr) => {
        match $effect {
            Effect::Gain($p) => $body,
            Effect::NoiseGate($p) => $body,
            Effect::Compressor($p) => $body,
            Effect::DeEsser($p) => $body,
            Effect::DeNoiser($p) => $body,
            Effect::Formant($p) => $body,
            Effect::PitchShift($p) => $body,
            Effect::PitchCorrect($p) => $body,
            Effect::Equalizer($p) => $body,
        }
    };
}

impl Effect {
    /// Control-thread handles for this processor
    pub fn controls(&self) -> NodeControls {
        match self {
            Effect::Gain(p) => NodeControls::Gain {
                params: p.params_handle(),
                output_peak_db: p.output_meter(),
            },
            Effect::NoiseGate(p) => NodeControls::NoiseGate {
                params: p.params_handle(),
                meter: p.meter(),
            },
            Effect::Compressor(p) => NodeControls::Compressor {
                params: p.params_handle(),
                meter: p.meter(),
            },
            Effect::DeEsser(p) => NodeControls::DeEsser {
                params: p.params_handle(),
                meter: p.meter(),
            },
            Effect::DeNoiser(p) => NodeControls::DeNoiser {
                params: p.params_handle(),
                monitor: p.monitor(),
            },
            Effect::Formant(p) => NodeControls::Formant {
                params: p.params_handle(),
                monitor: p.monitor(),
            },
            Effect::PitchShift(p) => NodeControls::PitchShift {
                params: p.params_handle(),
            },
            Effect::PitchCorrect(p) => NodeControls::PitchCorrect {
                params: p.params_handle(),
                monitor: p.monitor(),
            },
            Effect::Equalizer(p) => NodeControls::Equalizer {
                params: p.params_handle(),
            },
        }
    }
}

impl Processor for Effect {
    fn prepare(&mut self, spec: &ProcessSpec) {
        dispatch!(self, p => p.prepare(spec))
    }

    fn process(&mut self, block: &mut AudioBlock) {
        dispatch!(self, p => p.process(block))
    }

    fn reset(&mut self) {
        dispatch!(self, p => p.reset())
    }

    fn latency(&self) -> usize {
        dispatch!(self, p => p.latency())
    }

    fn name(&self) -> &str {
        dispatch!(self, p => p.name())
    }
}

/// One node of the graph before construction
pub struct EffectNode {
    pub name: String,
    pub effect: Effect,
    pub mode: ChainMode,
    pub successors: Vec<usize>,
    pub bypass: bool,
}

impl EffectNode {
    pub fn new(name: impl Into<String>, effect: Effect) -> Self {
        Self {
            name: name.into(),
            effect,
            mode: ChainMode::SeriesDown,
            successors: Vec::new(),
            bypass: false,
        }
    }

    pub fn with_mode(mut self, mode: ChainMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_successors(mut self, successors: Vec<usize>) -> Self {
        self.successors = successors;
        self
    }
}

/// Validated node owned by the graph
struct GraphNode {
    name: String,
    effect: Effect,
    mode: ChainMode,
    predecessors: Vec<usize>,
    successors: Vec<usize>,
    bypass: Arc<AtomicBool>,
    buffer: AudioBlock,
}

/// Immutable-topology processing graph
pub struct EffectGraph {
    nodes: Vec<GraphNode>,
    order: Vec<usize>,
    sinks: Vec<usize>,
    spec: ProcessSpec,
    latency: usize,
}

impl EffectGraph {
    /// Validate the topology and prepare every processor for `spec`
    pub fn new(spec: ProcessSpec, nodes: Vec<EffectNode>) -> Result<Self> {
        let count = nodes.len();
        let mut predecessors = vec![Vec::new(); count];
        for (index, node) in nodes.iter().enumerate() {
            node.mode.check_successors(index, node.successors.len())?;
            for &successor in &node.successors {
                if successor >= count {
                    return Err(GraphError::DanglingSuccessor { node: index, successor });
                }
                predecessors[successor].push(index);
            }
        }
        for (index, node) in nodes.iter().enumerate() {
            node.mode.check_predecessors(index, predecessors[index].len())?;
        }

        let order = topological_order(&nodes, &predecessors)?;

        let nodes: Vec<GraphNode> = nodes
            .into_iter()
            .zip(predecessors)
            .map(|(node, predecessors)| GraphNode {
                name: node.name,
                effect: node.effect,
                mode: node.mode,
                predecessors,
                successors: node.successors,
                bypass: Arc::new(AtomicBool::new(node.bypass)),
                buffer: AudioBlock::default(),
            })
            .collect();
        let sinks = nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.successors.is_empty())
            .map(|(index, _)| index)
            .collect();

        let mut graph = Self {
            nodes,
            order,
            sinks,
            spec,
            latency: 0,
        };
        graph.prepare(&spec);
        debug!(
            "Effect graph built: {} nodes, order {:?}, latency {} samples",
            graph.nodes.len(),
            graph.order,
            graph.latency
        );
        Ok(graph)
    }

    /// Graph with no nodes; passes audio through untouched
    pub fn empty(spec: ProcessSpec) -> Self {
        Self {
            nodes: Vec::new(),
            order: Vec::new(),
            sinks: Vec::new(),
            spec,
            latency: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Visitation order fixed at construction
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Longest processor delay along any root-to-sink path
    pub fn latency(&self) -> usize {
        self.latency
    }

    /// Output of a node from the last processed block
    pub fn node_output(&self, index: usize) -> Option<&AudioBlock> {
        self.nodes.get(index).map(|node| &node.buffer)
    }

    /// Control-thread handles for every node, in list order
    pub fn control_surface(&self) -> ControlSurface {
        ControlSurface {
            sample_rate: self.spec.sample_rate,
            nodes: self
                .nodes
                .iter()
                .map(|node| NodeHandle {
                    name: node.name.clone(),
                    effect: node.effect.name().to_string(),
                    mode: node.mode,
                    bypass: Arc::clone(&node.bypass),
                    controls: node.effect.controls(),
                })
                .collect(),
        }
    }

    fn update_latency(&mut self) {
        let mut path = vec![0usize; self.nodes.len()];
        for &index in &self.order {
            let node = &self.nodes[index];
            let upstream = node.predecessors.iter().map(|&p| path[p]).max().unwrap_or(0);
            path[index] = upstream + node.effect.latency();
        }
        self.latency = self.sinks.iter().map(|&s| path[s]).max().unwrap_or(0);
    }
}

/// Kahn's algorithm; any node left unvisited sits on a cycle
fn topological_order(nodes: &[EffectNode], predecessors: &[Vec<usize>]) -> Result<Vec<usize>> {
    let mut in_degree: Vec<usize> = predecessors.iter().map(Vec::len).collect();
    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(index) = ready.pop_front() {
        order.push(index);
        for &successor in &nodes[index].successors {
            in_degree[successor] -= 1;
            if in_degree[successor] == 0 {
                ready.push_back(successor);
            }
        }
    }

    if order.len() == nodes.len() {
        Ok(order)
    } else {
        Err(GraphError::Cycle)
    }
}

impl Processor for EffectGraph {
    fn prepare(&mut self, spec: &ProcessSpec) {
        self.spec = *spec;
        for node in &mut self.nodes {
            node.effect.prepare(spec);
            node.buffer = AudioBlock::for_spec(spec);
        }
        self.update_latency();
    }

    /// Blocks that do not fit the prepared spec pass through untouched;
    /// hosts check them with [`ProcessSpec::check_block`]
    fn process(&mut self, block: &mut AudioBlock) {
        if self.nodes.is_empty() || self.spec.check_block(block).is_err() {
            return;
        }

        for position in 0..self.order.len() {
            let index = self.order[position];
            let mut buffer = std::mem::take(&mut self.nodes[index].buffer);
            let node = &self.nodes[index];

            match node.predecessors.as_slice() {
                [] => buffer.copy_from(block),
                [single] => buffer.copy_from(&self.nodes[*single].buffer),
                [first, rest @ ..] => {
                    buffer.copy_from(&self.nodes[*first].buffer);
                    for &other in rest {
                        buffer.add_from(&self.nodes[other].buffer, 1.0);
                    }
                    if node.mode == ChainMode::DoubleParallel {
                        buffer.scale(0.5);
                    }
                }
            }

            let node = &mut self.nodes[index];
            if !node.bypass.load(Ordering::Relaxed) {
                node.effect.process(&mut buffer);
            }
            node.buffer = buffer;
        }

        block.clear();
        for &sink in &self.sinks {
            block.add_from(&self.nodes[sink].buffer, 1.0);
        }
    }

    fn reset(&mut self) {
        for node in &mut self.nodes {
            node.effect.reset();
            node.buffer.clear();
        }
    }

    fn latency(&self) -> usize {
        self.latency
    }

    fn name(&self) -> &str {
        "EffectGraph"
    }
}

// ============================================================================
// CONTROL SURFACE
// ============================================================================

/// Parameter cells and monitors of one node
#[derive(Clone)]
pub enum NodeControls {
    Gain {
        params: Arc<ParamCell<GainParams>>,
        output_peak_db: Arc<AtomicF32>,
    },
    NoiseGate {
        params: Arc<ParamCell<NoiseGateParams>>,
        meter: Arc<DynamicsMeter>,
    },
    Compressor {
        params: Arc<ParamCell<CompressorParams>>,
        meter: Arc<DynamicsMeter>,
    },
    DeEsser {
        params: Arc<ParamCell<DeEsserParams>>,
        meter: Arc<DynamicsMeter>,
    },
    DeNoiser {
        params: Arc<ParamCell<DeNoiserParams>>,
        monitor: Arc<SpectrumMonitor>,
    },
    Formant {
        params: Arc<ParamCell<FormantParams>>,
        monitor: FormantMonitor,
    },
    PitchShift {
        params: Arc<ParamCell<PitchShiftParams>>,
    },
    PitchCorrect {
        params: Arc<ParamCell<PitchCorrectorParams>>,
        monitor: Arc<PitchMonitor>,
    },
    Equalizer {
        params: Arc<ParamCell<EqualizerParams>>,
    },
}

/// Control-thread view of one node
#[derive(Clone)]
pub struct NodeHandle {
    name: String,
    effect: String,
    mode: ChainMode,
    bypass: Arc<AtomicBool>,
    controls: NodeControls,
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Processor name, e.g. `Compressor`
    pub fn effect(&self) -> &str {
        &self.effect
    }

    pub fn mode(&self) -> ChainMode {
        self.mode
    }

    pub fn set_bypass(&self, bypass: bool) {
        self.bypass.store(bypass, Ordering::Relaxed);
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass.load(Ordering::Relaxed)
    }

    pub fn controls(&self) -> &NodeControls {
        &self.controls
    }

    /// Current gain reduction for dynamics nodes
    pub fn gain_reduction_db(&self) -> Option<f32> {
        match &self.controls {
            NodeControls::NoiseGate { meter, .. }
            | NodeControls::Compressor { meter, .. }
            | NodeControls::DeEsser { meter, .. } => Some(meter.gain_reduction_db()),
            _ => None,
        }
    }
}

/// Handles for every node of a published graph
///
/// Cloneable and `Send + Sync`; every accessor reads atomics or snapshot
/// cells and is safe to call while the audio thread runs.
#[derive(Clone)]
pub struct ControlSurface {
    sample_rate: f32,
    nodes: Vec<NodeHandle>,
}

impl ControlSurface {
    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&NodeHandle> {
        self.nodes.iter().find(|node| node.name == name)
    }

    fn pitch_monitor(&self) -> Option<&Arc<PitchMonitor>> {
        self.nodes.iter().find_map(|node| match &node.controls {
            NodeControls::PitchCorrect { monitor, .. } => Some(monitor),
            _ => None,
        })
    }

    fn formant_monitor(&self) -> Option<&FormantMonitor> {
        self.nodes.iter().find_map(|node| match &node.controls {
            NodeControls::Formant { monitor, .. } => Some(monitor),
            _ => None,
        })
    }

    fn spectrum_monitor(&self) -> Option<&Arc<SpectrumMonitor>> {
        self.nodes.iter().find_map(|node| match &node.controls {
            NodeControls::DeNoiser { monitor, .. } => Some(monitor),
            _ => None,
        })
    }

    /// Detected pitch in Hz from the first pitch-correction node (0 = unvoiced)
    pub fn current_pitch(&self) -> f32 {
        self.pitch_monitor().map_or(0.0, |m| m.current_pitch())
    }

    pub fn current_note(&self) -> Option<i32> {
        self.pitch_monitor().and_then(|m| m.current_note())
    }

    pub fn current_note_name(&self) -> Option<String> {
        self.pitch_monitor().and_then(|m| m.current_note_name())
    }

    pub fn formants(&self) -> FormantSet {
        self.formant_monitor().map(FormantMonitor::formants).unwrap_or_default()
    }

    pub fn formant_frequencies(&self) -> Vec<f32> {
        self.formants().as_slice().to_vec()
    }

    pub fn spectrum_data(&self) -> Vec<SpectrumPoint> {
        self.spectrum_monitor().map(|m| m.spectrum_data()).unwrap_or_default()
    }

    pub fn noise_profile_data(&self) -> Vec<SpectrumPoint> {
        self.spectrum_monitor().map(|m| m.noise_profile_data()).unwrap_or_default()
    }

    /// Response of the first equalizer node
    pub fn equalizer_response(&self, points: usize) -> Vec<SpectrumPoint> {
        self.nodes
            .iter()
            .find_map(|node| match &node.controls {
                NodeControls::Equalizer { params } => Some(params.load().response_curve(self.sample_rate, points)),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Sidechain response of the first de-esser node
    pub fn deesser_response(&self, points: usize) -> Vec<SpectrumPoint> {
        self.nodes
            .iter()
            .find_map(|node| match &node.controls {
                NodeControls::DeEsser { params, .. } => Some(params.load().response_curve(self.sample_rate, points)),
                _ => None,
            })
            .unwrap_or_default()
    }
}
