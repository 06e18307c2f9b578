//! Configuration data for the vocal chain
//!
//! This module provides:
//! - Engine settings (sample rate, block size, channel count)
//! - Chain topology as plain serde data, convertible to an [`EffectGraph`]
//! - TOML text conversion (no file access; persistence belongs to the host)

use crate::domain::audio::{AudioError, ProcessSpec};
use crate::domain::dynamics::{CompressorParams, DeEsserParams, NoiseGateParams};
use crate::domain::equalizer::EqualizerParams;
use crate::domain::graph::{ChainMode, EffectGraph, EffectNode, EffectType, GraphError};
use crate::domain::pitch::{PitchCorrectorParams, Scale};
use crate::domain::spectral::DeNoiserParams;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur while reading or applying configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid chain: {0}")]
    Graph(#[from] GraphError),

    #[error("Invalid engine settings: {0}")]
    Engine(#[from] AudioError),
}

/// Stream settings the chain is prepared for
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub max_block_size: usize,
    pub channels: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            max_block_size: 512,
            channels: 2,
        }
    }
}

impl EngineConfig {
    /// Validated processing spec
    pub fn process_spec(&self) -> Result<ProcessSpec> {
        let spec = ProcessSpec::new(self.sample_rate as f32, self.max_block_size, self.channels);
        spec.validate()?;
        Ok(spec)
    }
}

/// One node of the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub effect: EffectType,
    #[serde(default)]
    pub bypass: bool,
    #[serde(default)]
    pub mode: ChainMode,
    /// Explicit successor indices; `None` links to the next node in the list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successors: Option<Vec<usize>>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, effect: EffectType) -> Self {
        Self {
            name: name.into(),
            effect,
            bypass: false,
            mode: ChainMode::SeriesDown,
            successors: None,
        }
    }
}

/// Ordered node list plus routing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl ChainConfig {
    /// Successors of node `index` with the implicit next-node link applied
    pub fn successors(&self, index: usize) -> Vec<usize> {
        match &self.nodes[index].successors {
            Some(explicit) => explicit.clone(),
            None if index + 1 < self.nodes.len() => vec![index + 1],
            None => Vec::new(),
        }
    }

    /// Instantiate, validate and prepare the graph for `spec`
    #[instrument(skip(self), fields(nodes = self.nodes.len()))]
    pub fn build(&self, spec: ProcessSpec) -> Result<EffectGraph> {
        let nodes = self
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| EffectNode {
                name: node.name.clone(),
                effect: node.effect.create(spec.sample_rate),
                mode: node.mode,
                successors: self.successors(index),
                bypass: node.bypass,
            })
            .collect();

        let graph = EffectGraph::new(spec, nodes)?;
        debug!("Chain built with {} nodes", graph.len());
        Ok(graph)
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VocalistConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub chain: ChainConfig,
}

impl VocalistConfig {
    /// Gate, de-noiser, compressor, de-esser, EQ and pitch correction in series
    pub fn factory_default() -> Self {
        let nodes = vec![
            NodeConfig::new("Gate", EffectType::NoiseGate(NoiseGateParams::default())),
            NodeConfig::new(
                "DeNoise",
                EffectType::DeNoiser(DeNoiserParams {
                    amount: 0.3,
                    learning: false,
                }),
            ),
            NodeConfig::new("Compressor", EffectType::Compressor(CompressorParams::default())),
            NodeConfig::new("DeEss", EffectType::DeEsser(DeEsserParams::default())),
            NodeConfig::new("EQ", EffectType::Equalizer(EqualizerParams::default())),
            NodeConfig::new(
                "Tune",
                EffectType::PitchCorrect(PitchCorrectorParams {
                    scale: Scale::Major,
                    ..Default::default()
                }),
            ),
        ];

        Self {
            engine: EngineConfig::default(),
            chain: ChainConfig { nodes },
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Build the graph for the configured engine settings
    pub fn build_graph(&self) -> Result<EffectGraph> {
        self.chain.build(self.engine.process_spec()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::dynamics::GainParams;

    #[test]
    fn test_config_serialization() {
        let config = VocalistConfig::factory_default();

        let toml_str = config.to_toml_string().unwrap();
        let parsed = VocalistConfig::from_toml_str(&toml_str).unwrap();

        assert_eq!(parsed, config);
        assert_eq!(parsed.chain.nodes.len(), 6);
    }

    #[test]
    fn test_successors_default_to_next_node() {
        let config = VocalistConfig::factory_default();
        assert_eq!(config.chain.successors(0), vec![1]);
        assert_eq!(config.chain.successors(5), Vec::<usize>::new());

        let graph = config.build_graph().unwrap();
        assert_eq!(graph.order(), &[0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_parse_split_chain() {
        let text = r#"
            [engine]
            sample_rate = 44100
            max_block_size = 256
            channels = 1

            [[chain.nodes]]
            name = "Split"
            mode = "Split"
            successors = [1, 2]
            effect = { type = "Gain", params = { gain_db = 0.0 } }

            [[chain.nodes]]
            name = "Dry"
            successors = [3]
            effect = { type = "Gain", params = { gain_db = -6.0 } }

            [[chain.nodes]]
            name = "Low"
            successors = [3]
            effect = { type = "PitchShift", params = { semitones = -12.0 } }

            [[chain.nodes]]
            name = "Sum"
            mode = "Unite"
            effect = { type = "Limiter", params = { threshold_db = -1.0 } }
        "#;

        let config = VocalistConfig::from_toml_str(text).unwrap();
        assert_eq!(config.engine.sample_rate, 44100);
        assert_eq!(config.chain.nodes[3].mode, ChainMode::Unite);
        assert!(!config.chain.nodes[1].bypass);

        let graph = config.build_graph().unwrap();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.order()[0], 0);
        assert_eq!(graph.order()[3], 3);
    }

    #[test]
    fn test_graph_errors_surface() {
        let mut chain = ChainConfig {
            nodes: vec![
                NodeConfig::new("a", EffectType::Gain(GainParams::default())),
                NodeConfig::new("b", EffectType::Gain(GainParams::default())),
            ],
        };
        chain.nodes[1].successors = Some(vec![0]);

        let result = chain.build(ProcessSpec::default());
        assert!(matches!(result, Err(ConfigError::Graph(GraphError::Cycle))));
    }

    #[test]
    fn test_invalid_engine_rejected() {
        let config = VocalistConfig {
            engine: EngineConfig {
                sample_rate: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(config.build_graph(), Err(ConfigError::Engine(_))));
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = VocalistConfig::from_toml_str("").unwrap();
        assert_eq!(config.engine, EngineConfig::default());
        assert!(config.chain.nodes.is_empty());
        assert!(config.build_graph().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_toml_is_error() {
        assert!(matches!(
            VocalistConfig::from_toml_str("engine = [1, 2"),
            Err(ConfigError::TomlParse(_))
        ));
    }
}
