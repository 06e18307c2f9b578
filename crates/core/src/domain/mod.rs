//! Domain entities and signal-processing rules

pub mod audio;
pub mod config;
pub mod dsp;
pub mod dynamics;
pub mod equalizer;
pub mod formant;
pub mod graph;
pub mod params;
pub mod pitch;
pub mod spectral;
pub mod stretch;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{AudioBlock, AudioError, ProcessSpec};
pub use config::{ChainConfig, ConfigError, EngineConfig, NodeConfig, VocalistConfig};
pub use dsp::{db_to_gain, gain_to_db, BiquadCoeffs, BiquadFilter, EnvelopeFollower, Processor};
pub use dynamics::{
    Compressor, CompressorParams, DeEsser, DeEsserParams, DynamicsMeter, GainParams, GainStage, NoiseGate,
    NoiseGateParams,
};
pub use equalizer::{Equalizer, EqualizerParams};
pub use formant::{FormantEngine, FormantMonitor, FormantParams, FormantSet, FormantShifter};
pub use graph::{ChainMode, ControlSurface, Effect, EffectGraph, EffectNode, EffectType, GraphError, NodeControls, NodeHandle};
pub use params::{ParamCell, Params, SnapshotCell, SpectrumPoint};
pub use pitch::{PitchCorrector, PitchCorrectorParams, PitchDetector, PitchMonitor, Scale, Tracking};
pub use spectral::{DeNoiser, DeNoiserParams, FormantDetector, OverlapAdd, SpectrumMonitor};
pub use stretch::{PhaseVocoder, PitchShiftParams, PitchShifter, SampleRing, TimeStretch, Transposer};
