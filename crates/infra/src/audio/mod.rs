//! Real-time processing engine
//!
//! The host (or the CLI's synthetic audio thread) owns a [`RealtimeEngine`]
//! and calls it once per buffer; everything else talks to the
//! [`EngineController`].

pub mod engine;

pub use engine::*;
