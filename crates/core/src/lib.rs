//! Vocalist core: real-time vocal DSP and effect-graph routing
//!
//! Everything in this crate runs either on the audio thread (processors,
//! graph traversal) or on the control thread (configuration, parameter
//! stores, snapshot reads). Nothing here performs I/O.

pub mod domain;
