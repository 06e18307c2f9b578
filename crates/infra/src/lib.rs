//! Vocalist infrastructure: audio-thread engine and graph publication

pub mod audio;
