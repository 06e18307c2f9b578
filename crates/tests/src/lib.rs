//! Cross-crate integration tests for the vocal chain

#[cfg(test)]
mod chain_integration;
