//! Parameter snapshots and visualization snapshots shared across threads
//!
//! Two sharing patterns cross the audio/control boundary:
//! - [`ParamCell`]: the control thread stores a whole parameter struct, the
//!   audio thread loads it once per block (single pointer swap, lock-free).
//! - [`SnapshotCell`]: the audio thread copies visualization data in with
//!   `try_lock` (skipping the update when contended), the control thread
//!   clones it out.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Plain parameter struct for one processor
///
/// `clamped` maps any value into the processor's documented safe range. It
/// runs when a snapshot is stored, so the audio thread never re-validates.
pub trait Params: Copy + PartialEq + Send + Sync + 'static {
    fn clamped(self) -> Self;
}

/// Atomically swappable parameter snapshot
#[derive(Debug)]
pub struct ParamCell<P: Params> {
    inner: ArcSwap<P>,
}

impl<P: Params> ParamCell<P> {
    pub fn new(params: P) -> Self {
        Self {
            inner: ArcSwap::from_pointee(params.clamped()),
        }
    }

    pub fn shared(params: P) -> Arc<Self> {
        Arc::new(Self::new(params))
    }

    /// Read the current snapshot (audio or control thread)
    #[inline]
    pub fn load(&self) -> P {
        **self.inner.load()
    }

    /// Publish a new snapshot (control thread)
    pub fn store(&self, params: P) {
        self.inner.store(Arc::new(params.clamped()));
    }

    /// Read-modify-write convenience for single-field edits
    pub fn update(&self, f: impl FnOnce(&mut P)) {
        let mut params = self.load();
        f(&mut params);
        self.store(params);
    }
}

/// Visualization data guarded by a short critical section
#[derive(Debug, Default)]
pub struct SnapshotCell<T> {
    inner: Mutex<T>,
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Update from the audio thread; returns false if the lock was busy
    pub fn try_publish(&self, f: impl FnOnce(&mut T)) -> bool {
        match self.inner.try_lock() {
            Ok(mut guard) => {
                f(&mut guard);
                true
            }
            Err(_) => false,
        }
    }
}

impl<T: Clone> SnapshotCell<T> {
    /// Copy out the latest snapshot (control thread)
    pub fn read(&self) -> T {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// One point of a frequency/amplitude display curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectrumPoint {
    pub frequency: f32,
    pub magnitude_db: f32,
}

/// Logarithmically spaced display frequencies between `low` and `high`
pub fn log_frequencies(low: f32, high: f32, points: usize) -> impl Iterator<Item = f32> {
    let span = (high / low).ln();
    let steps = points.saturating_sub(1).max(1) as f32;
    (0..points).map(move |i| low * (span * i as f32 / steps).exp())
}
