//! Thread filtering for selective sampling
//!
//! When the filter is enabled, the timer loop samples only tids the
//! embedder has registered; when disabled, every enumerated thread is a
//! candidate. The set also feeds the population estimate used to keep the
//! wall-clock cadence stable.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use tracing::warn;

/// Shared set of sampleable tids with an enable flag.
///
/// Writers are embedder threads registering themselves; the only hot
/// reader is the timer loop.
#[derive(Debug, Default)]
pub struct ThreadFilter {
    enabled: AtomicBool,
    tids: RwLock<HashSet<i32>>,
}

impl ThreadFilter {
    /// Create a disabled filter: everything is accepted.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Register a tid. Enables nothing by itself.
    pub fn add(&self, tid: i32) {
        if let Ok(mut tids) = self.tids.write() {
            tids.insert(tid);
        } else {
            warn!(tid, "thread filter lock poisoned, registration dropped");
        }
    }

    pub fn remove(&self, tid: i32) {
        if let Ok(mut tids) = self.tids.write() {
            tids.remove(&tid);
        } else {
            warn!(tid, "thread filter lock poisoned, removal dropped");
        }
    }

    pub fn clear(&self) {
        if let Ok(mut tids) = self.tids.write() {
            tids.clear();
        } else {
            warn!("thread filter lock poisoned, clear dropped");
        }
    }

    /// Whether `tid` should be sampled. A disabled filter accepts all.
    pub fn accept(&self, tid: i32) -> bool {
        if !self.enabled() {
            return true;
        }
        if let Ok(tids) = self.tids.read() {
            tids.contains(&tid)
        } else {
            // Sampling stays alive on a poisoned lock, as if unfiltered.
            warn!("thread filter lock poisoned, accepting all threads");
            true
        }
    }

    /// Number of registered tids.
    pub fn size(&self) -> usize {
        if let Ok(tids) = self.tids.read() {
            tids.len()
        } else {
            warn!("thread filter lock poisoned, reporting empty filter");
            0
        }
    }
}
