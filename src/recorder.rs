//! Sample recording seam
//!
//! The engine hands every captured sample to a [`SampleRecorder`]. The
//! recorder runs on the timer thread (never in signal context) while the
//! sampled thread is parked in its handler, so the context is stable for
//! exactly the duration of the call; implementations must not retain it
//! and must not block indefinitely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::handshake::CapturedContext;
use crate::runtime::RuntimeEnv;
use crate::thread_state::ThreadState;

/// What kind of event produced a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum SampleKind {
    /// Periodic execution sample from the wall-clock engine.
    Execution,
}

/// Event payload attached to an execution sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionEvent {
    pub thread_state: ThreadState,
}

/// Consumer of captured samples.
pub trait SampleRecorder: Send + Sync {
    /// Record one sample, returning its id.
    ///
    /// `context` and `env` are valid only for the duration of the call:
    /// both point at the sampled thread's stack and thread-locals, which
    /// stay frozen only while the thread is parked.
    fn record_sample(
        &self,
        context: &CapturedContext,
        interval_ns: i64,
        kind: SampleKind,
        event: &ExecutionEvent,
        env: Option<&RuntimeEnv>,
    ) -> u64;
}

/// A sample flattened into plain data, safe to keep after the handshake
/// ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Monotonically increasing id assigned by the recorder.
    pub id: u64,
    /// Wall timestamp in nanoseconds since the epoch.
    pub timestamp_ns: u64,
    /// OS tid of the sampled thread.
    pub tid: i32,
    /// Name the thread attached under, if it attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    pub kind: SampleKind,
    pub thread_state: ThreadState,
    /// Sampling interval this sample represents.
    pub interval_ns: i64,
}

impl SampleRecord {
    /// Flatten a live capture into an owned record.
    pub fn from_capture(
        id: u64,
        context: &CapturedContext,
        interval_ns: i64,
        kind: SampleKind,
        event: &ExecutionEvent,
        env: Option<&RuntimeEnv>,
    ) -> Self {
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            id,
            timestamp_ns,
            tid: context.tid,
            thread_name: env.map(|e| e.name().to_string()),
            kind,
            thread_state: event.thread_state,
            interval_ns,
        }
    }
}

/// Per-thread aggregate counts.
#[derive(Debug, Clone, Default)]
pub struct ThreadSampleStats {
    pub samples: u64,
    pub running: u64,
    pub sleeping: u64,
    pub unknown: u64,
    pub name: Option<String>,
}

/// Recorder aggregating per-thread sample counts, printed as a summary
/// table when profiling ends.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    next_id: AtomicU64,
    stats: Mutex<HashMap<i32, ThreadSampleStats>>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total samples recorded so far.
    pub fn total_samples(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    /// Snapshot of the per-thread aggregates.
    pub fn snapshot(&self) -> HashMap<i32, ThreadSampleStats> {
        // A panic under the lock must not wedge sampling; the counters in
        // the map stay consistent, only the interrupted update is lost.
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Print the per-thread summary to stderr, busiest threads first.
    pub fn print_summary(&self) {
        let stats = self.snapshot();
        if stats.is_empty() {
            eprintln!("\nNo samples collected.");
            return;
        }

        let mut sorted: Vec<_> = stats.into_iter().collect();
        sorted.sort_by(|a, b| b.1.samples.cmp(&a.1.samples));

        eprintln!();
        eprintln!(
            "{:<10} {:<20} {:>9} {:>9} {:>9} {:>9}",
            "TID", "Thread", "Samples", "Running", "Sleeping", "Unknown"
        );
        eprintln!("{}", "-".repeat(72));
        for (tid, entry) in &sorted {
            eprintln!(
                "{:<10} {:<20} {:>9} {:>9} {:>9} {:>9}",
                tid,
                entry.name.as_deref().unwrap_or("-"),
                entry.samples,
                entry.running,
                entry.sleeping,
                entry.unknown
            );
        }
        eprintln!("{}", "-".repeat(72));
        let total: u64 = sorted.iter().map(|(_, entry)| entry.samples).sum();
        eprintln!("{total} samples total");
    }
}

impl SampleRecorder for StatsRecorder {
    fn record_sample(
        &self,
        context: &CapturedContext,
        _interval_ns: i64,
        _kind: SampleKind,
        event: &ExecutionEvent,
        env: Option<&RuntimeEnv>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = stats.entry(context.tid).or_default();
        entry.samples += 1;
        match event.thread_state {
            ThreadState::Running => entry.running += 1,
            ThreadState::Sleeping => entry.sleeping += 1,
            ThreadState::Unknown => entry.unknown += 1,
        }
        if entry.name.is_none() {
            entry.name = env.map(|e| e.name().to_string());
        }
        id
    }
}
