//! Buffered recorder with a sidecar writer thread
//!
//! Decouples the timer loop from I/O: `record_sample` flattens the capture
//! into a [`SampleRecord`], pushes it onto a bounded lock-free queue and
//! returns. A sidecar thread drains the queue and writes JSON lines to the
//! sink. The push never blocks; when the queue is full the sample is
//! dropped and counted, because stalling the timer loop would distort the
//! sampling cadence for every thread.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use tracing::{debug, warn};

use crate::handshake::CapturedContext;
use crate::recorder::{ExecutionEvent, SampleKind, SampleRecord, SampleRecorder};
use crate::runtime::RuntimeEnv;

const DRAIN_IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Recorder that buffers samples through a bounded queue and exports them
/// as JSON lines from a sidecar thread.
pub struct RingBufferRecorder {
    queue: Arc<ArrayQueue<SampleRecord>>,
    next_id: AtomicU64,
    dropped: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    sidecar: Mutex<Option<JoinHandle<()>>>,
}

impl RingBufferRecorder {
    /// Create a recorder draining into `sink`. Fails when the export
    /// thread cannot be spawned.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, sink: Box<dyn Write + Send>) -> std::io::Result<Self> {
        assert!(capacity > 0, "ring buffer capacity must be > 0");

        let queue = Arc::new(ArrayQueue::new(capacity));
        let dropped = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let sidecar = {
            let queue = Arc::clone(&queue);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("reloj-export".to_string())
                .spawn(move || drain_loop(&queue, &shutdown, sink))?
        };

        Ok(Self {
            queue,
            next_id: AtomicU64::new(0),
            dropped,
            shutdown,
            sidecar: Mutex::new(Some(sidecar)),
        })
    }

    /// Samples dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    /// Stop the sidecar after draining whatever is queued.
    ///
    /// Runs during drop as well, so a poisoned lock is recovered rather
    /// than compounding an unwind with a second panic.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let handle = self
            .sidecar
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("export thread panicked during shutdown");
            }
        }
    }
}

impl Drop for RingBufferRecorder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SampleRecorder for RingBufferRecorder {
    fn record_sample(
        &self,
        context: &CapturedContext,
        interval_ns: i64,
        kind: SampleKind,
        event: &ExecutionEvent,
        env: Option<&RuntimeEnv>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let record = SampleRecord::from_capture(id, context, interval_ns, kind, event, env);
        if self.queue.push(record).is_err() {
            self.dropped.fetch_add(1, Ordering::AcqRel);
            debug!(tid = context.tid, "sample dropped, export queue full");
        }
        id
    }
}

fn drain_loop(
    queue: &ArrayQueue<SampleRecord>,
    shutdown: &AtomicBool,
    mut sink: Box<dyn Write + Send>,
) {
    loop {
        let mut wrote = false;
        while let Some(record) = queue.pop() {
            wrote = true;
            match serde_json::to_string(&record) {
                Ok(line) => {
                    if writeln!(sink, "{line}").is_err() {
                        warn!("export sink write failed, stopping export");
                        return;
                    }
                }
                Err(err) => warn!(error = %err, "failed to serialize sample"),
            }
        }
        if wrote {
            let _ = sink.flush();
        }
        if shutdown.load(Ordering::Acquire) && queue.is_empty() {
            let _ = sink.flush();
            return;
        }
        if !wrote {
            thread::sleep(DRAIN_IDLE_SLEEP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_state::ThreadState;
    use std::ptr;

    /// Sink double collecting everything written to it.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn record_one(recorder: &RingBufferRecorder, tid: i32) -> u64 {
        let context = CapturedContext {
            ucontext: ptr::null_mut(),
            env: ptr::null(),
            tid,
        };
        let event = ExecutionEvent {
            thread_state: ThreadState::Running,
        };
        recorder.record_sample(&context, 1_000_000, SampleKind::Execution, &event, None)
    }

    #[test]
    fn test_records_drain_to_sink_as_jsonl() {
        let sink = SharedSink::default();
        let recorder = RingBufferRecorder::new(64, Box::new(sink.clone())).unwrap();
        for tid in 1..=5 {
            record_one(&recorder, tid);
        }
        recorder.shutdown();

        let bytes = sink.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        for line in lines {
            let record: SampleRecord = serde_json::from_str(line).unwrap();
            assert!((1..=5).contains(&record.tid));
        }
        assert_eq!(recorder.dropped(), 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let recorder = RingBufferRecorder::new(8, Box::new(SharedSink::default())).unwrap();
        recorder.shutdown();
        recorder.shutdown();
    }

    #[test]
    fn test_ids_are_monotonic() {
        let recorder = RingBufferRecorder::new(8, Box::new(SharedSink::default())).unwrap();
        let a = record_one(&recorder, 1);
        let b = record_one(&recorder, 1);
        assert!(b > a);
        recorder.shutdown();
    }
}
