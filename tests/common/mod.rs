//! Shared test doubles: a virtual-clock OS, fake target threads that run
//! the real handler-side handshake protocol, and a collecting recorder.
#![allow(dead_code)]

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reloj::error::EngineError;
use reloj::handshake::{CapturedContext, HandshakeSlot};
use reloj::os::{Os, OsThreadState, ThreadList};
use reloj::recorder::{ExecutionEvent, SampleKind, SampleRecorder};
use reloj::runtime::RuntimeEnv;
use reloj::thread_state::{StateClassifier, ThreadState};
use reloj::wall_clock::WAKEUP_SIGNO;

/// Tid the fake OS reports for the timer thread itself.
pub const TIMER_SELF_TID: i32 = 1;

struct FakeThreadEntry {
    tid: i32,
    state: OsThreadState,
    alive: Arc<AtomicBool>,
    signals: Sender<TargetMessage>,
}

#[derive(Default)]
struct FakeOsInner {
    clock_ns: AtomicI64,
    sleeps: Mutex<Vec<i64>>,
    threads: Mutex<Vec<FakeThreadEntry>>,
}

/// Test double for the OS facade. The clock is virtual: `sleep_ns` simply
/// advances it, so scenario tests measure cadence in virtual time and run
/// in milliseconds of real time.
#[derive(Clone, Default)]
pub struct FakeOs {
    inner: Arc<FakeOsInner>,
}

impl FakeOs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every sleep duration the timer loop has requested so far.
    pub fn sleep_log(&self) -> Vec<i64> {
        self.inner.sleeps.lock().unwrap().clone()
    }

    pub fn virtual_now(&self) -> i64 {
        self.inner.clock_ns.load(Ordering::SeqCst)
    }
}

impl Os for FakeOs {
    fn now_ns(&self) -> i64 {
        self.inner.clock_ns.load(Ordering::SeqCst)
    }

    fn sleep_ns(&self, ns: i64) {
        if ns <= 0 {
            return;
        }
        self.inner.clock_ns.fetch_add(ns, Ordering::SeqCst);
        self.inner.sleeps.lock().unwrap().push(ns);
        // Yield so target responders and the observing test make progress.
        thread::yield_now();
    }

    fn thread_id(&self) -> i32 {
        TIMER_SELF_TID
    }

    fn list_threads(&self) -> Box<dyn ThreadList> {
        let mut list = FakeThreadList {
            inner: Arc::clone(&self.inner),
            tids: Vec::new(),
            cursor: 0,
        };
        list.rewind();
        Box::new(list)
    }

    fn thread_state(&self, tid: i32) -> OsThreadState {
        self.inner
            .threads
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.tid == tid)
            .map(|entry| entry.state)
            .unwrap_or(OsThreadState::Dead)
    }

    fn send_signal(&self, tid: i32, signo: i32) -> bool {
        if signo == WAKEUP_SIGNO {
            return true;
        }
        let threads = self.inner.threads.lock().unwrap();
        match threads.iter().find(|entry| entry.tid == tid) {
            Some(entry) if entry.alive.load(Ordering::SeqCst) => {
                entry.signals.send(TargetMessage::Signal).is_ok()
            }
            _ => false,
        }
    }

    fn install_signal_handlers(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

struct FakeThreadList {
    inner: Arc<FakeOsInner>,
    tids: Vec<i32>,
    cursor: usize,
}

impl ThreadList for FakeThreadList {
    fn next(&mut self) -> Option<i32> {
        let tid = self.tids.get(self.cursor).copied();
        if tid.is_some() {
            self.cursor += 1;
        }
        tid
    }

    fn rewind(&mut self) {
        self.tids = self
            .inner
            .threads
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.tid)
            .collect();
        self.cursor = 0;
    }

    fn size(&self) -> usize {
        self.tids.len()
    }
}

enum TargetMessage {
    Signal,
    Stop,
}

/// How a fake target answers sampling signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetBehavior {
    /// Runs the handler-side protocol promptly.
    Responsive,
    /// Receives the signal but never reaches the slot, like a thread whose
    /// handler is delayed past any reasonable deadline. Exercises the
    /// driver's handshake timeout.
    Unresponsive,
}

/// A fake target thread: registered with the fake OS, and answering
/// sampling signals by running the real handler-side protocol against the
/// engine's handshake slot (claim, publish a stack-local context, park).
pub struct FakeTarget {
    pub tid: i32,
    alive: Arc<AtomicBool>,
    signals: Sender<TargetMessage>,
    worker: Option<JoinHandle<()>>,
}

impl FakeTarget {
    /// Spawn a responder for `tid`.
    pub fn spawn(
        os: &FakeOs,
        slot: &'static HandshakeSlot,
        tid: i32,
        state: OsThreadState,
        behavior: TargetBehavior,
    ) -> Self {
        let (sender, receiver) = mpsc::channel();
        let alive = Arc::new(AtomicBool::new(true));
        let env: &'static RuntimeEnv =
            Box::leak(Box::new(RuntimeEnv::new(tid, format!("fake-{tid}"))));

        let worker = thread::spawn(move || {
            while let Ok(message) = receiver.recv() {
                match message {
                    TargetMessage::Stop => break,
                    TargetMessage::Signal => {
                        if behavior == TargetBehavior::Unresponsive {
                            continue;
                        }
                        if let Some(gen) = slot.try_begin_publish(tid) {
                            let mut context = CapturedContext {
                                ucontext: ptr::null_mut(),
                                env: env as *const RuntimeEnv,
                                tid,
                            };
                            slot.publish(gen, &mut context);
                            slot.park_until_walked(gen);
                        }
                    }
                }
            }
        });

        os.inner.threads.lock().unwrap().push(FakeThreadEntry {
            tid,
            state,
            alive: Arc::clone(&alive),
            signals: sender.clone(),
        });

        Self {
            tid,
            alive,
            signals: sender,
            worker: Some(worker),
        }
    }

    /// Make the thread "exit": it stays enumerable until the next list
    /// rescan notices, but signal delivery fails, as for a real tid that
    /// died between selection and tgkill.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl Drop for FakeTarget {
    fn drop(&mut self) {
        let _ = self.signals.send(TargetMessage::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Leak a private handshake slot for one scenario. Production uses the
/// process-wide slot; tests must not share state across scenarios.
pub fn leak_slot() -> &'static HandshakeSlot {
    Box::leak(Box::new(HandshakeSlot::new()))
}

/// One recorded sample, flattened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub id: u64,
    pub tid: i32,
    pub state: ThreadState,
    pub interval_ns: i64,
    pub env_tid: Option<i32>,
}

/// Recorder double collecting every call.
#[derive(Default)]
pub struct CollectingRecorder {
    next_id: AtomicU64,
    samples: Mutex<Vec<Recorded>>,
}

impl CollectingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    pub fn samples(&self) -> Vec<Recorded> {
        self.samples.lock().unwrap().clone()
    }

    pub fn count_for(&self, tid: i32) -> usize {
        self.samples
            .lock()
            .unwrap()
            .iter()
            .filter(|sample| sample.tid == tid)
            .count()
    }

    /// Block until at least `n` samples arrived or the timeout elapsed.
    pub fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while self.count() < n {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl SampleRecorder for CollectingRecorder {
    fn record_sample(
        &self,
        context: &CapturedContext,
        interval_ns: i64,
        _kind: SampleKind,
        event: &ExecutionEvent,
        env: Option<&RuntimeEnv>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        // The context must be stable for the whole call; re-reading the
        // tid at the end would catch a mutation.
        let tid = context.tid;
        self.samples.lock().unwrap().push(Recorded {
            id,
            tid,
            state: event.thread_state,
            interval_ns,
            env_tid: env.map(|e| e.tid()),
        });
        assert_eq!(context.tid, tid, "context mutated during recorder call");
        id
    }
}

/// Classifier double returning a fixed state; fake contexts carry no real
/// machine context to inspect.
pub struct FixedClassifier(pub ThreadState);

impl StateClassifier for FixedClassifier {
    fn classify(&self, _context: &CapturedContext) -> ThreadState {
        self.0
    }
}
