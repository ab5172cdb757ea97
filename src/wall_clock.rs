//! Wall-clock sampling engine
//!
//! A dedicated timer thread periodically walks the process's threads,
//! sampling up to [`THREADS_PER_TICK`] of them per iteration through the
//! signal-mediated handshake in [`crate::handshake`]. In idle-sampling
//! mode every thread is a candidate and the iteration interval shrinks as
//! the population grows, keeping the per-thread cadence roughly constant;
//! otherwise only OS-running threads are sampled at a fixed interval.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use libc::c_int;
use tracing::{debug, info, warn};

use crate::engine::{Engine, SamplerArgs, SamplerConfig};
use crate::error::EngineError;
use crate::filter::ThreadFilter;
use crate::handshake::{CapturedContext, HandshakeSlot};
use crate::library::LibraryMap;
use crate::os::{self, LinuxOs, Os, OsThreadState};
use crate::recorder::{ExecutionEvent, SampleKind, SampleRecorder};
use crate::thread_state::{StateClassifier, SyscallStateClassifier, ThreadState};

/// Maximum number of threads sampled in one iteration. This limit acts as
/// a throttle when generating profiling signals: applications with very
/// many threads would otherwise pay a large sampling overhead, and the
/// recorder's critical sections stay short.
pub const THREADS_PER_TICK: usize = 8;

/// Hard floor on the iteration sleep: 100 microseconds. Smaller intervals
/// are practically unusable due to the handshake overhead.
pub const MIN_INTERVAL_NS: i64 = 100_000;

/// Timer-side wait for the handler's publication.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(10);

/// Signal used to capture a sample on a target thread.
pub const SAMPLING_SIGNO: i32 = libc::SIGVTALRM;

/// Distinct signal used to break the timer thread out of its sleep on
/// stop.
pub const WAKEUP_SIGNO: i32 = libc::SIGPROF;

/// The process-wide rendezvous slot. A signal handler cannot be passed an
/// argument, so it locates the slot via this stable address.
static SLOT: HandshakeSlot = HandshakeSlot::new();

/// Divide the interval by the number of ticks needed to visit the whole
/// population, keeping the per-thread cadence roughly constant as the
/// thread count grows.
pub fn adjust_interval(interval_ns: i64, thread_count: usize) -> i64 {
    if thread_count > THREADS_PER_TICK {
        let ticks = thread_count.div_ceil(THREADS_PER_TICK);
        interval_ns / ticks as i64
    } else {
        interval_ns
    }
}

/// Sampling signal handler.
///
/// Runs on the target thread. Everything on this path is async-signal-safe:
/// atomics, a TLS pointer read, and a stack-allocated context. The handler
/// parks until the driver has finished walking this thread's stack; an
/// early return would let the stack mutate under the unwinder.
pub extern "C" fn sample_signal_handler(
    _signo: c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut c_void,
) {
    let tid = os::current_tid();
    let Some(gen) = SLOT.try_begin_publish(tid) else {
        // Misrouted, nested, or stale signal: not ours to answer.
        return;
    };

    let env = crate::runtime::current_env();
    // TODO: this fence should be redundant with the sequentially consistent
    // stores in publish(), yet publications get lost without it on x86_64.
    // Track down whether the env read needs the ordering or the compiler is
    // moving it.
    fence(Ordering::SeqCst);

    let mut context = CapturedContext { ucontext, env, tid };
    SLOT.publish(gen, &mut context);
    SLOT.park_until_walked(gen);
}

/// Wakeup handler: exists only so the signal interrupts nanosleep.
pub extern "C" fn wakeup_signal_handler(_signo: c_int) {}

struct SamplerShared<O: Os> {
    os: O,
    slot: &'static HandshakeSlot,
    recorder: Arc<dyn SampleRecorder>,
    filter: Arc<ThreadFilter>,
    classifier: Box<dyn StateClassifier>,
    interval_ns: AtomicI64,
    sample_idle: AtomicBool,
    running: AtomicBool,
    enabled: AtomicBool,
    timer_tid: AtomicI32,
}

/// The wall-clock sampling engine.
pub struct WallClock<O: Os = LinuxOs> {
    shared: Arc<SamplerShared<O>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl WallClock<LinuxOs> {
    /// Production engine: real OS, the process-wide handshake slot, and
    /// the syscall-instruction classifier over a snapshot of the loaded
    /// libraries.
    pub fn new(recorder: Arc<dyn SampleRecorder>, filter: Arc<ThreadFilter>) -> Self {
        let libraries = LibraryMap::load().unwrap_or_default();
        Self::with_parts(
            LinuxOs,
            &SLOT,
            Box::new(SyscallStateClassifier::new(libraries)),
            recorder,
            filter,
        )
    }
}

impl<O: Os> WallClock<O> {
    /// Assemble an engine from explicit collaborators. Scenario tests use
    /// this with a fake OS, a leaked private slot and a fixed classifier.
    pub fn with_parts(
        os: O,
        slot: &'static HandshakeSlot,
        classifier: Box<dyn StateClassifier>,
        recorder: Arc<dyn SampleRecorder>,
        filter: Arc<ThreadFilter>,
    ) -> Self {
        Self {
            shared: Arc::new(SamplerShared {
                os,
                slot,
                recorder,
                filter,
                classifier,
                interval_ns: AtomicI64::new(0),
                sample_idle: AtomicBool::new(false),
                running: AtomicBool::new(false),
                enabled: AtomicBool::new(true),
                timer_tid: AtomicI32::new(0),
            }),
            timer: Mutex::new(None),
        }
    }

    /// Whether the timer thread is running.
    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

impl<O: Os> Engine for WallClock<O> {
    fn start(&self, args: &SamplerArgs) -> Result<(), EngineError> {
        let config = SamplerConfig::resolve(args)?;

        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }

        self.shared
            .interval_ns
            .store(config.interval_ns, Ordering::SeqCst);
        self.shared
            .sample_idle
            .store(config.sample_idle, Ordering::SeqCst);

        if let Err(err) = self.shared.os.install_signal_handlers() {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(err);
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("reloj-sampler".to_string())
            .spawn(move || timer_loop(&shared));
        match handle {
            Ok(handle) => {
                *self
                    .timer
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
                info!(
                    interval_ns = config.interval_ns,
                    sample_idle = config.sample_idle,
                    "wall-clock sampler started"
                );
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(EngineError::TimerThread(err))
            }
        }
    }

    fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let timer_tid = self.shared.timer_tid.load(Ordering::SeqCst);
        if timer_tid > 0 {
            // Cut the timer thread's sleep short so it observes `running`.
            self.shared.os.send_signal(timer_tid, WAKEUP_SIGNO);
        }
        let handle = self
            .timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("timer thread panicked");
            }
        }
        self.shared.timer_tid.store(0, Ordering::SeqCst);
        info!("wall-clock sampler stopped");
    }

    /// Pause or resume sampling. A paused engine keeps its timer thread,
    /// which idles at the configured interval. The setting survives
    /// stop/start.
    fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl<O: Os> Drop for WallClock<O> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn timer_loop<O: Os>(shared: &SamplerShared<O>) {
    let self_tid = shared.os.thread_id();
    shared.timer_tid.store(self_tid, Ordering::SeqCst);

    let interval = shared.interval_ns.load(Ordering::SeqCst);
    let sample_idle = shared.sample_idle.load(Ordering::SeqCst);
    let filter_enabled = shared.filter.enabled();

    let mut thread_list = shared.os.list_threads();
    let mut next_cycle_time = shared.os.now_ns();

    while shared.running.load(Ordering::SeqCst) {
        if !shared.enabled.load(Ordering::SeqCst) {
            shared.os.sleep_ns(interval);
            continue;
        }

        if sample_idle {
            // Keep the wall-clock cadence stable regardless of how many
            // threads are being profiled.
            let estimated = if filter_enabled {
                shared.filter.size()
            } else {
                thread_list.size()
            };
            next_cycle_time += adjust_interval(interval, estimated);
        }

        let mut count = 0;
        while count < THREADS_PER_TICK {
            let Some(tid) = thread_list.next() else {
                thread_list.rewind();
                break;
            };

            if tid == self_tid || (filter_enabled && !shared.filter.accept(tid)) {
                continue;
            }

            if sample_idle || shared.os.thread_state(tid) == OsThreadState::Running {
                if walk_stack(shared, tid, interval, sample_idle) {
                    count += 1;
                }
            }
        }

        if sample_idle {
            let current_time = shared.os.now_ns();
            if next_cycle_time - current_time > MIN_INTERVAL_NS {
                shared.os.sleep_ns(next_cycle_time - current_time);
            } else {
                next_cycle_time = current_time + MIN_INTERVAL_NS;
                shared.os.sleep_ns(MIN_INTERVAL_NS);
            }
        } else {
            shared.os.sleep_ns(interval);
        }
    }
}

/// Drive one handshake against `tid` and hand the captured context to the
/// recorder. Returns false when the sample was skipped: the thread exited
/// before the signal arrived, or the handler never published in time.
fn walk_stack<O: Os>(shared: &SamplerShared<O>, tid: i32, interval_ns: i64, sample_idle: bool) -> bool {
    let gen = shared.slot.arm(tid);

    if !shared.os.send_signal(tid, SAMPLING_SIGNO) {
        debug!(tid, "signal delivery failed, thread gone");
        shared.slot.abandon();
        return false;
    }

    let Some(context_ptr) = shared.slot.wait_context_ready(gen, HANDSHAKE_TIMEOUT) else {
        debug!(tid, "handshake timed out");
        shared.slot.abandon();
        return false;
    };

    // Valid until release(): the target is parked in its handler and its
    // frame cannot unwind.
    let context = unsafe { context_ptr.as_ref() };
    let event = ExecutionEvent {
        thread_state: if sample_idle {
            shared.classifier.classify(context)
        } else {
            ThreadState::Unknown
        },
    };
    let env = unsafe { context.env.as_ref() };

    // The recorder is a black box; a panic must not leak past the driver
    // with the target still parked.
    let recorded = panic::catch_unwind(AssertUnwindSafe(|| {
        shared
            .recorder
            .record_sample(context, interval_ns, SampleKind::Execution, &event, env)
    }));

    shared.slot.release();

    if recorded.is_err() {
        warn!(tid, "recorder panicked, sample dropped");
    }
    true
}
