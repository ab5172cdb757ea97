//! Single-slot rendezvous between the timer thread and a signal handler
//!
//! One handshake is in flight at any time, driven exclusively by the timer
//! thread. The slot lives at a stable address (a signal handler cannot be
//! passed an argument) and consists only of sequentially-consistent
//! atomics, so the handler side is async-signal-safe: no heap, no locks,
//! no reentrancy hazards.
//!
//! Protocol, in slot terms:
//!
//! 1. Driver [`arm`]s the slot for a target tid and signals the target.
//! 2. The target's handler calls [`try_begin_publish`]; the first
//!    invocation to win the compare-and-swap owns this handshake, any
//!    concurrent or misrouted invocation returns immediately.
//! 3. The winner builds a [`CapturedContext`] on its own stack,
//!    [`publish`]es it, then [`park_until_walked`]s. The park has no
//!    timeout: releasing the thread early would let its stack mutate under
//!    the unwinder.
//! 4. The driver consumes the context, invokes the recorder, and
//!    [`release`]s the target.
//!
//! Every arm carries a generation. The driver bumps it on [`arm`] and again
//! on [`abandon`] (handshake timeout or failed signal delivery), and a
//! publication is tagged with the generation it was armed under. A handler
//! that wins the CAS but runs late therefore cannot hang forever in its
//! park (the generation has moved on) and cannot have its stale context
//! consumed by a later handshake (the tag no longer matches).
//!
//! [`arm`]: HandshakeSlot::arm
//! [`try_begin_publish`]: HandshakeSlot::try_begin_publish
//! [`publish`]: HandshakeSlot::publish
//! [`park_until_walked`]: HandshakeSlot::park_until_walked
//! [`release`]: HandshakeSlot::release
//! [`abandon`]: HandshakeSlot::abandon

use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicPtr, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::runtime::RuntimeEnv;

/// Sentinel tid meaning "no target armed".
pub const NO_TARGET: i32 = -1;

/// The machine context captured by the signal handler, stack-allocated in
/// the handler's own frame.
///
/// The pointed-to memory is live exactly until the driver sets
/// `stack_walked`; the driver must not let any reference escape the
/// recorder call.
#[derive(Debug)]
pub struct CapturedContext {
    /// Opaque machine context as delivered to the signal handler.
    pub ucontext: *mut c_void,
    /// Runtime-environment handle of the captured thread, null when the
    /// thread never attached.
    pub env: *const RuntimeEnv,
    /// OS tid of the captured thread.
    pub tid: i32,
}

/// Lock-free rendezvous slot. One shared instance per process; only
/// meaningful between engine start and stop.
#[derive(Debug)]
pub struct HandshakeSlot {
    /// Tid the sampling signal is directed to, or [`NO_TARGET`].
    target_tid: AtomicI32,
    /// Advanced on every arm and abandon. Publication and park are scoped
    /// to the generation observed at handler entry.
    generation: AtomicU64,
    /// Published by the handler; points into the handler's frame.
    context_ptr: AtomicPtr<CapturedContext>,
    /// Gate: true means the next matching handler invocation is the
    /// expected one. Flipped false by the winning CAS.
    may_publish: AtomicBool,
    /// Generation whose context is currently published, 0 when none.
    ready_gen: AtomicU64,
    /// Set by the driver once it is done with the context; unparks the
    /// handler.
    stack_walked: AtomicBool,
}

impl HandshakeSlot {
    pub const fn new() -> Self {
        Self {
            target_tid: AtomicI32::new(NO_TARGET),
            generation: AtomicU64::new(0),
            context_ptr: AtomicPtr::new(ptr::null_mut()),
            may_publish: AtomicBool::new(false),
            ready_gen: AtomicU64::new(0),
            stack_walked: AtomicBool::new(false),
        }
    }

    // --- driver side (timer thread only) ---

    /// Arm the slot for `tid`. Returns the generation of this arm, which
    /// scopes the wait and must be passed back to [`wait_context_ready`].
    ///
    /// [`wait_context_ready`]: HandshakeSlot::wait_context_ready
    pub fn arm(&self, tid: i32) -> u64 {
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.target_tid.store(tid, Ordering::SeqCst);
        self.context_ptr.store(ptr::null_mut(), Ordering::SeqCst);
        self.ready_gen.store(0, Ordering::SeqCst);
        self.stack_walked.store(false, Ordering::SeqCst);
        self.may_publish.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        gen
    }

    /// Spin until the handler publishes the context for generation `gen`,
    /// or the timeout elapses.
    ///
    /// On success the returned pointer is valid until [`release`] is
    /// called; on timeout the caller must [`abandon`] the handshake.
    ///
    /// [`release`]: HandshakeSlot::release
    /// [`abandon`]: HandshakeSlot::abandon
    pub fn wait_context_ready(&self, gen: u64, timeout: Duration) -> Option<NonNull<CapturedContext>> {
        let deadline = Instant::now() + timeout;
        while self.ready_gen.load(Ordering::SeqCst) != gen {
            if Instant::now() >= deadline {
                return None;
            }
            // Unlike the handler's park, this side runs on an ordinary
            // thread; yielding lets the target get scheduled on small
            // machines.
            std::thread::yield_now();
        }
        NonNull::new(self.context_ptr.load(Ordering::SeqCst))
    }

    /// Release the parked target: the driver is done with the context.
    pub fn release(&self) {
        self.stack_walked.store(true, Ordering::SeqCst);
    }

    /// Abandon an armed handshake: signal delivery failed or the handler
    /// never published in time. Advancing the generation unparks a handler
    /// that won the CAS but ran late, and invalidates any publication it
    /// may still make.
    pub fn abandon(&self) {
        self.may_publish.store(false, Ordering::SeqCst);
        self.target_tid.store(NO_TARGET, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    // --- handler side (async-signal-safe) ---

    /// Handler entry: claim the in-flight handshake.
    ///
    /// Returns the generation this handler owns, or `None` when the signal
    /// was misrouted (`my_tid` is not the target), another invocation
    /// already won the CAS, or the slot moved on between the CAS and the
    /// generation re-check. On `None` the handler must return immediately
    /// without publishing.
    pub fn try_begin_publish(&self, my_tid: i32) -> Option<u64> {
        let gen = self.generation.load(Ordering::SeqCst);
        if self.target_tid.load(Ordering::SeqCst) != my_tid {
            return None;
        }
        if self
            .may_publish
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        // The slot may have been abandoned and re-armed between the loads
        // above and the CAS. Publishing under the new generation would
        // capture the wrong thread, so bail out; the driver of the new
        // handshake times out and retries.
        if self.generation.load(Ordering::SeqCst) != gen {
            return None;
        }
        Some(gen)
    }

    /// Publish the captured context for generation `gen`. Must only be
    /// called with a generation obtained from [`try_begin_publish`].
    ///
    /// [`try_begin_publish`]: HandshakeSlot::try_begin_publish
    pub fn publish(&self, gen: u64, context: *mut CapturedContext) {
        self.context_ptr.store(context, Ordering::SeqCst);
        self.ready_gen.store(gen, Ordering::SeqCst);
    }

    /// Park until the driver has finished walking the stack.
    ///
    /// No timeout: the context points into this frame and the thread must
    /// not run on while the driver may still read it. The park exits early
    /// only when the generation has moved on, which means the driver
    /// abandoned this handshake and will never consume the publication.
    pub fn park_until_walked(&self, gen: u64) {
        loop {
            if self.stack_walked.load(Ordering::Relaxed) {
                break;
            }
            if self.generation.load(Ordering::Relaxed) != gen {
                break;
            }
            fence(Ordering::SeqCst);
            std::hint::spin_loop();
        }
    }

    /// Currently armed target tid, [`NO_TARGET`] when idle.
    pub fn target_tid(&self) -> i32 {
        self.target_tid.load(Ordering::SeqCst)
    }
}

impl Default for HandshakeSlot {
    fn default() -> Self {
        Self::new()
    }
}
