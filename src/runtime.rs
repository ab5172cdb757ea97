//! Runtime-environment facade
//!
//! Threads the host runtime manages attach themselves here, which makes a
//! per-thread [`RuntimeEnv`] handle reachable from the sampling signal
//! handler. The accessor is a plain read of a const-initialized
//! thread-local pointer, so it is callable from signal context.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr;

/// Per-thread handle describing the thread to the sample recorder.
#[derive(Debug)]
pub struct RuntimeEnv {
    tid: i32,
    name: String,
}

impl RuntimeEnv {
    pub fn new(tid: i32, name: impl Into<String>) -> Self {
        Self {
            tid,
            name: name.into(),
        }
    }

    pub fn tid(&self) -> i32 {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

thread_local! {
    static CURRENT_ENV: Cell<*const RuntimeEnv> = const { Cell::new(ptr::null()) };
}

/// Attach the calling thread, making it visible to the sampler as a
/// runtime-managed thread. The returned guard must be dropped on the same
/// thread; dropping it detaches.
pub fn attach(name: impl Into<String>) -> ThreadRegistration {
    let env = Box::new(RuntimeEnv::new(crate::os::current_tid(), name));
    CURRENT_ENV.with(|cell| cell.set(&*env as *const RuntimeEnv));
    ThreadRegistration {
        env,
        _not_send: PhantomData,
    }
}

/// Runtime-environment handle of the calling thread, or null when the
/// thread never attached. Async-signal-safe: a single TLS pointer read.
pub fn current_env() -> *const RuntimeEnv {
    CURRENT_ENV.with(|cell| cell.get())
}

/// Guard owning a thread's attachment. The boxed env outlives every
/// handshake the thread participates in: a sampled thread is parked inside
/// its signal handler for the whole window in which the driver may read
/// the handle, so it cannot be here dropping the guard at the same time.
#[derive(Debug)]
pub struct ThreadRegistration {
    env: Box<RuntimeEnv>,
    _not_send: PhantomData<*const ()>,
}

impl ThreadRegistration {
    pub fn tid(&self) -> i32 {
        self.env.tid
    }

    pub fn env(&self) -> &RuntimeEnv {
        &self.env
    }
}

impl Drop for ThreadRegistration {
    fn drop(&mut self) {
        CURRENT_ENV.with(|cell| cell.set(ptr::null()));
    }
}
