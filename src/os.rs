//! OS facade: clocks, thread enumeration, signal delivery
//!
//! The engine talks to the operating system exclusively through the [`Os`]
//! trait so scenario tests can substitute a fake with a virtual clock. The
//! production implementation, [`LinuxOs`], is a thin layer over nix and
//! libc plus `/proc` text interfaces.

use std::fs;
use std::io;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::EngineError;

/// OS-reported scheduler state of a thread, from the state field of
/// `/proc/<pid>/task/<tid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsThreadState {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    Zombie,
    Dead,
    Unknown,
}

/// Cursor over the tids of this process, preserved across iterations so
/// every thread gets an equal long-run share of the per-tick sampling cap.
pub trait ThreadList: Send {
    /// Next tid, or `None` when the cursor is exhausted.
    fn next(&mut self) -> Option<i32>;
    /// Reset the cursor, refreshing the underlying enumeration.
    fn rewind(&mut self);
    /// Number of threads in the current enumeration.
    fn size(&self) -> usize;
}

/// Operating-system services consumed by the timer loop.
pub trait Os: Send + Sync + 'static {
    /// Monotonic nanoseconds.
    fn now_ns(&self) -> i64;

    /// Sleep for up to `ns` nanoseconds. Must be interruptible: a signal
    /// directed at the sleeping thread cuts the sleep short.
    fn sleep_ns(&self, ns: i64);

    /// OS tid of the calling thread.
    fn thread_id(&self) -> i32;

    /// Enumerate the threads of this process.
    fn list_threads(&self) -> Box<dyn ThreadList>;

    /// Scheduler state of `tid`; `Dead` when the thread is gone.
    fn thread_state(&self, tid: i32) -> OsThreadState;

    /// Deliver `signo` to `tid`. Returns false when the thread no longer
    /// exists.
    fn send_signal(&self, tid: i32, signo: i32) -> bool;

    /// Install the sampling and wakeup signal dispositions.
    fn install_signal_handlers(&self) -> Result<(), EngineError>;
}

/// Production implementation over nix, libc and `/proc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxOs;

impl Os for LinuxOs {
    fn now_ns(&self) -> i64 {
        // clock_gettime(2) can fail only for an unknown clock id or a bad
        // timespec pointer, and CLOCK_MONOTONIC with a stack timespec is
        // neither. Should the unreachable happen anyway, a zero reading
        // degrades the cadence math to the MIN_INTERVAL floor instead of
        // killing the timer thread.
        nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
            .map(|ts| ts.tv_sec() * 1_000_000_000 + ts.tv_nsec())
            .unwrap_or_default()
    }

    fn sleep_ns(&self, ns: i64) {
        if ns <= 0 {
            return;
        }
        let request = libc::timespec {
            tv_sec: (ns / 1_000_000_000) as libc::time_t,
            tv_nsec: (ns % 1_000_000_000) as libc::c_long,
        };
        // One shot, no EINTR retry: the wakeup signal is how `stop` cuts a
        // long sleep short.
        unsafe {
            libc::nanosleep(&request, std::ptr::null_mut());
        }
    }

    fn thread_id(&self) -> i32 {
        current_tid()
    }

    fn list_threads(&self) -> Box<dyn ThreadList> {
        Box::new(ProcThreadList::new())
    }

    fn thread_state(&self, tid: i32) -> OsThreadState {
        match fs::read_to_string(format!("/proc/self/task/{tid}/stat")) {
            Ok(stat) => parse_stat_state(&stat),
            Err(_) => OsThreadState::Dead,
        }
    }

    fn send_signal(&self, tid: i32, signo: i32) -> bool {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                libc::getpid() as libc::c_long,
                tid as libc::c_long,
                signo as libc::c_long,
            )
        };
        ret == 0
    }

    fn install_signal_handlers(&self) -> Result<(), EngineError> {
        // SA_RESTART keeps the sampling signal from surfacing EINTR to the
        // application's own blocking calls.
        let sample = SigAction::new(
            SigHandler::SigAction(crate::wall_clock::sample_signal_handler),
            SaFlags::SA_RESTART | SaFlags::SA_SIGINFO,
            SigSet::empty(),
        );
        unsafe { signal::sigaction(Signal::SIGVTALRM, &sample) }
            .map_err(EngineError::SignalHandler)?;

        // The wakeup handler must NOT restart syscalls: its whole purpose
        // is to break the timer thread out of nanosleep.
        let wakeup = SigAction::new(
            SigHandler::Handler(crate::wall_clock::wakeup_signal_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { signal::sigaction(Signal::SIGPROF, &wakeup) }
            .map_err(EngineError::SignalHandler)?;

        Ok(())
    }
}

/// Raw gettid. Bypasses nix so the sampling signal handler can share it:
/// a direct syscall is async-signal-safe.
pub fn current_tid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Thread list backed by `/proc/self/task`. `rewind` rescans the
/// directory, picking up threads spawned since the last pass.
pub struct ProcThreadList {
    tids: Vec<i32>,
    cursor: usize,
}

impl ProcThreadList {
    pub fn new() -> Self {
        Self {
            tids: scan_task_dir().unwrap_or_default(),
            cursor: 0,
        }
    }
}

impl Default for ProcThreadList {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadList for ProcThreadList {
    fn next(&mut self) -> Option<i32> {
        let tid = self.tids.get(self.cursor).copied();
        if tid.is_some() {
            self.cursor += 1;
        }
        tid
    }

    fn rewind(&mut self) {
        self.tids = scan_task_dir().unwrap_or_default();
        self.cursor = 0;
    }

    fn size(&self) -> usize {
        self.tids.len()
    }
}

fn scan_task_dir() -> io::Result<Vec<i32>> {
    let mut tids = Vec::new();
    for entry in fs::read_dir("/proc/self/task")? {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

/// Parse the single-character state field out of a `/proc/.../stat` line.
///
/// The comm field is parenthesized and may itself contain spaces or
/// parentheses, so the state is located after the *last* closing paren.
pub fn parse_stat_state(stat: &str) -> OsThreadState {
    let state = stat
        .rfind(')')
        .and_then(|idx| stat[idx + 1..].split_whitespace().next())
        .and_then(|field| field.chars().next());
    match state {
        Some('R') => OsThreadState::Running,
        Some('S') => OsThreadState::Sleeping,
        Some('D') => OsThreadState::DiskSleep,
        Some('T') | Some('t') => OsThreadState::Stopped,
        Some('Z') => OsThreadState::Zombie,
        Some('X') | Some('x') => OsThreadState::Dead,
        _ => OsThreadState::Unknown,
    }
}
