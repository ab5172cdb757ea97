//! Thread-state classification from an interrupted machine context
//!
//! Wall-clock profiles need to distinguish on-CPU time from time spent
//! blocked in a syscall. The kernel may deliver the sampling signal either
//! while the program counter still sits on the syscall instruction, or
//! just after the syscall returned with EINTR; both mean the thread was
//! off-CPU and must classify as sleeping.

use crate::handshake::CapturedContext;
use crate::library::LibraryMap;
use crate::stack_frame::{StackFrame, SYSCALL_SIZE};

/// Execution state attributed to a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadState {
    Running,
    Sleeping,
    /// Recorded when idle sampling is off and no classification runs.
    Unknown,
}

impl ThreadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadState::Running => "running",
            ThreadState::Sleeping => "sleeping",
            ThreadState::Unknown => "unknown",
        }
    }
}

/// Register view the classifier needs from an interrupted thread.
///
/// [`StackFrame`] is the production implementation; tests substitute fakes
/// because a real `ucontext_t` cannot be fabricated portably.
pub trait FrameInspector {
    fn pc(&self) -> u64;
    /// # Safety
    /// `addr` must be readable for [`SYSCALL_SIZE`] bytes.
    unsafe fn is_syscall(&self, addr: u64) -> bool;
    fn check_interrupted_syscall(&self) -> bool;
}

impl FrameInspector for StackFrame {
    fn pc(&self) -> u64 {
        StackFrame::pc(self)
    }

    unsafe fn is_syscall(&self, addr: u64) -> bool {
        StackFrame::is_syscall(addr)
    }

    fn check_interrupted_syscall(&self) -> bool {
        StackFrame::check_interrupted_syscall(self)
    }
}

/// Classifies a captured context into running/sleeping.
pub trait StateClassifier: Send + Sync {
    fn classify(&self, context: &CapturedContext) -> ThreadState;
}

/// Production classifier: inspects the syscall instruction around the
/// interrupted program counter.
pub struct SyscallStateClassifier {
    libraries: LibraryMap,
}

impl SyscallStateClassifier {
    pub fn new(libraries: LibraryMap) -> Self {
        Self { libraries }
    }
}

impl StateClassifier for SyscallStateClassifier {
    fn classify(&self, context: &CapturedContext) -> ThreadState {
        let frame = unsafe { StackFrame::from_ucontext(context.ucontext) };
        classify_frame(&frame, &self.libraries)
    }
}

/// Decide whether the interrupted thread was executing or blocked inside a
/// syscall.
///
/// Sleeping when the program counter sits on the syscall instruction, or
/// when the *previous* instruction is a syscall and the return register
/// carries EINTR. The previous-instruction byte read happens only when it
/// provably cannot fault: the counter is far enough into its page, or the
/// library oracle confirms the address is mapped.
pub fn classify_frame<F: FrameInspector>(frame: &F, libraries: &LibraryMap) -> ThreadState {
    let pc = frame.pc();

    if unsafe { frame.is_syscall(pc) } {
        return ThreadState::Sleeping;
    }

    let prev_pc = pc.wrapping_sub(SYSCALL_SIZE);
    if (pc & 0xfff) >= SYSCALL_SIZE || libraries.find_library(prev_pc).is_some() {
        if unsafe { frame.is_syscall(prev_pc) } && frame.check_interrupted_syscall() {
            return ThreadState::Sleeping;
        }
    }

    ThreadState::Running
}
