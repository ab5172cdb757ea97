//! Register access for an interrupted thread's machine context
//!
//! A [`StackFrame`] wraps the `ucontext_t` delivered to a signal handler
//! and exposes the few registers the sampler cares about: the program
//! counter and the syscall return register. The syscall instruction
//! pattern and the EINTR convention are the architecture-specific pieces.

use std::ffi::c_void;

/// Byte length of the architecture's syscall instruction.
#[cfg(target_arch = "x86_64")]
pub const SYSCALL_SIZE: u64 = 2;
#[cfg(target_arch = "aarch64")]
pub const SYSCALL_SIZE: u64 = 4;

/// View over an interrupted thread's captured machine context.
#[derive(Debug, Clone, Copy)]
pub struct StackFrame {
    ucontext: *const libc::ucontext_t,
}

impl StackFrame {
    /// Wrap the opaque context delivered to a signal handler.
    ///
    /// # Safety
    ///
    /// `ucontext` must point to a live `ucontext_t` and remain valid for
    /// the lifetime of the frame. The sampler guarantees this by keeping
    /// the interrupted thread parked until classification is done.
    pub unsafe fn from_ucontext(ucontext: *mut c_void) -> Self {
        Self {
            ucontext: ucontext as *const libc::ucontext_t,
        }
    }

    /// Interrupted program counter.
    #[cfg(target_arch = "x86_64")]
    pub fn pc(&self) -> u64 {
        unsafe { (*self.ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] as u64 }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn pc(&self) -> u64 {
        unsafe { (*self.ucontext).uc_mcontext.pc }
    }

    /// Value of the syscall return register at interruption.
    #[cfg(target_arch = "x86_64")]
    pub fn return_value(&self) -> u64 {
        unsafe { (*self.ucontext).uc_mcontext.gregs[libc::REG_RAX as usize] as u64 }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn return_value(&self) -> u64 {
        unsafe { (*self.ucontext).uc_mcontext.regs[0] }
    }

    /// Whether the return-register state is consistent with a syscall that
    /// the kernel just interrupted: it returned EINTR.
    pub fn check_interrupted_syscall(&self) -> bool {
        self.return_value() == (-libc::EINTR as i64) as u64
    }

    /// Whether the bytes at `addr` encode the syscall instruction.
    ///
    /// # Safety
    ///
    /// `addr` must be readable for [`SYSCALL_SIZE`] bytes. Callers gate
    /// this with the page-offset test or the library oracle.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn is_syscall(addr: u64) -> bool {
        // syscall = 0f 05
        let bytes = addr as *const u8;
        bytes.read_volatile() == 0x0f && bytes.add(1).read_volatile() == 0x05
    }

    #[cfg(target_arch = "aarch64")]
    pub unsafe fn is_syscall(addr: u64) -> bool {
        // svc #0 = d4000001, little-endian in memory
        (addr as *const u32).read_volatile() == 0xd400_0001
    }
}
