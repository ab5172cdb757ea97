//! Reloj - wall-clock sampling profiler engine
//!
//! This library implements periodic execution sampling for all threads of
//! the current process. A dedicated timer thread signals one target at a
//! time; the target's signal handler publishes its interrupted machine
//! context through a lock-free handshake and stays parked while the driver
//! classifies the thread (running, or blocked inside a syscall) and hands
//! the sample to a pluggable recorder.

pub mod cli;
pub mod engine;
pub mod error;
pub mod filter;
pub mod handshake;
pub mod library;
pub mod os;
pub mod recorder;
pub mod ring_buffer;
pub mod runtime;
pub mod stack_frame;
pub mod thread_state;
pub mod wall_clock;
