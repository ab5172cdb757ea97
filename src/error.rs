//! Error types for the sampling engine

use thiserror::Error;

/// Errors returned from engine lifecycle operations.
///
/// Per-sample failures (a target thread exiting between selection and
/// signal delivery, a handshake timing out) are deliberately *not* errors:
/// the sample is skipped, the iteration continues.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Arguments could not be resolved into a valid sampling configuration.
    /// No engine state is mutated.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// `start` was called while the timer thread is still running.
    #[error("sampler is already running")]
    AlreadyRunning,

    /// The timer thread could not be spawned.
    #[error("unable to create timer thread: {0}")]
    TimerThread(#[source] std::io::Error),

    /// Installing a signal disposition failed.
    #[error("unable to install signal handler: {0}")]
    SignalHandler(#[source] nix::Error),
}
