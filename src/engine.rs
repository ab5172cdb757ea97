//! Common engine seam: arguments, resolved configuration, lifecycle trait
//!
//! A sampling engine is started with [`SamplerArgs`], which are resolved
//! into a [`SamplerConfig`] before any state is touched. The [`Engine`]
//! trait is the lifecycle surface an embedder drives: validate, start,
//! stop, and pause/resume via `set_enabled`.

use crate::error::EngineError;

/// Default per-thread sampling interval: 10 ms.
pub const DEFAULT_INTERVAL_NS: i64 = 10_000_000;

/// Event name selecting wall-clock (off-CPU inclusive) profiling.
pub const EVENT_WALL: &str = "wall";

/// Event name selecting CPU profiling (only OS-running threads sampled).
pub const EVENT_CPU: &str = "cpu";

/// Arguments handed to [`Engine::start`].
///
/// `wall_interval` uses the convention that a negative value means "not
/// set"; a non-negative value both supplies the interval and switches the
/// engine into idle sampling.
#[derive(Debug, Clone)]
pub struct SamplerArgs {
    /// Wall-clock interval in nanoseconds, or negative when unset.
    pub wall_interval: i64,
    /// Fallback interval in nanoseconds when `wall_interval` is unset.
    pub default_interval: i64,
    /// Event name, one of [`EVENT_WALL`] or [`EVENT_CPU`].
    pub event: String,
}

impl Default for SamplerArgs {
    fn default() -> Self {
        Self {
            wall_interval: -1,
            default_interval: 0,
            event: EVENT_WALL.to_string(),
        }
    }
}

impl SamplerArgs {
    /// Wall-clock sampling at the given interval.
    pub fn wall(interval_ns: i64) -> Self {
        Self {
            wall_interval: interval_ns,
            default_interval: 0,
            event: EVENT_WALL.to_string(),
        }
    }

    /// CPU sampling at the given interval: only OS-running threads are
    /// sampled and thread state is recorded as unknown.
    pub fn cpu(interval_ns: i64) -> Self {
        Self {
            wall_interval: -1,
            default_interval: interval_ns,
            event: EVENT_CPU.to_string(),
        }
    }
}

/// Resolved, immutable sampling configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerConfig {
    /// Target nanoseconds between per-thread samples.
    pub interval_ns: i64,
    /// When true, threads are sampled regardless of OS-reported state and
    /// classified by the thread-state classifier; when false, only running
    /// threads are sampled and state is recorded as unknown.
    pub sample_idle: bool,
}

impl SamplerConfig {
    /// Resolve raw arguments into a configuration.
    ///
    /// The wall interval wins when set (non-negative); otherwise the
    /// default interval applies. A resolved interval of zero falls back to
    /// [`DEFAULT_INTERVAL_NS`], multiplied by five in idle-sampling mode
    /// because far more threads are sampled per cycle.
    pub fn resolve(args: &SamplerArgs) -> Result<Self, EngineError> {
        if args.event != EVENT_WALL && args.event != EVENT_CPU {
            return Err(EngineError::Config(format!(
                "unknown event '{}' (expected '{}' or '{}')",
                args.event, EVENT_WALL, EVENT_CPU
            )));
        }

        let sample_idle = args.wall_interval >= 0 || args.event == EVENT_WALL;

        let mut interval_ns = if args.wall_interval >= 0 {
            args.wall_interval
        } else {
            args.default_interval
        };
        if interval_ns < 0 {
            return Err(EngineError::Config(format!(
                "interval must be non-negative, got {interval_ns}"
            )));
        }
        if interval_ns == 0 {
            interval_ns = if sample_idle {
                DEFAULT_INTERVAL_NS * 5
            } else {
                DEFAULT_INTERVAL_NS
            };
        }

        Ok(Self {
            interval_ns,
            sample_idle,
        })
    }
}

/// Lifecycle surface of a sampling engine.
pub trait Engine: Send + Sync {
    /// Validate arguments without mutating any state.
    fn check(&self, args: &SamplerArgs) -> Result<(), EngineError> {
        SamplerConfig::resolve(args).map(|_| ())
    }

    /// Resolve configuration, install signal dispositions and spawn the
    /// timer thread. Fails without side effects on invalid arguments or if
    /// the thread cannot be created.
    fn start(&self, args: &SamplerArgs) -> Result<(), EngineError>;

    /// Stop the timer thread and join it. A no-op when not running.
    fn stop(&self);

    /// Pause or resume sampling without tearing down the timer thread.
    fn set_enabled(&self, enabled: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_interval_wins_and_enables_idle_sampling() {
        let config = SamplerConfig::resolve(&SamplerArgs {
            wall_interval: 5_000_000,
            default_interval: 1_000_000,
            event: EVENT_CPU.to_string(),
        })
        .unwrap();
        assert_eq!(config.interval_ns, 5_000_000);
        assert!(config.sample_idle);
    }

    #[test]
    fn test_wall_event_enables_idle_sampling_without_wall_interval() {
        let config = SamplerConfig::resolve(&SamplerArgs {
            wall_interval: -1,
            default_interval: 2_000_000,
            event: EVENT_WALL.to_string(),
        })
        .unwrap();
        assert_eq!(config.interval_ns, 2_000_000);
        assert!(config.sample_idle);
    }

    #[test]
    fn test_cpu_event_without_wall_is_not_idle_sampling() {
        let config = SamplerConfig::resolve(&SamplerArgs::cpu(1_000_000)).unwrap();
        assert_eq!(config.interval_ns, 1_000_000);
        assert!(!config.sample_idle);
    }

    #[test]
    fn test_zero_interval_defaults_scaled_for_idle_sampling() {
        let config = SamplerConfig::resolve(&SamplerArgs::wall(0)).unwrap();
        assert_eq!(config.interval_ns, DEFAULT_INTERVAL_NS * 5);

        let config = SamplerConfig::resolve(&SamplerArgs::cpu(0)).unwrap();
        assert_eq!(config.interval_ns, DEFAULT_INTERVAL_NS);
    }

    #[test]
    fn test_negative_default_interval_rejected() {
        let result = SamplerConfig::resolve(&SamplerArgs {
            wall_interval: -1,
            default_interval: -5,
            event: EVENT_CPU.to_string(),
        });
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_unknown_event_rejected() {
        let result = SamplerConfig::resolve(&SamplerArgs {
            wall_interval: -1,
            default_interval: 0,
            event: "alloc".to_string(),
        });
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_wall_zero_means_idle_sampling() {
        // A wall interval of exactly zero still counts as "set".
        let config = SamplerConfig::resolve(&SamplerArgs {
            wall_interval: 0,
            default_interval: 0,
            event: EVENT_CPU.to_string(),
        })
        .unwrap();
        assert!(config.sample_idle);
    }
}
