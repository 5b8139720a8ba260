//! Exponential backoff for contended CAS loops.

use core::hint;

/// How hard a queue backs off after losing a CAS on `head` or `tail.next`.
///
/// For the first `spin_limit` steps a loser spins `2^step` times. After that
/// it yields to the scheduler, and the step stops growing at `yield_limit`.
/// The values only affect throughput under contention, never the result of
/// an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Last step that spins instead of yielding.
    pub spin_limit: u32,
    /// Step at which backoff stops growing.
    pub yield_limit: u32,
}

impl BackoffConfig {
    /// The default configuration: spin up to `2^6` times, then yield.
    pub const DEFAULT: Self = Self::new(6, 10);

    /// Creates a configuration. `yield_limit` is raised to `spin_limit` if it
    /// is smaller.
    pub const fn new(spin_limit: u32, yield_limit: u32) -> Self {
        let yield_limit = if yield_limit < spin_limit {
            spin_limit
        } else {
            yield_limit
        };
        Self {
            spin_limit,
            yield_limit,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Backoff state for one operation.
pub(crate) struct Backoff {
    config: BackoffConfig,
    step: u32,
}

impl Backoff {
    #[inline]
    pub(crate) fn new(config: BackoffConfig) -> Self {
        Self { config, step: 0 }
    }

    /// Waits after a lost CAS.
    #[inline]
    pub(crate) fn spin(&mut self) {
        if self.step <= self.config.spin_limit {
            for _ in 0..1u32 << self.step.min(31) {
                hint::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }
        if self.step < self.config.yield_limit {
            self.step += 1;
        }
    }

    #[cfg(test)]
    fn step(&self) -> u32 {
        self.step
    }
}
