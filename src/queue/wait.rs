//! Idle policies and exit predicates for the uncapped queue loops.
//!
//! The uncapped drain/fill loops in [`crate::queue`] alternate between
//! relaxed queue operations and an idle step. The idle step is pluggable:
//! a [`WaitStrategy`] decides how to burn time between empty (or full)
//! observations, and an [`ExitCondition`] decides when the loop stops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How many consecutive idle rounds to spin before yielding.
const SPIN_LIMIT: u32 = 64;

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Idle policy invoked between unproductive loop rounds.
///
/// The loop hands in the number of consecutive unproductive rounds so far
/// and stores whatever `idle` returns as the next counter; a productive
/// round resets the counter to zero.
pub trait WaitStrategy {
    /// Burns time appropriate for `idle_counter` consecutive idle rounds
    /// and returns the counter to carry into the next round.
    fn idle(&self, idle_counter: u32) -> u32;
}

/// Pure busy-spin: a `spin_loop` hint every round, no syscalls ever.
///
/// Lowest latency, highest CPU burn. Appropriate when the opposite side
/// is known to be running on another core.
#[derive(Debug, Default, Clone, Copy)]
pub struct BusySpin;

impl WaitStrategy for BusySpin {
    #[inline]
    fn idle(&self, idle_counter: u32) -> u32 {
        std::hint::spin_loop();
        idle_counter.saturating_add(1)
    }
}

/// Spin a bounded number of rounds, then start yielding the thread.
#[derive(Debug, Clone, Copy)]
pub struct SpinThenYield {
    spin_limit: u32,
}

impl SpinThenYield {
    /// Creates a strategy that spins for `spin_limit` rounds before it
    /// starts yielding.
    #[must_use]
    pub const fn new(spin_limit: u32) -> Self {
        Self { spin_limit }
    }
}

impl Default for SpinThenYield {
    fn default() -> Self {
        Self::new(SPIN_LIMIT)
    }
}

impl WaitStrategy for SpinThenYield {
    #[inline]
    fn idle(&self, idle_counter: u32) -> u32 {
        if idle_counter < self.spin_limit {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
        idle_counter.saturating_add(1)
    }
}

/// Predicate polled once per round by the uncapped loops.
///
/// When it returns `false` the loop returns promptly, without waiting for
/// the queue to become empty or full.
pub trait ExitCondition {
    /// Returns `true` while the loop should keep running.
    fn keep_running(&self) -> bool;
}

impl<F: Fn() -> bool> ExitCondition for F {
    #[inline]
    fn keep_running(&self) -> bool {
        self()
    }
}

impl ExitCondition for AtomicBool {
    #[inline]
    fn keep_running(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_spin_advances_counter() {
        let wait = BusySpin;
        assert_eq!(wait.idle(0), 1);
        assert_eq!(wait.idle(41), 42);
    }

    #[test]
    fn spin_then_yield_advances_counter() {
        let wait = SpinThenYield::new(2);
        let mut counter = 0;
        for expected in 1..=5 {
            counter = wait.idle(counter);
            assert_eq!(counter, expected);
        }
    }

    #[test]
    fn counter_saturates() {
        let wait = BusySpin;
        assert_eq!(wait.idle(u32::MAX), u32::MAX);
    }

    #[test]
    fn closure_exit_condition() {
        let exit = || false;
        assert!(!exit.keep_running());
    }

    #[test]
    fn atomic_exit_condition() {
        let running = AtomicBool::new(true);
        assert!(running.keep_running());
        running.store(false, Ordering::Release);
        assert!(!running.keep_running());
    }
}
