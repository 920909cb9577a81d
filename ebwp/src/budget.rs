//! Self-imposed yield checks
//!
//! Long operations never run past the budget handed in by the caller. They ask
//! [`Budget::exhausted`] at their own safe points and return a resumption token
//! when the answer is yes.

use std::time::{Duration, Instant};

pub trait Budget {
    /// Records one unit of work and reports whether the caller should pause.
    fn exhausted(&mut self) -> bool;
}

/// Never asks for a pause.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl Budget for Unlimited {
    fn exhausted(&mut self) -> bool {
        false
    }
}

/// Wall clock budget, measured from construction.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn new(limit: Duration) -> Self {
        Deadline {
            started: Instant::now(),
            limit,
        }
    }

    pub fn from_secs(secs: u64) -> Self {
        Deadline::new(Duration::from_secs(secs))
    }
}

impl Budget for Deadline {
    fn exhausted(&mut self) -> bool {
        self.started.elapsed() >= self.limit
    }
}

/// Pauses after a fixed number of checks. Deterministic, so used to exercise
/// pause and resume paths.
#[derive(Debug, Clone, Copy)]
pub struct StepBudget {
    remaining: usize,
}

impl StepBudget {
    pub fn new(steps: usize) -> Self {
        StepBudget { remaining: steps }
    }
}

impl Budget for StepBudget {
    fn exhausted(&mut self) -> bool {
        if self.remaining == 0 {
            return true;
        }
        self.remaining -= 1;
        self.remaining == 0
    }
}
