//! Absolute request deadlines.
//!
//! A request captures its deadline once, when it is created. Every retry and
//! every wait measures against that same instant, so attach races can shorten
//! the remaining wait but never extend the caller's total budget.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    start: Instant,
    /// `None` waits forever.
    at: Option<Instant>,
    budget: Option<Duration>,
}

impl Deadline {
    /// Deadline `timeout` from now; `None` never expires. A timeout too large
    /// to represent as an `Instant` is treated as no timeout.
    pub fn after(timeout: Option<Duration>) -> Self {
        let start = Instant::now();
        let at = timeout.and_then(|timeout| start.checked_add(timeout));
        Self { start, at, budget: at.and(timeout) }
    }

    pub fn never() -> Self {
        Self::after(None)
    }

    /// Already-expired deadline for single non-blocking attempts.
    pub fn immediate() -> Self {
        Self::after(Some(Duration::ZERO))
    }

    /// Time left, `None` for an infinite deadline and zero once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// The configured timeout, or the time waited so far for infinite deadlines.
    pub fn budget(&self) -> Duration {
        self.budget.unwrap_or_else(|| self.start.elapsed())
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// The earlier of this deadline and `other`.
    pub fn min_instant(&self, other: Option<Instant>) -> Option<Instant> {
        match (self.at, other) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
