// src/core/deadline.rs
use std::time::Duration;
use tokio::time::Instant;

/// A wall-clock budget shared by the stages of one run
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    /// Start a new deadline now
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.budget
    }

    /// The instant at which the budget runs out
    pub fn at(&self) -> Instant {
        self.started + self.budget
    }

    /// A sub-deadline starting now, never outliving this one
    pub fn child(&self, budget: Duration) -> Deadline {
        Deadline {
            started: Instant::now(),
            budget: budget.min(self.remaining()),
        }
    }

    /// Clamp a tool timeout to the time left
    pub fn cap(&self, timeout: Duration) -> Duration {
        timeout.min(self.remaining())
    }

    /// Resolves once the budget is spent
    pub async fn expired(&self) {
        tokio::time::sleep_until(self.at()).await;
    }
}
