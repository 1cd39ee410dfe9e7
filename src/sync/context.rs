//! Deadline attached to every queued work item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Advisory deadline for a queued item.
///
/// Consumers are expected to check it before long processing; nothing in the
/// core cancels work once the deadline passes. Wall-clock based so that it
/// stays meaningful after crossing a process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub deadline: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(timeout: Duration) -> Self {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let deadline = Utc::now()
            .checked_add_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { deadline }
    }

    /// Time left before the deadline; zero once expired.
    pub fn remaining(&self) -> Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.deadline
    }
}
