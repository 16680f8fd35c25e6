//! Run progress reporting.
//!
//! Aggregates backlog counts into a snapshot and logs it whenever it changes,
//! so the log tells the story of the run without flooding on every message.

use std::time::{Duration, Instant};

use tracing::info;

use crate::backlog::{Backlog, BacklogStatus};

/// Aggregated backlog counts at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub waiting: usize,
    pub in_progress: usize,
    pub done: usize,
}

/// Logs backlog progress on change.
#[derive(Debug)]
pub struct ProgressReporter {
    last: Option<ProgressSnapshot>,
    started: Instant,
}

impl ProgressReporter {
    /// Creates a reporter; the run clock starts here.
    pub fn new() -> Self {
        Self {
            last: None,
            started: Instant::now(),
        }
    }

    /// Logs the current backlog state if it changed since the last call.
    pub fn observe(&mut self, backlog: &Backlog) {
        let (waiting, in_progress, done) = backlog.counts();
        let snapshot = ProgressSnapshot {
            waiting,
            in_progress,
            done,
        };

        if self.last == Some(snapshot) {
            return;
        }
        self.last = Some(snapshot);

        info!(
            waiting,
            in_progress, done, "entity type progress"
        );
        info!(
            in_progress = ?backlog.names_with_status(BacklogStatus::InProgress),
            waiting = ?backlog.names_with_status(BacklogStatus::Waiting),
            "backlog detail"
        );
    }

    /// Wall-clock time since the reporter was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}
