//! Completion tracking, milestones, and ETA.

use std::collections::VecDeque;

const ROLLING_WINDOW: usize = 50;
const MILESTONE_PCT: f64 = 10.0;

/// Counts completions against an optional task total, detects 10% milestone
/// crossings, and estimates time remaining from a rolling average of recent
/// durations.
pub struct ProgressTracker {
    total_tasks: usize,
    completed: usize,
    durations: VecDeque<f64>,
    last_milestone: u32,
}

impl ProgressTracker {
    pub fn new(total_tasks: usize) -> Self {
        Self {
            total_tasks,
            completed: 0,
            durations: VecDeque::with_capacity(ROLLING_WINDOW),
            last_milestone: 0,
        }
    }

    /// Record a completion. Returns true iff this completion crossed a 10%
    /// milestone that has not been reported yet.
    pub fn record_completion(&mut self, duration_secs: f64) -> bool {
        self.completed += 1;
        if self.durations.len() == ROLLING_WINDOW {
            self.durations.pop_front();
        }
        self.durations.push_back(duration_secs);

        if self.total_tasks == 0 {
            return false;
        }
        let milestone = (self.percentage() / MILESTONE_PCT) as u32;
        if milestone > self.last_milestone {
            self.last_milestone = milestone;
            true
        } else {
            false
        }
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Percent complete, clamped to 100. Zero when no total is configured.
    pub fn percentage(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        ((self.completed as f64 / self.total_tasks as f64) * 100.0).min(100.0)
    }

    /// Estimated seconds remaining, assuming `effective_concurrency` tasks
    /// proceed in parallel at the recent average duration. `None` when no
    /// total is configured or nothing has completed yet.
    pub fn eta_seconds(&self, effective_concurrency: usize) -> Option<f64> {
        if self.total_tasks == 0 || self.durations.is_empty() {
            return None;
        }
        let remaining = self.total_tasks.saturating_sub(self.completed);
        if remaining == 0 {
            return Some(0.0);
        }
        let avg = self.durations.iter().sum::<f64>() / self.durations.len() as f64;
        Some(avg * remaining as f64 / effective_concurrency.max(1) as f64)
    }
}
