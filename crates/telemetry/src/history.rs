//! Bounded history of finished loop timings, served by the gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::RwLock;

use crate::timing::{StepTiming, TimingReport, TimingStatistics};

/// One finished loop invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingRun {
    /// What ran: a session id, a task id, or a request label.
    pub label: String,
    pub finished_at: DateTime<Utc>,
    pub report: TimingReport,
}

/// Keeps the most recent `capacity` runs.
pub struct TimingHistory {
    capacity: usize,
    runs: RwLock<VecDeque<TimingRun>>,
}

impl TimingHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            runs: RwLock::new(VecDeque::new()),
        }
    }

    pub fn record(&self, label: impl Into<String>, report: TimingReport) {
        let mut runs = self.runs.write().unwrap_or_else(|e| e.into_inner());
        if runs.len() == self.capacity {
            runs.pop_front();
        }
        runs.push_back(TimingRun {
            label: label.into(),
            finished_at: Utc::now(),
            report,
        });
    }

    /// Runs, oldest first.
    pub fn runs(&self) -> Vec<TimingRun> {
        self.runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Statistics over every step of every retained run.
    pub fn statistics(&self) -> TimingStatistics {
        let runs = self.runs.read().unwrap_or_else(|e| e.into_inner());
        let steps: Vec<&StepTiming> = runs.iter().flat_map(|r| r.report.steps.iter()).collect();
        TimingStatistics::from_steps(steps)
    }

    pub fn reset(&self) {
        self.runs.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.runs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimingHistory {
    fn default() -> Self {
        Self::new(50)
    }
}
