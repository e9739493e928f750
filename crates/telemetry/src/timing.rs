//! Per-invocation step timing.
//!
//! A [`TimingCollector`] is owned by whoever starts a sampling loop and is
//! passed into it by reference, so concurrent loops never share counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Timing of one loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTiming {
    pub step_number: usize,
    pub started_at: DateTime<Utc>,
    /// Wall time of the whole step, set when it finishes.
    pub total_duration_ms: Option<f64>,
    /// Time spent waiting on the model.
    pub anthropic_call_ms: Option<f64>,
    /// Time spent converting the response into history.
    pub anthropic_response_ms: Option<f64>,
    /// Sum of all tool invocations in the step.
    pub tool_execution_ms: Option<f64>,
    #[serde(default)]
    pub tool_calls: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongestStep {
    pub step_number: usize,
    pub duration_ms: f64,
}

/// Aggregates over a set of finished steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingStatistics {
    pub total_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_step_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_step_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_step_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longest_step: Option<LongestStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_anthropic_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_tool_ms: Option<f64>,
}

impl TimingStatistics {
    pub fn from_steps<'a>(steps: impl IntoIterator<Item = &'a StepTiming>) -> Self {
        let steps: Vec<&StepTiming> = steps.into_iter().collect();
        let mut stats = Self {
            total_steps: steps.len(),
            ..Self::default()
        };

        let finished: Vec<(usize, f64)> = steps
            .iter()
            .filter_map(|s| s.total_duration_ms.map(|d| (s.step_number, d)))
            .collect();
        if finished.is_empty() {
            return stats;
        }

        let total: f64 = finished.iter().map(|(_, d)| d).sum();
        stats.total_ms = Some(total);
        stats.average_step_ms = Some(total / finished.len() as f64);
        stats.min_step_ms = finished.iter().map(|(_, d)| *d).reduce(f64::min);
        stats.max_step_ms = finished.iter().map(|(_, d)| *d).reduce(f64::max);
        stats.longest_step = finished
            .iter()
            .copied()
            .reduce(|a, b| if b.1 > a.1 { b } else { a })
            .map(|(step_number, duration_ms)| LongestStep {
                step_number,
                duration_ms,
            });

        let mean = |values: Vec<f64>| {
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
        };
        stats.avg_anthropic_ms = mean(steps.iter().filter_map(|s| s.anthropic_call_ms).collect());
        stats.avg_tool_ms = mean(steps.iter().filter_map(|s| s.tool_execution_ms).collect());
        stats
    }
}

#[derive(Debug, Default)]
struct CollectorState {
    current: Option<(StepTiming, Instant)>,
    history: Vec<StepTiming>,
}

/// Collects step timings for one loop invocation.
#[derive(Debug, Default)]
pub struct TimingCollector {
    state: Mutex<CollectorState>,
}

impl TimingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut CollectorState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Begin step `step_number`, closing any step still open.
    pub fn start_step(&self, step_number: usize) {
        self.with_state(|state| {
            if let Some((mut open, started)) = state.current.take() {
                open.total_duration_ms = Some(ms(started.elapsed()));
                state.history.push(open);
            }
            state.current = Some((
                StepTiming {
                    step_number,
                    started_at: Utc::now(),
                    total_duration_ms: None,
                    anthropic_call_ms: None,
                    anthropic_response_ms: None,
                    tool_execution_ms: None,
                    tool_calls: Vec::new(),
                    error: None,
                },
                Instant::now(),
            ));
        });
    }

    pub fn record_anthropic_call(&self, duration: Duration) {
        self.with_state(|state| {
            if let Some((step, _)) = state.current.as_mut() {
                step.anthropic_call_ms = Some(ms(duration));
            }
        });
    }

    pub fn record_anthropic_response(&self, duration: Duration) {
        self.with_state(|state| {
            if let Some((step, _)) = state.current.as_mut() {
                step.anthropic_response_ms = Some(ms(duration));
            }
        });
    }

    pub fn record_tool(&self, tool_name: &str, duration: Duration) {
        debug!(tool = tool_name, duration_ms = ms(duration), "Tool timing");
        self.with_state(|state| {
            if let Some((step, _)) = state.current.as_mut() {
                step.tool_execution_ms = Some(step.tool_execution_ms.unwrap_or(0.0) + ms(duration));
                step.tool_calls.push(tool_name.to_string());
            }
        });
    }

    /// Close the open step; returns it, or `None` if no step was open.
    pub fn finish_step(&self, error: Option<String>) -> Option<StepTiming> {
        self.with_state(|state| {
            let (mut step, started) = state.current.take()?;
            step.total_duration_ms = Some(ms(started.elapsed()));
            step.error = error;
            debug!(
                step = step.step_number,
                duration_ms = step.total_duration_ms,
                "Step finished"
            );
            state.history.push(step.clone());
            Some(step)
        })
    }

    /// Finished steps, oldest first.
    pub fn steps(&self) -> Vec<StepTiming> {
        self.with_state(|state| state.history.clone())
    }

    pub fn statistics(&self) -> TimingStatistics {
        self.with_state(|state| TimingStatistics::from_steps(&state.history))
    }

    /// Statistics plus the step list, as stored on a completed task.
    pub fn report(&self) -> TimingReport {
        self.with_state(|state| TimingReport {
            statistics: TimingStatistics::from_steps(&state.history),
            steps: state.history.clone(),
        })
    }
}

/// A serializable snapshot of a collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingReport {
    pub statistics: TimingStatistics,
    pub steps: Vec<StepTiming>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(n: usize, total: f64, call: Option<f64>) -> StepTiming {
        StepTiming {
            step_number: n,
            started_at: Utc::now(),
            total_duration_ms: Some(total),
            anthropic_call_ms: call,
            anthropic_response_ms: None,
            tool_execution_ms: None,
            tool_calls: vec![],
            error: None,
        }
    }

    #[test]
    fn statistics_over_steps() {
        let steps = vec![step(1, 100.0, Some(80.0)), step(2, 300.0, Some(40.0)), step(3, 200.0, None)];
        let stats = TimingStatistics::from_steps(&steps);
        assert_eq!(stats.total_steps, 3);
        assert_eq!(stats.total_ms, Some(600.0));
        assert_eq!(stats.average_step_ms, Some(200.0));
        assert_eq!(stats.min_step_ms, Some(100.0));
        assert_eq!(stats.max_step_ms, Some(300.0));
        assert_eq!(stats.longest_step.unwrap().step_number, 2);
        assert_eq!(stats.avg_anthropic_ms, Some(60.0));
        assert!(stats.avg_tool_ms.is_none());
    }

    #[test]
    fn empty_statistics() {
        let stats = TimingStatistics::from_steps(&[]);
        assert_eq!(stats.total_steps, 0);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json, serde_json::json!({"total_steps": 0}));
    }

    #[test]
    fn collector_records_step_phases() {
        let collector = TimingCollector::new();
        collector.start_step(1);
        collector.record_anthropic_call(Duration::from_millis(120));
        collector.record_tool("computer", Duration::from_millis(10));
        collector.record_tool("bash", Duration::from_millis(5));
        let finished = collector.finish_step(None).unwrap();

        assert_eq!(finished.step_number, 1);
        assert_eq!(finished.anthropic_call_ms, Some(120.0));
        assert_eq!(finished.tool_execution_ms, Some(15.0));
        assert_eq!(finished.tool_calls, vec!["computer", "bash"]);
        assert!(finished.total_duration_ms.is_some());
        assert!(collector.finish_step(None).is_none());
    }

    #[test]
    fn starting_a_step_closes_the_open_one() {
        let collector = TimingCollector::new();
        collector.start_step(1);
        collector.start_step(2);
        collector.finish_step(Some("boom".into()));

        let steps = collector.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].error.as_deref(), Some("boom"));
        assert_eq!(collector.report().statistics.total_steps, 2);
    }
}
