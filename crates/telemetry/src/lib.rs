//! Step timing for Tilt sampling loops.
//!
//! Each loop invocation records into its own [`TimingCollector`]; finished
//! reports can be kept in a bounded [`TimingHistory`] for inspection.

pub mod history;
pub mod timing;

pub use history::{TimingHistory, TimingRun};
pub use timing::{LongestStep, StepTiming, TimingCollector, TimingReport, TimingStatistics};
