//! The computer-use sampling loop.
//!
//! One loop invocation alternates between the model and the tools:
//!
//! 1. Fold in any user interjections that arrived since the last step
//! 2. Trim old screenshots and mark cache breakpoints
//! 3. Send the history to the model
//! 4. Run every tool the reply asked for and append the results
//!
//! It stops when a reply asks for no tools. [`TaskRunner`] drives the loop
//! from the task queue; the gateway drives it per chat request.

pub mod browser;
pub mod context;
pub mod interjection;
pub mod prompt;
pub mod sampling_loop;
pub mod stream_event;
pub mod task_runner;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use context::{annotate_cache_breakpoints, prune_images};
pub use interjection::InterjectionPoller;
pub use prompt::{system_prompt, system_text};
pub use sampling_loop::{LoopConfig, SamplingLoop};
pub use stream_event::{EventObserver, StreamEvent};
pub use task_runner::{TaskOutcome, TaskRunner};
