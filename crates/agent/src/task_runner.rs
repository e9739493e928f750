//! Background task runner: pulls pending tasks from the queue and runs the
//! sampling loop on each.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tilt_config::{AppConfig, BrowserConfig, RunnerConfig};
use tilt_core::error::{LoopError, StoreError};
use tilt_core::message::{ContentBlock, Message};
use tilt_core::observer::{ApiExchange, LoopObserver};
use tilt_core::provider::Provider;
use tilt_core::store::{CurrentTask, InterjectionStore, Store, Task, TaskStatus, TaskStore};
use tilt_core::tool::ToolResult;
use tilt_telemetry::{TimingCollector, TimingHistory};
use tilt_tools::{ToolContext, build_collection};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::interjection::InterjectionPoller;
use crate::sampling_loop::{LoopConfig, SamplingLoop};

/// What happened to one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: String,
    /// The status the task ended in, whoever set it.
    pub status: TaskStatus,
    pub error: Option<String>,
}

/// Logs loop events for unattended runs.
struct LogObserver {
    task_id: String,
}

impl LoopObserver for LogObserver {
    fn on_content(&self, block: &ContentBlock) {
        match block {
            ContentBlock::Text { text, .. } => debug!(task_id = %self.task_id, text = %text, "Assistant output"),
            ContentBlock::ToolUse { name, .. } => debug!(task_id = %self.task_id, tool = %name, "Tool requested"),
            _ => {}
        }
    }

    fn on_tool_result(&self, result: &ToolResult, tool_use_id: &str) {
        debug!(
            task_id = %self.task_id,
            tool_use_id = %tool_use_id,
            error = ?result.error,
            "Tool output"
        );
    }

    fn on_api_exchange(&self, exchange: &ApiExchange) {
        match &exchange.error {
            Some(e) => error!(task_id = %self.task_id, error = %e, "API response error"),
            None => debug!(task_id = %self.task_id, status = ?exchange.status, "API response successful"),
        }
    }
}

pub struct TaskRunner {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    current_task: CurrentTask,
    tool_context: ToolContext,
    loop_config: LoopConfig,
    runner: RunnerConfig,
    browser: Option<BrowserConfig>,
    history: Option<Arc<TimingHistory>>,
}

impl TaskRunner {
    pub fn new(config: &AppConfig, store: Arc<dyn Store>, provider: Arc<dyn Provider>) -> Self {
        let current_task = CurrentTask::new();
        let task_store: Arc<dyn TaskStore> = store.clone();
        Self {
            tool_context: ToolContext::new(config, task_store, current_task.clone()),
            store,
            provider,
            current_task,
            loop_config: LoopConfig::from_app(config),
            runner: config.runner.clone(),
            browser: Some(config.browser.clone()),
            history: None,
        }
    }

    /// Keep going after a task finishes instead of pausing for inspection.
    pub fn with_pause_after_completion(mut self, pause: bool) -> Self {
        self.runner.pause_after_completion = pause;
        self
    }

    /// Skip the browser readiness probe.
    pub fn without_browser(mut self) -> Self {
        self.browser = None;
        self
    }

    /// Also keep each task's timing report in `history`.
    pub fn with_timing_history(mut self, history: Arc<TimingHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn current_task(&self) -> &CurrentTask {
        &self.current_task
    }

    /// Process tasks until cancelled. With `pause_after_completion` set this
    /// returns after the first task.
    pub async fn run_continuous(&self, cancel: CancellationToken) {
        info!("Starting continuous task processing");
        let idle = Duration::from_secs(self.runner.idle_poll_secs);
        let backoff = Duration::from_secs(self.runner.error_backoff_secs);

        while !cancel.is_cancelled() {
            let wait = match self.run_once_with(cancel.child_token()).await {
                Ok(Some(outcome)) => {
                    if self.runner.pause_after_completion {
                        info!(task_id = %outcome.task_id, "Pausing after task completion for inspection");
                        return;
                    }
                    continue;
                }
                Ok(None) => idle,
                Err(e) => {
                    error!(error = %e, "Error in task processing loop");
                    backoff
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("Task processing stopped");
    }

    /// Process the next pending task, if any.
    pub async fn run_once(&self) -> Result<Option<TaskOutcome>, StoreError> {
        self.run_once_with(CancellationToken::new()).await
    }

    async fn run_once_with(&self, cancel: CancellationToken) -> Result<Option<TaskOutcome>, StoreError> {
        let task = loop {
            let Some(task) = self.store.next_pending_task().await? else {
                return Ok(None);
            };
            if self.store.start_task(&task.id).await? {
                break task;
            }
            debug!(task_id = %task.id, "Task claimed elsewhere; trying the next one");
        };
        info!(
            task_id = %task.id,
            label = task.label.as_deref().unwrap_or_default(),
            "Processing task"
        );
        self.current_task.set(task.id.clone());
        let outcome = self.process(&task, cancel).await;
        self.current_task.clear();
        outcome.map(Some)
    }

    async fn process(&self, task: &Task, cancel: CancellationToken) -> Result<TaskOutcome, StoreError> {
        let tools = build_collection(self.runner.tool_version, &self.tool_context);
        let config = LoopConfig {
            system_prompt_suffix: self.runner.system_prompt_suffix.clone(),
            tool_version: self.runner.tool_version,
            only_n_most_recent_images: Some(self.runner.only_n_most_recent_images),
            max_tokens: self.runner.max_tokens,
            ..self.loop_config.clone()
        };
        let interjections: Arc<dyn InterjectionStore> = self.store.clone();
        let timing = Arc::new(TimingCollector::new());

        let mut sampling = SamplingLoop::new(self.provider.clone(), tools, config)
            .with_interjections(InterjectionPoller::new(interjections, Some(task.id.clone())))
            .with_timing(timing.clone())
            .with_cancellation(cancel);
        if let Some(browser) = &self.browser {
            sampling = sampling.with_browser(browser.clone());
        }

        let observer = LogObserver {
            task_id: task.id.clone(),
        };
        let result = sampling
            .run(vec![Message::user(task.formatted_instructions())], &observer)
            .await;
        let report = timing.report();
        if let Some(history) = &self.history {
            history.record(format!("task {}", task.id), report.clone());
        }

        // A reporter tool may already have finished the task; the guarded
        // writes leave its state alone.
        let error = match result {
            Ok(messages) => {
                let result = json!({
                    "messages": messages,
                    "completed_at": Utc::now().to_rfc3339(),
                    "timing": report,
                });
                let saved = self
                    .store
                    .complete_running_task(&task.id, TaskStatus::Completed, Some(result), None)
                    .await?;
                if !saved {
                    debug!(task_id = %task.id, "Task already finished; keeping its state");
                }
                info!(task_id = %task.id, "Task completed successfully");
                None
            }
            Err(e) => {
                let message = loop_error_message(&e);
                error!(task_id = %task.id, kind = e.kind(), error = %message, "Error processing task");
                let report = serde_json::to_value(&report).ok();
                let saved = self
                    .store
                    .fail_running_task(&task.id, &message, Some(json!({"kind": e.kind()})), report)
                    .await?;
                if !saved {
                    warn!(task_id = %task.id, "Task already finished by reporter; keeping its state");
                }
                Some(message)
            }
        };

        let status = self
            .store
            .get_task(&task.id)
            .await?
            .map(|t| t.status)
            .unwrap_or(TaskStatus::Error);
        Ok(TaskOutcome {
            task_id: task.id.clone(),
            status,
            error,
        })
    }
}

fn loop_error_message(e: &LoopError) -> String {
    match e {
        LoopError::Provider(_) => e.to_string(),
        other => format!("Sampling loop error: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tilt_core::error::ProviderError;
    use tilt_core::store::{NewTask, TaskUpdate};
    use tilt_store::InMemoryStore;

    use crate::test_helpers::{ScriptedProvider, reply};

    fn runner(store: Arc<InMemoryStore>, provider: Arc<ScriptedProvider>) -> TaskRunner {
        TaskRunner::new(&AppConfig::default(), store, provider).without_browser()
    }

    async fn add_task(store: &InMemoryStore, text: &str) -> String {
        store
            .create_task(NewTask {
                instructions: vec![text.into()],
                ..NewTask::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn empty_queue_does_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let provider = ScriptedProvider::new(vec![]);
        assert_eq!(runner(store, provider.clone()).run_once().await.unwrap(), None);
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn finished_loop_completes_the_task() {
        let store = Arc::new(InMemoryStore::new());
        let id = add_task(&store, "Open example.com and read the title").await;
        let provider = ScriptedProvider::new(vec![Ok(reply(vec![ContentBlock::text("Title is Example Domain")]))]);

        let runner = runner(store.clone(), provider.clone());
        let outcome = runner.run_once().await.unwrap().unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert!(runner.current_task().get().is_none());

        let request = &provider.requests()[0];
        assert_eq!(request.messages[0], Message::user("Open example.com and read the title"));
        assert_eq!(request.max_tokens, 8192);
        assert_eq!(request.betas[0], "computer-use-2025-01-24");
        assert!(request.system[0].cache_control().is_none());

        let task = store.get_task(&id).await.unwrap().unwrap();
        let result = task.result.unwrap();
        assert_eq!(result["messages"].as_array().unwrap().len(), 2);
        assert!(result["timing"]["steps"].is_array());
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn reporter_result_is_not_overwritten() {
        let store = Arc::new(InMemoryStore::new());
        let id = add_task(&store, "Check the signup form").await;
        let provider = ScriptedProvider::new(vec![
            Ok(reply(vec![ContentBlock::tool_use(
                "toolu_1",
                "task_reporter",
                json!({"action": "report_result", "data": {"success": true}}),
            )])),
            Ok(reply(vec![ContentBlock::text("Reported.")])),
        ]);

        let outcome = runner(store.clone(), provider).run_once().await.unwrap().unwrap();
        assert_eq!(outcome.status, TaskStatus::Passed);
        let task = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.result, Some(json!({"success": true})));
    }

    #[tokio::test]
    async fn loop_failure_marks_error() {
        let store = Arc::new(InMemoryStore::new());
        let id = add_task(&store, "Do something").await;
        let provider = ScriptedProvider::new(vec![Err(ProviderError::AuthenticationFailed(
            "invalid x-api-key".into(),
        ))]);

        let outcome = runner(store.clone(), provider).run_once().await.unwrap().unwrap();
        assert_eq!(outcome.status, TaskStatus::Error);
        let task = store.get_task(&id).await.unwrap().unwrap();
        assert!(task.error.unwrap().contains("invalid x-api-key"));
        assert_eq!(task.error_details, Some(json!({"kind": "provider"})));
    }

    #[tokio::test]
    async fn interjections_for_the_task_are_folded() {
        let store = Arc::new(InMemoryStore::new());
        let id = add_task(&store, "Fill in the form").await;
        store.push_interjection(Some(&id), "use the staging site", None).await.unwrap();
        let provider = ScriptedProvider::new(vec![Ok(reply(vec![ContentBlock::text("ok")]))]);

        runner(store, provider.clone()).run_once().await.unwrap();
        assert_eq!(provider.requests()[0].messages[1], Message::user("use the staging site"));
    }

    /// A queue where another worker claims the first row it hands out,
    /// between the read and the claim.
    struct ContendedQueue {
        inner: InMemoryStore,
        raced: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl TaskStore for ContendedQueue {
        async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> { self.inner.list_tasks().await }
        async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> { self.inner.get_task(id).await }
        async fn next_pending_task(&self) -> Result<Option<Task>, StoreError> {
            let next = self.inner.next_pending_task().await?;
            if let Some(task) = &next {
                if !self.raced.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    assert!(self.inner.start_task(&task.id).await?);
                }
            }
            Ok(next)
        }
        async fn create_task(&self, task: NewTask) -> Result<String, StoreError> { self.inner.create_task(task).await }
        async fn create_one_off_task(&self, d: &str) -> Result<String, StoreError> { self.inner.create_one_off_task(d).await }
        async fn update_task(&self, id: &str, u: TaskUpdate) -> Result<bool, StoreError> { self.inner.update_task(id, u).await }
        async fn delete_task(&self, id: &str) -> Result<(), StoreError> { self.inner.delete_task(id).await }
        async fn start_task(&self, id: &str) -> Result<bool, StoreError> { self.inner.start_task(id).await }
        async fn complete_task(&self, id: &str, s: TaskStatus, r: Option<Value>, e: Option<Value>) -> Result<bool, StoreError> {
            self.inner.complete_task(id, s, r, e).await
        }
        async fn complete_running_task(&self, id: &str, s: TaskStatus, r: Option<Value>, e: Option<Value>) -> Result<bool, StoreError> {
            self.inner.complete_running_task(id, s, r, e).await
        }
        async fn fail_task(&self, id: &str, m: &str, d: Option<Value>, e: Option<Value>) -> Result<bool, StoreError> {
            self.inner.fail_task(id, m, d, e).await
        }
        async fn fail_running_task(&self, id: &str, m: &str, d: Option<Value>, e: Option<Value>) -> Result<bool, StoreError> {
            self.inner.fail_running_task(id, m, d, e).await
        }
        async fn reset_task(&self, id: &str) -> Result<bool, StoreError> { self.inner.reset_task(id).await }
        async fn report_progress(&self, id: &str, p: Value) -> Result<bool, StoreError> { self.inner.report_progress(id, p).await }
        async fn add_metadata(&self, id: &str, m: serde_json::Map<String, Value>) -> Result<bool, StoreError> {
            self.inner.add_metadata(id, m).await
        }
    }

    #[async_trait::async_trait]
    impl InterjectionStore for ContendedQueue {
        async fn push_interjection(&self, s: Option<&str>, m: &str, t: Option<&str>) -> Result<String, StoreError> {
            self.inner.push_interjection(s, m, t).await
        }
        async fn claim_interjections(&self, s: Option<&str>) -> Result<Vec<tilt_core::store::Interjection>, StoreError> {
            self.inner.claim_interjections(s).await
        }
    }

    #[async_trait::async_trait]
    impl tilt_core::store::SettingsStore for ContendedQueue {
        async fn get_setting(&self, k: &str) -> Result<Option<String>, StoreError> { self.inner.get_setting(k).await }
        async fn put_setting(&self, k: &str, v: &str) -> Result<(), StoreError> { self.inner.put_setting(k, v).await }
    }

    #[tokio::test]
    async fn task_claimed_by_another_worker_is_skipped() {
        let queue = Arc::new(ContendedQueue {
            inner: InMemoryStore::new(),
            raced: Default::default(),
        });
        let taken = add_task(&queue.inner, "claimed elsewhere").await;
        let ours = add_task(&queue.inner, "left for us").await;
        let provider = ScriptedProvider::new(vec![Ok(reply(vec![ContentBlock::text("done")]))]);

        let runner = TaskRunner::new(&AppConfig::default(), queue.clone(), provider.clone()).without_browser();
        let outcome = runner.run_once().await.unwrap().unwrap();

        assert_eq!(outcome.task_id, ours);
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(provider.requests().len(), 1);
        assert_eq!(provider.requests()[0].messages[0], Message::user("left for us"));

        // The other worker still owns its task; nothing here finished it.
        let other = queue.get_task(&taken).await.unwrap().unwrap();
        assert_eq!(other.status, TaskStatus::Running);
        assert!(other.result.is_none());
    }

    #[tokio::test]
    async fn continuous_run_pauses_after_one_task() {
        let store = Arc::new(InMemoryStore::new());
        let first = add_task(&store, "first").await;
        let second = add_task(&store, "second").await;
        let provider = ScriptedProvider::new(vec![Ok(reply(vec![ContentBlock::text("done")]))]);
        let history = Arc::new(TimingHistory::new(5));

        runner(store.clone(), provider)
            .with_timing_history(history.clone())
            .run_continuous(CancellationToken::new())
            .await;

        assert_eq!(store.get_task(&first).await.unwrap().unwrap().status, TaskStatus::Completed);
        assert_eq!(store.get_task(&second).await.unwrap().unwrap().status, TaskStatus::Pending);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn continuous_run_stops_when_cancelled() {
        let store = Arc::new(InMemoryStore::new());
        let provider = ScriptedProvider::new(vec![]);
        let cancel = CancellationToken::new();
        let runner = runner(store, provider).with_pause_after_completion(false);

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.cancel();
        });
        tokio::time::timeout(Duration::from_secs(5), runner.run_continuous(cancel))
            .await
            .unwrap();
    }
}
