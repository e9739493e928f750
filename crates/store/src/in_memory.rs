//! In-memory store for tests and throwaway sessions.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use tilt_core::error::StoreError;
use tilt_core::store::*;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Keeps tasks, interjections and settings in process memory.
#[derive(Default)]
pub struct InMemoryStore {
    tasks: RwLock<Vec<Task>>,
    interjections: RwLock<Vec<Interjection>>,
    settings: RwLock<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_task(task: NewTask, status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4().to_string(),
            instructions: task.instructions,
            label: task.label,
            status,
            created_at: now,
            started_at: (status == TaskStatus::Running).then_some(now),
            completed_at: None,
            last_run: None,
            result: None,
            error: None,
            error_details: None,
            tool_use: task.tool_use,
            execution_report: None,
            progress: None,
            progress_history: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Apply `f` to task `id`; `false` if there is no such task.
    async fn modify(&self, id: &str, f: impl FnOnce(&mut Task)) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.iter_mut().find(|t| t.id == id) {
            Some(task) => {
                f(task);
                true
            }
            None => false,
        }
    }

    /// Apply `f` only while task `id` is in status `expected`; the check and
    /// the write happen under one lock.
    async fn modify_if(&self, id: &str, expected: TaskStatus, f: impl FnOnce(&mut Task)) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.iter_mut().find(|t| t.id == id && t.status == expected) {
            Some(task) => {
                f(task);
                true
            }
            None => false,
        }
    }

    fn finish(task: &mut Task, status: TaskStatus, result: Option<Value>, execution_report: Option<Value>) {
        let now = Utc::now();
        task.status = status;
        task.completed_at = Some(now);
        task.last_run = Some(now);
        task.result = result;
        if execution_report.is_some() {
            task.execution_report = execution_report;
        }
    }

    fn fail(task: &mut Task, error: &str, details: Option<Value>, execution_report: Option<Value>) {
        let now = Utc::now();
        task.status = TaskStatus::Error;
        task.completed_at = Some(now);
        task.last_run = Some(now);
        task.error = Some(error.to_string());
        task.error_details = details;
        if execution_report.is_some() {
            task.execution_report = execution_report;
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.tasks.read().await.clone())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.iter().find(|t| t.id == id).cloned())
    }

    async fn next_pending_task(&self) -> Result<Option<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .await
            .iter()
            .find(|t| t.status == TaskStatus::Pending && !t.instructions.is_empty())
            .cloned())
    }

    async fn create_task(&self, task: NewTask) -> Result<String, StoreError> {
        let task = Self::build_task(task.normalized()?, TaskStatus::Pending);
        let id = task.id.clone();
        self.tasks.write().await.push(task);
        Ok(id)
    }

    async fn create_one_off_task(&self, description: &str) -> Result<String, StoreError> {
        let new = NewTask {
            instructions: vec![description.to_string()],
            ..NewTask::default()
        }
        .normalized()?;
        let task = Self::build_task(new, TaskStatus::Running);
        let id = task.id.clone();
        self.tasks.write().await.push(task);
        Ok(id)
    }

    async fn update_task(&self, id: &str, update: TaskUpdate) -> Result<bool, StoreError> {
        let instructions = match update.instructions.clone() {
            Some(lines) => Some(
                NewTask {
                    instructions: lines,
                    ..NewTask::default()
                }
                .normalized()?
                .instructions,
            ),
            None => None,
        };
        let label = update.label_change().map(|l| l.map(str::to_string));

        Ok(self
            .modify(id, |task| {
                if let Some(lines) = instructions {
                    task.instructions = lines;
                }
                if let Some(label) = label {
                    task.label = label;
                }
                if let Some(tool_use) = update.tool_use {
                    task.tool_use = Some(tool_use);
                }
            })
            .await)
    }

    async fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        let index = tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("Task {id} not found")))?;
        if tasks[index].status == TaskStatus::Running {
            return Err(StoreError::Conflict("Cannot delete a running task".into()));
        }
        tasks.remove(index);
        Ok(())
    }

    async fn start_task(&self, id: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        Ok(self
            .modify_if(id, TaskStatus::Pending, |task| {
                task.status = TaskStatus::Running;
                task.started_at = Some(now);
                task.last_run = Some(now);
            })
            .await)
    }

    async fn complete_task(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<Value>,
        execution_report: Option<Value>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .modify(id, |task| Self::finish(task, status, result, execution_report))
            .await)
    }

    async fn complete_running_task(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<Value>,
        execution_report: Option<Value>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .modify_if(id, TaskStatus::Running, |task| {
                Self::finish(task, status, result, execution_report)
            })
            .await)
    }

    async fn fail_task(
        &self,
        id: &str,
        error: &str,
        details: Option<Value>,
        execution_report: Option<Value>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .modify(id, |task| Self::fail(task, error, details, execution_report))
            .await)
    }

    async fn fail_running_task(
        &self,
        id: &str,
        error: &str,
        details: Option<Value>,
        execution_report: Option<Value>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .modify_if(id, TaskStatus::Running, |task| {
                Self::fail(task, error, details, execution_report)
            })
            .await)
    }

    async fn reset_task(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .modify(id, |task| {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                task.completed_at = None;
                task.error = None;
            })
            .await)
    }

    async fn report_progress(&self, id: &str, progress: Value) -> Result<bool, StoreError> {
        Ok(self
            .modify(id, |task| {
                task.progress_history.push(ProgressEntry {
                    timestamp: Utc::now(),
                    data: progress.clone(),
                });
                task.progress = Some(progress);
            })
            .await)
    }

    async fn add_metadata(
        &self,
        id: &str,
        metadata: serde_json::Map<String, Value>,
    ) -> Result<bool, StoreError> {
        Ok(self.modify(id, |task| task.metadata.extend(metadata)).await)
    }
}

#[async_trait]
impl InterjectionStore for InMemoryStore {
    async fn push_interjection(
        &self,
        session_id: Option<&str>,
        message: &str,
        timestamp: Option<&str>,
    ) -> Result<String, StoreError> {
        let now = Utc::now();
        let interjection = Interjection {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.map(str::to_string),
            message: message.to_string(),
            timestamp: timestamp.map(str::to_string).unwrap_or_else(|| now.to_rfc3339()),
            created_at: now,
            processed: false,
        };
        let id = interjection.id.clone();
        self.interjections.write().await.push(interjection);
        Ok(id)
    }

    async fn claim_interjections(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<Interjection>, StoreError> {
        let mut all = self.interjections.write().await;
        let claimed = all
            .iter_mut()
            .filter(|i| !i.processed && (session_id.is_none() || i.session_id.as_deref() == session_id))
            .map(|i| {
                i.processed = true;
                i.clone()
            })
            .collect();
        Ok(claimed)
    }
}

#[async_trait]
impl SettingsStore for InMemoryStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.settings.read().await.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.settings.write().await.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn task_round_trip() {
        let store = InMemoryStore::new();
        let id = store
            .create_task(NewTask {
                instructions: vec!["check the checkout flow".into()],
                ..NewTask::default()
            })
            .await
            .unwrap();
        assert_eq!(store.next_pending_task().await.unwrap().unwrap().id, id);

        store.start_task(&id).await.unwrap();
        assert!(store.next_pending_task().await.unwrap().is_none());
        assert!(store.delete_task(&id).await.is_err());

        store.complete_task(&id, TaskStatus::Completed, Some(json!({})), None).await.unwrap();
        store.delete_task(&id).await.unwrap();
        assert!(store.list_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_reader_cannot_reclaim_a_finished_task() {
        let store = InMemoryStore::new();
        let id = store
            .create_task(NewTask {
                instructions: vec!["open the pricing page".into()],
                ..NewTask::default()
            })
            .await
            .unwrap();

        let seen_by_a = store.next_pending_task().await.unwrap().unwrap();
        let seen_by_b = store.next_pending_task().await.unwrap().unwrap();
        assert_eq!(seen_by_a.id, seen_by_b.id);

        assert!(store.start_task(&seen_by_a.id).await.unwrap());
        assert!(!store.start_task(&seen_by_b.id).await.unwrap());

        assert!(store
            .complete_running_task(&id, TaskStatus::Completed, Some(json!({})), None)
            .await
            .unwrap());
        assert!(!store.start_task(&id).await.unwrap());
        assert!(!store.fail_running_task(&id, "late", None, None).await.unwrap());

        let task = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn progress_history_grows() {
        let store = InMemoryStore::new();
        let id = store.create_one_off_task("report").await.unwrap();
        store.report_progress(&id, json!("a")).await.unwrap();
        store.report_progress(&id, json!("b")).await.unwrap();
        let task = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.progress, Some(json!("b")));
        assert_eq!(task.progress_history.len(), 2);
        assert!(!store.report_progress("nope", json!(1)).await.unwrap());
    }

    #[tokio::test]
    async fn claim_marks_processed() {
        let store = InMemoryStore::new();
        store.push_interjection(Some("s1"), "hello", None).await.unwrap();
        store.push_interjection(Some("s2"), "other", None).await.unwrap();

        let claimed = store.claim_interjections(Some("s1")).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(claimed[0].processed);
        assert!(store.claim_interjections(Some("s1")).await.unwrap().is_empty());
        assert_eq!(store.claim_interjections(None).await.unwrap().len(), 1);
    }
}
