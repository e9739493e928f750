//! Task queue and interjection endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tilt_core::store::{InterjectionStore, NewTask, TaskStatus, TaskStore, TaskUpdate};
use tracing::info;

use crate::{ApiError, SharedState};

type ApiResult = Result<Json<Value>, ApiError>;

/// `GET /tasks` — every task, oldest first.
pub async fn list_tasks_handler(State(state): State<SharedState>) -> ApiResult {
    let tasks = state.store.list_tasks().await?;
    Ok(Json(json!({"tasks": tasks})))
}

/// `GET /next-task` — the oldest pending task with instructions.
pub async fn next_task_handler(State(state): State<SharedState>) -> ApiResult {
    match state.store.next_pending_task().await? {
        Some(task) => Ok(Json(json!({"task": task}))),
        None => Ok(Json(json!({
            "task": null,
            "message": "No pending tasks with valid instructions",
        }))),
    }
}

/// `POST /tasks`
pub async fn create_task_handler(
    State(state): State<SharedState>,
    Json(task): Json<NewTask>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let task_id = state.store.create_task(task).await?;
    info!(task_id = %task_id, "Task created");
    Ok((StatusCode::CREATED, Json(json!({"success": true, "task_id": task_id}))))
}

/// `PUT /tasks/{id}` — instructions, label (empty removes it), tool_use.
pub async fn update_task_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(update): Json<TaskUpdate>,
) -> ApiResult {
    if update.is_empty() {
        return Err(ApiError::bad_request("No valid fields to update"));
    }
    let success = state.store.update_task(&id, update).await?;
    Ok(Json(json!({"success": success})))
}

/// `DELETE /tasks/{id}` — refused while the task is running.
pub async fn delete_task_handler(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    state.store.delete_task(&id).await?;
    info!(task_id = %id, "Task deleted");
    Ok(Json(json!({"success": true, "message": "Task deleted successfully"})))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(default = "default_complete_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub execution_report: Option<Value>,
}

fn default_complete_status() -> TaskStatus {
    TaskStatus::Passed
}

/// `POST /tasks/{id}/complete` — status defaults to `passed`.
pub async fn complete_task_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<CompleteRequest>,
) -> ApiResult {
    let success = state
        .store
        .complete_task(&id, body.status, body.result, body.execution_report)
        .await?;
    Ok(Json(json!({"success": success})))
}

#[derive(Debug, Deserialize)]
pub struct ErrorRequest {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_report: Option<Value>,
}

/// `POST /tasks/{id}/error`
pub async fn error_task_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<ErrorRequest>,
) -> ApiResult {
    let error = body.error.unwrap_or_else(|| "Unknown error".into());
    let success = state
        .store
        .fail_task(&id, &error, None, body.execution_report)
        .await?;
    Ok(Json(json!({"success": success})))
}

/// `POST /tasks/{id}/start`
pub async fn start_task_handler(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let success = state.store.start_task(&id).await?;
    Ok(Json(json!({"success": success})))
}

/// `POST /tasks/{id}/reset` and `/stop` — back to pending.
pub async fn reset_task_handler(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let success = state.store.reset_task(&id).await?;
    Ok(Json(json!({"success": success})))
}

// --- Interjections ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptRequest {
    #[serde(default)]
    pub test_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// `POST /agent/interrupt` — queue a message for the loop running `testId`.
pub async fn interrupt_handler(
    State(state): State<SharedState>,
    Json(body): Json<InterruptRequest>,
) -> ApiResult {
    let (Some(test_id), Some(message)) = (
        body.test_id.filter(|s| !s.is_empty()),
        body.message.filter(|s| !s.is_empty()),
    ) else {
        return Err(ApiError::bad_request("Missing required fields: testId and message"));
    };
    info!(test_id = %test_id, message = %message, "Agent chat message");

    let interrupt_id = state
        .store
        .push_interjection(Some(&test_id), &message, body.timestamp.as_deref())
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": "Interrupt message queued for agent",
        "interrupt_id": interrupt_id,
    })))
}

/// `GET /agent/interrupts/{test_id}` — claim the session's pending messages.
pub async fn claim_interrupts_handler(
    State(state): State<SharedState>,
    Path(test_id): Path<String>,
) -> ApiResult {
    let claimed = state.store.claim_interjections(Some(&test_id)).await?;
    let messages: Vec<Value> = claimed
        .iter()
        .map(|i| {
            json!({
                "id": i.id,
                "message": i.message,
                "timestamp": i.timestamp,
                "created_at": i.created_at,
            })
        })
        .collect();
    Ok(Json(json!({"count": messages.len(), "messages": messages})))
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use tilt_core::store::{NewTask, TaskStatus, TaskStore};

    async fn seed(store: &tilt_store::InMemoryStore, text: &str) -> String {
        store
            .create_task(NewTask {
                instructions: vec![text.into()],
                ..NewTask::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_then_list() {
        let (state, _) = test_state();
        let (status, body) = send_json(
            &state,
            "POST",
            "/tasks",
            Some(json!({"instructions": ["  Open the pricing page  ", "", "Check the totals"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        let id = body["task_id"].as_str().unwrap().to_string();

        let (_, body) = send_json(&state, "GET", "/tasks", None).await;
        let tasks = body["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["id"], id);
        assert_eq!(tasks[0]["instructions"], json!(["Open the pricing page", "Check the totals"]));
        assert_eq!(tasks[0]["label"], "Open the pricing page");
        assert_eq!(tasks[0]["status"], "pending");
    }

    #[tokio::test]
    async fn empty_instructions_are_rejected() {
        let (state, _) = test_state();
        let (status, body) = send_json(&state, "POST", "/tasks", Some(json!({"instructions": ["  "]}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Task instructions cannot be empty");
    }

    #[tokio::test]
    async fn next_task_when_queue_is_empty() {
        let (state, _) = test_state();
        let (status, body) = send_json(&state, "GET", "/next-task", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["task"].is_null());
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let (state, store) = test_state();
        let id = seed(&store, "log in").await;

        let (_, body) = send_json(&state, "GET", "/next-task", None).await;
        assert_eq!(body["task"]["id"], id);

        let (_, body) = send_json(&state, "POST", &format!("/tasks/{id}/start"), None).await;
        assert_eq!(body["success"], true);
        assert_eq!(store.get_task(&id).await.unwrap().unwrap().status, TaskStatus::Running);

        let (_, body) = send_json(&state, "POST", &format!("/tasks/{id}/start"), None).await;
        assert_eq!(body["success"], false, "a running task cannot be claimed twice");

        let (status, body) = send_json(&state, "DELETE", &format!("/tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].is_string());

        send_json(
            &state,
            "POST",
            &format!("/tasks/{id}/complete"),
            Some(json!({"result": {"success": true}})),
        )
        .await;
        let task = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Passed);
        assert_eq!(task.result, Some(json!({"success": true})));

        send_json(&state, "POST", &format!("/tasks/{id}/reset"), None).await;
        let task = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.completed_at.is_none());

        send_json(&state, "POST", &format!("/tasks/{id}/error"), Some(json!({"error": "timeout"}))).await;
        let task = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.error.as_deref(), Some("timeout"));

        let (status, _) = send_json(&state, "DELETE", &format!("/tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(store.list_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_label_and_reject_empty_update() {
        let (state, store) = test_state();
        let id = seed(&store, "search for shoes").await;

        let (_, body) = send_json(&state, "PUT", &format!("/tasks/{id}"), Some(json!({"label": "Shoes"}))).await;
        assert_eq!(body["success"], true);
        assert_eq!(store.get_task(&id).await.unwrap().unwrap().label.as_deref(), Some("Shoes"));

        send_json(&state, "PUT", &format!("/tasks/{id}"), Some(json!({"label": ""}))).await;
        assert!(store.get_task(&id).await.unwrap().unwrap().label.is_none());

        let (status, body) = send_json(&state, "PUT", &format!("/tasks/{id}"), Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No valid fields to update");
    }

    #[tokio::test]
    async fn delete_missing_task_is_not_found() {
        let (state, _) = test_state();
        let (status, _) = send_json(&state, "DELETE", "/tasks/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn interrupts_are_claimed_once_per_session() {
        let (state, _) = test_state();
        let (_, body) = send_json(
            &state,
            "POST",
            "/agent/interrupt",
            Some(json!({"testId": "t-9", "message": "use the sandbox account"})),
        )
        .await;
        assert_eq!(body["success"], true);
        assert!(body["interrupt_id"].is_string());

        let (_, body) = send_json(&state, "GET", "/agent/interrupts/other", None).await;
        assert_eq!(body["count"], 0);

        let (_, body) = send_json(&state, "GET", "/agent/interrupts/t-9", None).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["messages"][0]["message"], "use the sandbox account");

        let (_, body) = send_json(&state, "GET", "/agent/interrupts/t-9", None).await;
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn interrupt_requires_session_and_message() {
        let (state, _) = test_state();
        let (status, body) = send_json(&state, "POST", "/agent/interrupt", Some(json!({"message": "hi"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing required fields: testId and message");
    }
}
