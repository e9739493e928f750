//! SQLite backend for tasks, interjections and settings.
//!
//! One database file, three tables:
//! - `tasks` — the task queue; list-valued and free-form columns hold JSON text
//! - `interrupts` — interjections, claimed with a single `UPDATE ... RETURNING`
//! - `settings` — key/value pairs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tilt_core::error::StoreError;
use tilt_core::store::*;
use tracing::{debug, info};
use uuid::Uuid;

/// A SQLite-backed store.
pub struct SqliteStore {
    pool: SqlitePool,
}

fn query_err(e: sqlx::Error) -> StoreError {
    StoreError::QueryFailed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Validation(e.to_string()))
}

fn opt_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>, StoreError> {
    value.as_ref().map(to_json).transpose()
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database (useful for tests).
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Connection(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // An in-memory database lives and dies with its connection.
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                iid              INTEGER PRIMARY KEY AUTOINCREMENT,
                id               TEXT UNIQUE NOT NULL,
                instructions     TEXT NOT NULL DEFAULT '[]',
                label            TEXT,
                status           TEXT NOT NULL DEFAULT 'pending',
                created_at       TEXT NOT NULL,
                started_at       TEXT,
                completed_at     TEXT,
                last_run         TEXT,
                result           TEXT,
                error            TEXT,
                error_details    TEXT,
                tool_use         TEXT,
                execution_report TEXT,
                progress         TEXT,
                progress_history TEXT NOT NULL DEFAULT '[]',
                metadata         TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("tasks table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("status index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS interrupts (
                iid        INTEGER PRIMARY KEY AUTOINCREMENT,
                id         TEXT UNIQUE NOT NULL,
                session_id TEXT,
                message    TEXT NOT NULL,
                timestamp  TEXT NOT NULL,
                created_at TEXT NOT NULL,
                processed  INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("interrupts table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_interrupts_pending ON interrupts(processed, session_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("interrupts index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("settings table: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_task(row: &SqliteRow) -> Result<Task, StoreError> {
        fn col<T>(row: &SqliteRow, name: &str) -> Result<T, StoreError>
        where
            T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
        {
            row.try_get(name)
                .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
        }
        fn json_col<T: DeserializeOwned>(row: &SqliteRow, name: &str) -> Result<Option<T>, StoreError> {
            let raw: Option<String> = col(row, name)?;
            raw.map(|s| {
                serde_json::from_str(&s)
                    .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
            })
            .transpose()
        }
        fn time_col(row: &SqliteRow, name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
            let raw: Option<String> = col(row, name)?;
            Ok(raw.and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }))
        }

        let status: String = col(row, "status")?;

        Ok(Task {
            id: col(row, "id")?,
            instructions: json_col(row, "instructions")?.unwrap_or_default(),
            label: col(row, "label")?,
            status: status.parse()?,
            created_at: time_col(row, "created_at")?.unwrap_or_else(Utc::now),
            started_at: time_col(row, "started_at")?,
            completed_at: time_col(row, "completed_at")?,
            last_run: time_col(row, "last_run")?,
            result: json_col(row, "result")?,
            error: col(row, "error")?,
            error_details: json_col(row, "error_details")?,
            tool_use: json_col(row, "tool_use")?,
            execution_report: json_col(row, "execution_report")?,
            progress: json_col(row, "progress")?,
            progress_history: json_col(row, "progress_history")?.unwrap_or_default(),
            metadata: json_col(row, "metadata")?.unwrap_or_default(),
        })
    }

    async fn insert_task(&self, task: &NewTask, status: TaskStatus) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let started_at = (status == TaskStatus::Running).then(|| now.clone());

        sqlx::query(
            r#"
            INSERT INTO tasks (id, instructions, label, status, created_at, started_at, tool_use)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(to_json(&task.instructions)?)
        .bind(&task.label)
        .bind(status.as_str())
        .bind(&now)
        .bind(started_at)
        .bind(opt_json(&task.tool_use)?)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        debug!(id = %id, status = %status, "Task created");
        Ok(id)
    }
}

impl SqliteStore {
    /// Record a final status; with `guard`, only while the task is in that
    /// status.
    async fn finish(
        &self,
        id: &str,
        guard: Option<TaskStatus>,
        status: TaskStatus,
        result: Option<Value>,
        execution_report: Option<Value>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let guard = guard.map(|g| g.as_str());
        let done = sqlx::query(
            r#"
            UPDATE tasks SET
                status = ?, completed_at = ?, last_run = ?,
                result = ?, execution_report = COALESCE(?, execution_report)
            WHERE id = ? AND (? IS NULL OR status = ?)
            "#,
        )
        .bind(status.as_str())
        .bind(&now)
        .bind(&now)
        .bind(opt_json(&result)?)
        .bind(opt_json(&execution_report)?)
        .bind(id)
        .bind(guard)
        .bind(guard)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(done.rows_affected() > 0)
    }

    async fn fail(
        &self,
        id: &str,
        guard: Option<TaskStatus>,
        error: &str,
        details: Option<Value>,
        execution_report: Option<Value>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let guard = guard.map(|g| g.as_str());
        let done = sqlx::query(
            r#"
            UPDATE tasks SET
                status = 'error', completed_at = ?, last_run = ?,
                error = ?, error_details = ?,
                execution_report = COALESCE(?, execution_report)
            WHERE id = ? AND (? IS NULL OR status = ?)
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(error)
        .bind(opt_json(&details)?)
        .bind(opt_json(&execution_report)?)
        .bind(id)
        .bind(guard)
        .bind(guard)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(done.rows_affected() > 0)
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at ASC, iid ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(query_err)?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn next_pending_task(&self) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE status = 'pending' AND instructions != '[]'
            ORDER BY created_at ASC, iid ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn create_task(&self, task: NewTask) -> Result<String, StoreError> {
        let task = task.normalized()?;
        self.insert_task(&task, TaskStatus::Pending).await
    }

    async fn create_one_off_task(&self, description: &str) -> Result<String, StoreError> {
        let task = NewTask {
            instructions: vec![description.to_string()],
            ..NewTask::default()
        }
        .normalized()?;
        self.insert_task(&task, TaskStatus::Running).await
    }

    async fn update_task(&self, id: &str, update: TaskUpdate) -> Result<bool, StoreError> {
        if update.is_empty() {
            return Ok(self.get_task(id).await?.is_some());
        }

        let instructions = match &update.instructions {
            Some(lines) => {
                let normalized = NewTask {
                    instructions: lines.clone(),
                    label: Some(String::new()),
                    tool_use: None,
                }
                .normalized()?;
                Some(to_json(&normalized.instructions)?)
            }
            None => None,
        };
        let label_change = update.label_change();

        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                instructions = COALESCE(?, instructions),
                label        = CASE WHEN ? THEN ? ELSE label END,
                tool_use     = COALESCE(?, tool_use)
            WHERE id = ?
            "#,
        )
        .bind(instructions)
        .bind(label_change.is_some())
        .bind(label_change.flatten())
        .bind(opt_json(&update.tool_use)?)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        let task = self
            .get_task(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Task {id} not found")))?;
        if task.status == TaskStatus::Running {
            return Err(StoreError::Conflict("Cannot delete a running task".into()));
        }

        sqlx::query("DELETE FROM tasks WHERE id = ? AND status != 'running'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn start_task(&self, id: &str) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE tasks SET status = 'running', started_at = ?, last_run = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_task(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<Value>,
        execution_report: Option<Value>,
    ) -> Result<bool, StoreError> {
        self.finish(id, None, status, result, execution_report).await
    }

    async fn complete_running_task(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<Value>,
        execution_report: Option<Value>,
    ) -> Result<bool, StoreError> {
        self.finish(id, Some(TaskStatus::Running), status, result, execution_report)
            .await
    }

    async fn fail_task(
        &self,
        id: &str,
        error: &str,
        details: Option<Value>,
        execution_report: Option<Value>,
    ) -> Result<bool, StoreError> {
        self.fail(id, None, error, details, execution_report).await
    }

    async fn fail_running_task(
        &self,
        id: &str,
        error: &str,
        details: Option<Value>,
        execution_report: Option<Value>,
    ) -> Result<bool, StoreError> {
        self.fail(id, Some(TaskStatus::Running), error, details, execution_report)
            .await
    }

    async fn reset_task(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = 'pending', started_at = NULL, completed_at = NULL, error = NULL
            WHERE id = ?
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn report_progress(&self, id: &str, progress: Value) -> Result<bool, StoreError> {
        let entry = ProgressEntry {
            timestamp: Utc::now(),
            data: progress.clone(),
        };
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                progress = ?,
                progress_history = json_insert(progress_history, '$[#]', json(?))
            WHERE id = ?
            "#,
        )
        .bind(to_json(&progress)?)
        .bind(to_json(&entry)?)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_metadata(
        &self,
        id: &str,
        metadata: serde_json::Map<String, Value>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE tasks SET metadata = json_patch(metadata, json(?)) WHERE id = ?")
            .bind(to_json(&metadata)?)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl InterjectionStore for SqliteStore {
    async fn push_interjection(
        &self,
        session_id: Option<&str>,
        message: &str,
        timestamp: Option<&str>,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO interrupts (id, session_id, message, timestamp, created_at, processed)
            VALUES (?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&id)
        .bind(session_id)
        .bind(message)
        .bind(timestamp.unwrap_or(&now))
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(id)
    }

    async fn claim_interjections(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<Interjection>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE interrupts SET processed = 1
            WHERE processed = 0 AND (?1 IS NULL OR session_id = ?1)
            RETURNING iid, id, session_id, message, timestamp, created_at
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        let mut claimed = rows
            .iter()
            .map(|row| {
                let iid: i64 = row.try_get("iid").map_err(query_err)?;
                let created_at: String = row.try_get("created_at").map_err(query_err)?;
                Ok((
                    iid,
                    Interjection {
                        id: row.try_get("id").map_err(query_err)?,
                        session_id: row.try_get("session_id").map_err(query_err)?,
                        message: row.try_get("message").map_err(query_err)?,
                        timestamp: row.try_get("timestamp").map_err(query_err)?,
                        created_at: DateTime::parse_from_rfc3339(&created_at)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                        processed: true,
                    },
                ))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        claimed.sort_by_key(|(iid, _)| *iid);
        Ok(claimed.into_iter().map(|(_, i)| i).collect())
    }
}

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;
        row.map(|r| r.try_get("value").map_err(query_err)).transpose()
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }
}
