//! SQLite-backed task store
//!
//! The production backend: the worker shares the task table with the API
//! tier through one SQLite database file (or `sqlite::memory:` in tests).

#![cfg(feature = "sqlite")]

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::status::TaskStatus;
use crate::task::{StatusChange, TaskRecord, Transition};
use crate::traits::TaskStore;

/// Task store backed by a sqlx SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
	pool: SqlitePool,
}

/// Raw row shape; ids and statuses are TEXT in the schema and validated on
/// the way out.
#[derive(sqlx::FromRow)]
struct TaskRow {
	id: String,
	owner_id: String,
	title: String,
	description: Option<String>,
	status: String,
	source_path: String,
	result_path: Option<String>,
	failure_reason: Option<String>,
	created_at: DateTime<Utc>,
	updated_at: DateTime<Utc>,
	completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for TaskRecord {
	type Error = StoreError;

	fn try_from(row: TaskRow) -> Result<Self> {
		Ok(Self {
			id: Uuid::parse_str(&row.id).map_err(|e| StoreError::Decode(format!("task id '{}': {e}", row.id)))?,
			owner_id: Uuid::parse_str(&row.owner_id).map_err(|e| StoreError::Decode(format!("owner id '{}': {e}", row.owner_id)))?,
			title: row.title,
			description: row.description,
			status: row.status.parse().map_err(StoreError::Decode)?,
			source_path: row.source_path,
			result_path: row.result_path,
			failure_reason: row.failure_reason,
			created_at: row.created_at,
			updated_at: row.updated_at,
			completed_at: row.completed_at,
		})
	}
}

impl SqliteTaskStore {
	/// Connect and make sure the task table exists.
	pub async fn connect(url: &str) -> Result<Self> {
		let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
		// One connection: SQLite serializes writers regardless, and a
		// single handle keeps `sqlite::memory:` databases coherent.
		let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;

		let store = Self { pool };
		store.init_schema().await?;
		Ok(store)
	}

	pub fn from_pool(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub async fn init_schema(&self) -> Result<()> {
		sqlx::query(
			r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'PENDING',
            source_path TEXT NOT NULL,
            result_path TEXT,
            failure_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
		)
		.execute(&self.pool)
		.await?;

		sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)").execute(&self.pool).await?;

		Ok(())
	}

	/// Seed a record, as the API tier would on upload. Not part of the
	/// worker-facing [`TaskStore`] trait.
	pub async fn insert(&self, record: &TaskRecord) -> Result<()> {
		sqlx::query(
			r#"
        INSERT INTO tasks (id, owner_id, title, description, status, source_path,
                           result_path, failure_reason, created_at, updated_at, completed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
		)
		.bind(record.id.to_string())
		.bind(record.owner_id.to_string())
		.bind(&record.title)
		.bind(&record.description)
		.bind(record.status.as_str())
		.bind(&record.source_path)
		.bind(&record.result_path)
		.bind(&record.failure_reason)
		.bind(record.created_at)
		.bind(record.updated_at)
		.bind(record.completed_at)
		.execute(&self.pool)
		.await?;

		Ok(())
	}
}

#[async_trait::async_trait]
impl TaskStore for SqliteTaskStore {
	async fn fetch(&self, task_id: Uuid) -> Result<Option<TaskRecord>> {
		let row: Option<TaskRow> = sqlx::query_as(
			r#"
        SELECT id, owner_id, title, description, status, source_path,
               result_path, failure_reason, created_at, updated_at, completed_at
        FROM tasks WHERE id = ?
        "#,
		)
		.bind(task_id.to_string())
		.fetch_optional(&self.pool)
		.await?;

		row.map(TaskRecord::try_from).transpose()
	}

	async fn transition(&self, task_id: Uuid, expected: TaskStatus, change: StatusChange) -> Result<Transition> {
		if !expected.can_transition_to(change.to) {
			return Err(StoreError::IllegalTransition { from: expected, to: change.to });
		}

		// Compare-and-swap on the status column; a redelivered message that
		// lost the race matches zero rows and writes nothing.
		let result = sqlx::query(
			r#"
        UPDATE tasks
        SET status = ?, result_path = ?, failure_reason = ?, completed_at = ?, updated_at = ?
        WHERE id = ? AND status = ?
        "#,
		)
		.bind(change.to.as_str())
		.bind(&change.result_path)
		.bind(&change.failure_reason)
		.bind(change.completed_at)
		.bind(Utc::now())
		.bind(task_id.to_string())
		.bind(expected.as_str())
		.execute(&self.pool)
		.await?;

		if result.rows_affected() > 0 {
			return Ok(Transition::Applied);
		}

		let actual: Option<(String,)> = sqlx::query_as("SELECT status FROM tasks WHERE id = ?")
			.bind(task_id.to_string())
			.fetch_optional(&self.pool)
			.await?;

		match actual {
			Some((status,)) => Ok(Transition::Superseded {
				actual: status.parse().map_err(StoreError::Decode)?,
			}),
			None => Err(StoreError::TaskNotFound(task_id)),
		}
	}
}
