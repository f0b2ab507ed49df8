//! In-memory task store
//!
//! Reference implementation of the transition semantics and the test double
//! injected wherever a real database would be noise.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::status::TaskStatus;
use crate::task::{StatusChange, TaskRecord, Transition};
use crate::traits::TaskStore;

/// Task store backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct InMemTaskStore {
	tasks: Mutex<HashMap<Uuid, TaskRecord>>,
}

impl InMemTaskStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seed a record, as the API tier would on upload. Not part of the
	/// worker-facing [`TaskStore`] trait.
	pub fn insert(&self, record: TaskRecord) {
		self.tasks.lock().expect("task map poisoned").insert(record.id, record);
	}

	/// Snapshot a record without going through the trait (test helper).
	pub fn get(&self, task_id: Uuid) -> Option<TaskRecord> {
		self.tasks.lock().expect("task map poisoned").get(&task_id).cloned()
	}
}

#[async_trait::async_trait]
impl TaskStore for InMemTaskStore {
	async fn fetch(&self, task_id: Uuid) -> Result<Option<TaskRecord>> {
		Ok(self.tasks.lock().expect("task map poisoned").get(&task_id).cloned())
	}

	async fn transition(&self, task_id: Uuid, expected: TaskStatus, change: StatusChange) -> Result<Transition> {
		if !expected.can_transition_to(change.to) {
			return Err(StoreError::IllegalTransition { from: expected, to: change.to });
		}

		let mut tasks = self.tasks.lock().expect("task map poisoned");
		let record = tasks.get_mut(&task_id).ok_or(StoreError::TaskNotFound(task_id))?;

		if record.status != expected {
			return Ok(Transition::Superseded { actual: record.status });
		}

		record.status = change.to;
		record.result_path = change.result_path;
		record.failure_reason = change.failure_reason;
		record.completed_at = change.completed_at;
		record.updated_at = Utc::now();

		Ok(Transition::Applied)
	}
}
