use uuid::Uuid;

use crate::error::Result;
use crate::status::TaskStatus;
use crate::task::{StatusChange, TaskRecord, Transition};

/// The worker's view of the task store.
///
/// Deliberately narrow: the worker reads a task to learn its status and
/// source path, and writes nothing but guarded status transitions. Creating
/// and deleting rows belongs to the API tier (backends expose inherent
/// helpers for that, outside this trait).
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync + 'static {
	/// Fetch a task by id, or `None` if the row does not exist.
	async fn fetch(&self, task_id: Uuid) -> Result<Option<TaskRecord>>;

	/// Apply `change` if and only if the row is currently in `expected`.
	///
	/// The compare-and-swap makes redelivered queue messages harmless: a
	/// duplicate sees `Transition::Superseded` instead of clobbering state.
	/// The `expected -> change.to` edge must be legal per
	/// [`TaskStatus::can_transition_to`]; backends reject illegal edges with
	/// [`crate::StoreError::IllegalTransition`] before touching the row.
	async fn transition(&self, task_id: Uuid, expected: TaskStatus, change: StatusChange) -> Result<Transition>;
}
