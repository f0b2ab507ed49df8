use uuid::Uuid;

use crate::status::TaskStatus;

/// Store-agnostic error type
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	/// The referenced task row does not exist
	#[error("task {0} was not found")]
	TaskNotFound(Uuid),

	/// The requested edge is not part of the status state machine
	#[error("illegal status transition {from} -> {to}")]
	IllegalTransition { from: TaskStatus, to: TaskStatus },

	/// A persisted row could not be mapped back into a task record
	#[error("corrupt task record: {0}")]
	Decode(String),

	/// The backing database failed
	#[cfg(feature = "sqlite")]
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
