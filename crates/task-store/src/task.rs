use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::status::TaskStatus;

/// One transcription job as persisted by the API tier.
///
/// Invariant: `completed_at` is set if and only if `status` is terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
	pub id: Uuid,
	pub owner_id: Uuid,
	pub title: String,
	pub description: Option<String>,
	pub status: TaskStatus,
	pub source_path: String,
	pub result_path: Option<String>,
	pub failure_reason: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
	/// A fresh `PENDING` record, the shape the API tier inserts on upload.
	pub fn new(owner_id: Uuid, title: impl Into<String>, source_path: impl Into<String>) -> Self {
		let now = Utc::now();
		Self {
			id: Uuid::new_v4(),
			owner_id,
			title: title.into(),
			description: None,
			status: TaskStatus::Pending,
			source_path: source_path.into(),
			result_path: None,
			failure_reason: None,
			created_at: now,
			updated_at: now,
			completed_at: None,
		}
	}
}

/// The payload of one status transition.
///
/// This is the whole of the worker's write interface: the target status,
/// optionally a result path, a diagnostic for failures, and the completion
/// timestamp. Built through the constructors below so the
/// `completed_at ⇔ terminal` invariant cannot be violated by a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
	pub to: TaskStatus,
	pub result_path: Option<String>,
	pub failure_reason: Option<String>,
	pub completed_at: Option<DateTime<Utc>>,
}

impl StatusChange {
	/// Mark the task as picked up by a worker.
	pub fn processing() -> Self {
		Self {
			to: TaskStatus::Processing,
			result_path: None,
			failure_reason: None,
			completed_at: None,
		}
	}

	/// Terminal success, with the artifact location.
	pub fn completed(result_path: impl Into<String>) -> Self {
		Self {
			to: TaskStatus::Completed,
			result_path: Some(result_path.into()),
			failure_reason: None,
			completed_at: Some(Utc::now()),
		}
	}

	/// Terminal failure with a human-readable reason. No result artifact.
	pub fn failed(reason: impl Into<String>) -> Self {
		Self {
			to: TaskStatus::Failed,
			result_path: None,
			failure_reason: Some(reason.into()),
			completed_at: Some(Utc::now()),
		}
	}

	/// Terminal cancellation. No result artifact.
	pub fn cancelled() -> Self {
		Self {
			to: TaskStatus::Cancelled,
			result_path: None,
			failure_reason: None,
			completed_at: Some(Utc::now()),
		}
	}
}

/// Outcome of a compare-and-swap transition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
	/// The row matched the expected status and was updated.
	Applied,
	/// The row exists but had moved on; nothing was written.
	Superseded { actual: TaskStatus },
}
