// Behavior tests that both store backends must satisfy: the worker's
// compare-and-swap transition discipline and the completed_at invariant.

#![cfg(feature = "sqlite")]

use task_store::{SqliteTaskStore, StatusChange, TaskRecord, TaskStatus, TaskStore, Transition};
use uuid::Uuid;

async fn store_with_pending_task() -> (SqliteTaskStore, Uuid) {
	let store = SqliteTaskStore::connect("sqlite::memory:").await.expect("connect in-memory sqlite");
	let record = TaskRecord::new(Uuid::new_v4(), "Transcribe meeting", "uploads/meeting.wav");
	let id = record.id;
	store.insert(&record).await.expect("seed task");
	(store, id)
}

#[tokio::test]
async fn test_full_success_lifecycle() {
	let (store, id) = store_with_pending_task().await;

	assert_eq!(
		store.transition(id, TaskStatus::Pending, StatusChange::processing()).await.unwrap(),
		Transition::Applied
	);
	assert_eq!(
		store
			.transition(id, TaskStatus::Processing, StatusChange::completed("results/out.txt"))
			.await
			.unwrap(),
		Transition::Applied
	);

	let task = store.fetch(id).await.unwrap().unwrap();
	assert_eq!(task.status, TaskStatus::Completed);
	assert_eq!(task.result_path.as_deref(), Some("results/out.txt"));
	assert!(task.completed_at.is_some(), "completed_at must be set in a terminal state");
}

#[tokio::test]
async fn test_failure_records_reason_and_no_result() {
	let (store, id) = store_with_pending_task().await;

	store.transition(id, TaskStatus::Pending, StatusChange::processing()).await.unwrap();
	store
		.transition(id, TaskStatus::Processing, StatusChange::failed("unreadable source audio"))
		.await
		.unwrap();

	let task = store.fetch(id).await.unwrap().unwrap();
	assert_eq!(task.status, TaskStatus::Failed);
	assert_eq!(task.failure_reason.as_deref(), Some("unreadable source audio"));
	assert!(task.result_path.is_none());
	assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn test_terminal_state_wins_every_race() {
	let (store, id) = store_with_pending_task().await;

	store.transition(id, TaskStatus::Pending, StatusChange::cancelled()).await.unwrap();

	// A worker that fetched the task before the cancellation must lose the
	// compare-and-swap, leaving the terminal state untouched.
	let outcome = store.transition(id, TaskStatus::Pending, StatusChange::processing()).await.unwrap();
	assert_eq!(outcome, Transition::Superseded { actual: TaskStatus::Cancelled });

	let task = store.fetch(id).await.unwrap().unwrap();
	assert_eq!(task.status, TaskStatus::Cancelled);
	assert!(task.result_path.is_none());
}

#[tokio::test]
async fn test_illegal_edge_is_rejected_before_writing() {
	let (store, id) = store_with_pending_task().await;

	let err = store.transition(id, TaskStatus::Pending, StatusChange::completed("results/out.txt")).await.unwrap_err();
	assert!(matches!(err, task_store::StoreError::IllegalTransition { .. }));

	let task = store.fetch(id).await.unwrap().unwrap();
	assert_eq!(task.status, TaskStatus::Pending);
	assert!(task.completed_at.is_none());
}

#[tokio::test]
async fn test_fetch_round_trips_the_record() {
	let store = SqliteTaskStore::connect("sqlite::memory:").await.unwrap();
	let mut record = TaskRecord::new(Uuid::new_v4(), "Weekly sync", "uploads/sync.wav");
	record.description = Some("Recorded on Monday".to_string());
	store.insert(&record).await.unwrap();

	let fetched = store.fetch(record.id).await.unwrap().unwrap();
	assert_eq!(fetched.id, record.id);
	assert_eq!(fetched.owner_id, record.owner_id);
	assert_eq!(fetched.title, "Weekly sync");
	assert_eq!(fetched.description.as_deref(), Some("Recorded on Monday"));
	assert_eq!(fetched.status, TaskStatus::Pending);
	assert_eq!(fetched.source_path, "uploads/sync.wav");
}

#[tokio::test]
async fn test_unknown_task_is_none_on_fetch_and_error_on_transition() {
	let store = SqliteTaskStore::connect("sqlite::memory:").await.unwrap();
	let ghost = Uuid::new_v4();

	assert!(store.fetch(ghost).await.unwrap().is_none());

	let err = store.transition(ghost, TaskStatus::Pending, StatusChange::processing()).await.unwrap_err();
	assert!(matches!(err, task_store::StoreError::TaskNotFound(_)));
}
