use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use task_store::{StatusChange, StoreError, TaskStatus, TaskStore, Transition};

use crate::audio;
use crate::model::TranscriptionEngine;
use crate::observability::WorkerMetrics;
use crate::scheduler::{AcquireError, Phase, SlotPool};
use crate::state::WorkerState;
use crate::storage::StorageLayout;

/// Cancellation flags for tasks currently in flight in this process.
///
/// Doubles as the in-flight set: a task id registers exactly once, so a
/// redelivered command for a running task becomes a no-op instead of a
/// second execution.
#[derive(Clone, Default)]
pub struct CancelRegistry {
	inner: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl CancelRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Claim `task_id` and mint its cancellation token, a child of the
	/// worker-wide shutdown token. `None` if the task is already in flight.
	fn register(&self, task_id: Uuid, parent: &CancellationToken) -> Option<CancellationToken> {
		let mut inner = self.inner.lock().expect("cancel registry poisoned");
		if inner.contains_key(&task_id) {
			return None;
		}
		let token = parent.child_token();
		inner.insert(task_id, token.clone());
		Some(token)
	}

	fn deregister(&self, task_id: Uuid) {
		self.inner.lock().expect("cancel registry poisoned").remove(&task_id);
	}

	/// Fire the cooperative cancellation flag for an in-flight task.
	/// Returns false when the task is not running in this process.
	pub fn cancel(&self, task_id: Uuid) -> bool {
		match self.inner.lock().expect("cancel registry poisoned").get(&task_id) {
			Some(token) => {
				token.cancel();
				true
			}
			None => false,
		}
	}

	pub fn in_flight(&self) -> usize {
		self.inner.lock().expect("cancel registry poisoned").len()
	}
}

/// Deregisters an in-flight claim on every exit path.
struct InFlightGuard {
	registry: CancelRegistry,
	task_id: Uuid,
}

impl Drop for InFlightGuard {
	fn drop(&mut self) {
		self.registry.deregister(self.task_id);
	}
}

/// How one delivery ended.
#[derive(Debug)]
pub enum TaskOutcome {
	Completed { result_path: PathBuf },
	Failed { reason: String },
	Cancelled,
	/// The record was terminal on receipt or another owner won the race.
	Skipped { status: TaskStatus },
	/// The same task id is already running in this process.
	Duplicate,
	/// No record for the delivered id.
	Missing,
}

/// The per-task state machine: PENDING → PROCESSING → terminal, with the
/// slot pool bounding the decode and inference phases.
pub struct TaskExecutor {
	store: Arc<dyn TaskStore>,
	engine: Arc<dyn TranscriptionEngine>,
	pool: Arc<SlotPool>,
	storage: StorageLayout,
	registry: CancelRegistry,
	state: Arc<WorkerState>,
	metrics: WorkerMetrics,
	shutdown: CancellationToken,
}

impl TaskExecutor {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		store: Arc<dyn TaskStore>,
		engine: Arc<dyn TranscriptionEngine>,
		pool: Arc<SlotPool>,
		storage: StorageLayout,
		registry: CancelRegistry,
		state: Arc<WorkerState>,
		metrics: WorkerMetrics,
		shutdown: CancellationToken,
	) -> Arc<Self> {
		Arc::new(Self {
			store,
			engine,
			pool,
			storage,
			registry,
			state,
			metrics,
			shutdown,
		})
	}

	/// Handle one `transcribe` delivery end to end.
	///
	/// Never propagates an error: task-level failures land in the task's
	/// terminal state, and infrastructure failures are logged and left to
	/// the queue's redelivery.
	pub async fn run(&self, task_id: Uuid, source_path: String, enqueued_at: DateTime<Utc>) {
		self.state.deliveries_received.fetch_add(1, Ordering::Relaxed);
		self.metrics.deliveries_received.add(1, &[]);

		match self.process(task_id, source_path, enqueued_at).await {
			Ok(TaskOutcome::Completed { result_path }) => {
				self.state.tasks_completed.fetch_add(1, Ordering::Relaxed);
				self.metrics.tasks_completed.add(1, &[]);
				info!(%task_id, result = %result_path.display(), "✅ Task completed");
			}
			Ok(TaskOutcome::Failed { reason }) => {
				self.state.tasks_failed.fetch_add(1, Ordering::Relaxed);
				self.metrics.tasks_failed.add(1, &[]);
				warn!(%task_id, %reason, "❌ Task failed");
			}
			Ok(TaskOutcome::Cancelled) => {
				self.state.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
				self.metrics.tasks_cancelled.add(1, &[]);
				info!(%task_id, "🛑 Task cancelled");
			}
			Ok(TaskOutcome::Skipped { status }) => {
				self.state.record_duplicate_delivery();
				self.metrics.deliveries_duplicate.add(1, &[]);
				debug!(%task_id, %status, "redelivery is a no-op");
			}
			Ok(TaskOutcome::Duplicate) => {
				self.state.record_duplicate_delivery();
				self.metrics.deliveries_duplicate.add(1, &[]);
				debug!(%task_id, "task already in flight; ignoring duplicate delivery");
			}
			Ok(TaskOutcome::Missing) => {
				warn!(%task_id, "task record not found; dropping delivery");
			}
			Err(err) => {
				// Transient infrastructure trouble; the queue owns retries
				error!(%task_id, error = %err, "task aborted on store error; awaiting redelivery");
			}
		}
	}

	/// Request cooperative cancellation of a task.
	///
	/// In-flight tasks get their flag set and stop at the next slot or
	/// phase boundary; queued tasks are moved `PENDING → CANCELLED` directly
	/// so a later delivery becomes a no-op.
	pub async fn cancel(&self, task_id: Uuid) {
		if self.registry.cancel(task_id) {
			info!(%task_id, "cancellation requested for in-flight task");
			return;
		}

		match self.store.transition(task_id, TaskStatus::Pending, StatusChange::cancelled()).await {
			Ok(Transition::Applied) => {
				self.state.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
				self.metrics.tasks_cancelled.add(1, &[]);
				info!(%task_id, "🛑 Queued task cancelled before pickup");
			}
			Ok(Transition::Superseded { actual }) => {
				debug!(%task_id, status = %actual, "cancellation is a no-op");
			}
			Err(StoreError::TaskNotFound(_)) => {
				warn!(%task_id, "cancellation for unknown task");
			}
			Err(err) => {
				error!(%task_id, error = %err, "could not record cancellation");
			}
		}
	}

	async fn process(&self, task_id: Uuid, source_path: String, enqueued_at: DateTime<Utc>) -> Result<TaskOutcome, StoreError> {
		let Some(task) = self.store.fetch(task_id).await? else {
			return Ok(TaskOutcome::Missing);
		};

		// Idempotent redelivery: terminal tasks are done, full stop.
		if task.status.is_terminal() {
			return Ok(TaskOutcome::Skipped { status: task.status });
		}

		let Some(cancel) = self.registry.register(task_id, &self.shutdown) else {
			return Ok(TaskOutcome::Duplicate);
		};
		let _in_flight = InFlightGuard {
			registry: self.registry.clone(),
			task_id,
		};

		match task.status {
			TaskStatus::Pending => match self.store.transition(task_id, TaskStatus::Pending, StatusChange::processing()).await? {
				Transition::Applied => {}
				Transition::Superseded { actual } => return Ok(TaskOutcome::Skipped { status: actual }),
			},
			TaskStatus::Processing => {
				// Not in flight here but already PROCESSING: a previous owner
				// died mid-run. The redelivery resumes the work.
				warn!(%task_id, "task was PROCESSING on delivery; resuming after presumed worker crash");
			}
			_ => unreachable!("terminal statuses were handled above"),
		}

		info!(%task_id, "▶️ Task picked up");
		self.drive(task_id, &source_path, enqueued_at, &cancel).await
	}

	async fn drive(&self, task_id: Uuid, source_path: &str, enqueued_at: DateTime<Utc>, cancel: &CancellationToken) -> Result<TaskOutcome, StoreError> {
		// ---- preprocess phase (CPU-bound) ----
		let wait_start = Instant::now();
		let slot = match self.pool.acquire(Phase::Preprocess, task_id, enqueued_at, cancel).await {
			Ok(slot) => slot,
			Err(AcquireError::Cancelled(_)) => return self.finish_cancelled(task_id).await,
		};
		self
			.metrics
			.slot_wait_latency
			.record(wait_start.elapsed().as_secs_f64() * 1000.0, &[KeyValue::new("phase", "preprocess")]);

		let source = self.storage.resolve_upload(source_path);
		let decode_start = Instant::now();
		let decoded = match tokio::task::spawn_blocking(move || audio::decode_wav(&source)).await {
			Ok(Ok(decoded)) => decoded,
			Ok(Err(err)) => {
				// Permanent input error: no retry, source left untouched.
				// The slot goes back before the status is recorded.
				drop(slot);
				return self.finish_failed(task_id, format!("preprocessing failed: {err}")).await;
			}
			Err(join_err) => {
				drop(slot);
				return self.finish_failed(task_id, format!("preprocessing crashed: {join_err}")).await;
			}
		};
		self.metrics.decode_latency.record(decode_start.elapsed().as_secs_f64() * 1000.0, &[]);
		debug!(
			%task_id,
			duration_secs = format!("{:.2}", decoded.duration_secs()),
			source_sample_rate = decoded.source_sample_rate,
			source_channels = decoded.source_channels,
			"🎛️ Audio decoded"
		);
		drop(slot);

		// Phase boundary: cancellation checkpoint
		if cancel.is_cancelled() {
			return self.finish_cancelled(task_id).await;
		}

		// ---- inference phase (GPU-bound) ----
		let wait_start = Instant::now();
		let slot = match self.pool.acquire(Phase::Infer, task_id, enqueued_at, cancel).await {
			Ok(slot) => slot,
			Err(AcquireError::Cancelled(_)) => return self.finish_cancelled(task_id).await,
		};
		self
			.metrics
			.slot_wait_latency
			.record(wait_start.elapsed().as_secs_f64() * 1000.0, &[KeyValue::new("phase", "infer")]);

		let engine = Arc::clone(&self.engine);
		let samples = decoded.samples;
		let infer_start = Instant::now();
		let text = match tokio::task::spawn_blocking(move || engine.transcribe(&samples)).await {
			Ok(Ok(text)) => text,
			Ok(Err(err)) => {
				drop(slot);
				return self.finish_failed(task_id, format!("inference failed: {err}")).await;
			}
			Err(join_err) => {
				drop(slot);
				return self.finish_failed(task_id, format!("inference crashed: {join_err}")).await;
			}
		};
		self.metrics.inference_latency.record(infer_start.elapsed().as_secs_f64() * 1000.0, &[]);
		drop(slot);

		if cancel.is_cancelled() {
			return self.finish_cancelled(task_id).await;
		}

		// ---- publish the result ----
		let artifact = render_artifact(source_path, &text);
		let result_path = match self.storage.write_result(task_id, &artifact).await {
			Ok(path) => path,
			Err(err) => return self.finish_failed(task_id, format!("failed to write result artifact: {err}")).await,
		};

		match self.store.transition(task_id, TaskStatus::Processing, StatusChange::completed(result_path.display().to_string())).await? {
			Transition::Applied => Ok(TaskOutcome::Completed { result_path }),
			Transition::Superseded { actual } => {
				// Someone moved the task under us after the last checkpoint;
				// the terminal state wins, so the artifact goes away again.
				self.storage.discard_result(task_id).await;
				Ok(TaskOutcome::Skipped { status: actual })
			}
		}
	}

	async fn finish_failed(&self, task_id: Uuid, reason: String) -> Result<TaskOutcome, StoreError> {
		self.storage.discard_result(task_id).await;
		match self.store.transition(task_id, TaskStatus::Processing, StatusChange::failed(reason.clone())).await? {
			Transition::Applied => Ok(TaskOutcome::Failed { reason }),
			Transition::Superseded { actual } => Ok(TaskOutcome::Skipped { status: actual }),
		}
	}

	async fn finish_cancelled(&self, task_id: Uuid) -> Result<TaskOutcome, StoreError> {
		self.storage.discard_result(task_id).await;
		match self.store.transition(task_id, TaskStatus::Processing, StatusChange::cancelled()).await? {
			Transition::Applied => Ok(TaskOutcome::Cancelled),
			Transition::Superseded { actual } => Ok(TaskOutcome::Skipped { status: actual }),
		}
	}
}

/// Render the result artifact in the shape the dashboard expects.
fn render_artifact(source_path: &str, text: &str) -> String {
	let file_name = Path::new(source_path)
		.file_name()
		.map(|name| name.to_string_lossy().into_owned())
		.unwrap_or_else(|| source_path.to_string());
	let body = if text.trim().is_empty() { "[no speech detected]" } else { text };

	format!("# Transcription for {file_name}\nGenerated at {}\n\n{body}\n", Utc::now().to_rfc3339())
}
