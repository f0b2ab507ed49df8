use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use opentelemetry::KeyValue;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use task_store::SqliteTaskStore;
use transcribe_worker::config::Config;
use transcribe_worker::executor::{CancelRegistry, TaskExecutor};
use transcribe_worker::model::{self, ModelConfig, TranscriptionEngine};
use transcribe_worker::monitor::{self, MonitorConfig, SystemSampler};
use transcribe_worker::observability;
use transcribe_worker::queue::{self, TaskCommand, TASK_COMMAND_SUBJECT};
use transcribe_worker::scheduler::SlotPool;
use transcribe_worker::state::WorkerState;
use transcribe_worker::storage::StorageLayout;

const SHUTDOWN_GRACE_PERIOD_MS: u64 = 200;

#[tokio::main]
async fn main() -> Result<()> {
	// Load environment variables
	dotenvy::dotenv().ok();

	// Parse CLI arguments
	let config = Config::parse();
	config.validate().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

	// Initialize observability (OTLP with local-only fallback)
	let (_meter_provider, metrics) = init_observability_with_fallback(&config);

	info!(
		service = %config.service_name,
		model = %config.model_name,
		task_slots = config.task_slots,
		"🎯 Starting transcription worker"
	);

	// Storage areas shared with the API tier
	let storage = StorageLayout::new(&config.storage_root);
	storage.ensure_dirs().await?;

	// Task store shared with the API tier
	let store = Arc::new(SqliteTaskStore::connect(&config.database_url).await?);
	info!(database = %config.database_url, "✅ Connected to task store");

	// Load the model exactly once, before any work is accepted.
	// Failures here are deployment errors: exit, do not retry.
	let engine: Arc<dyn TranscriptionEngine> = Arc::new(model::load(&ModelConfig::from_config(&config)).await?);
	info!(device = %engine.fingerprint().device, "🧠 Model ready");

	// Slot pool bounding concurrent task phases
	let pool = SlotPool::new(config.task_slots);

	// Shared state + gauges
	let registry = CancelRegistry::new();
	let state = WorkerState::new();
	state.register_gauges(&pool, &registry)?;

	// Root token for cooperative shutdown
	let cancellation_token = CancellationToken::new();

	// Background memory monitor, talking to us only through its channel
	let (_monitor_handle, mut warnings) = monitor::spawn(MonitorConfig::from_config(&config), SystemSampler::new(), cancellation_token.child_token());
	{
		let state = Arc::clone(&state);
		let metrics = metrics.clone();
		tokio::spawn(async move {
			while let Some(warning) = warnings.recv().await {
				state.pressure_warnings.fetch_add(1, Ordering::Relaxed);
				metrics.memory_pressure_warnings.add(1, &[KeyValue::new("resource", warning.kind.to_string())]);
				warn!(
					resource = %warning.kind,
					used_ratio = format!("{:.3}", warning.used_ratio),
					threshold = warning.threshold,
					"⚠️ High memory usage detected"
				);
			}
		});
	}

	// Connect to the queue with retry
	let nats_client = queue::connect_with_retry(&config.nats_url).await?;

	let executor = TaskExecutor::new(
		store,
		engine,
		pool,
		storage,
		registry,
		state,
		metrics.clone(),
		cancellation_token.clone(),
	);

	let worker = Worker {
		metrics,
		nats_client,
		executor,
		cancellation_token: cancellation_token.clone(),
	};

	// Run with graceful shutdown
	run_with_shutdown(worker, cancellation_token).await
}

struct Worker {
	metrics: observability::WorkerMetrics,
	nats_client: async_nats::Client,
	executor: Arc<TaskExecutor>,
	cancellation_token: CancellationToken,
}

async fn run_with_shutdown(worker: Worker, cancellation_token: CancellationToken) -> Result<()> {
	tokio::select! {
		result = worker.run() => {
			error!("Task command loop exited unexpectedly: {:?}", result);
			result
		}
		_ = wait_for_shutdown_signal() => {
			info!("🛑 Shutdown signal received (SIGTERM/SIGINT)");

			// Flip every in-flight task's cancellation flag
			cancellation_token.cancel();

			// Give tasks a moment to reach their next safe point
			tokio::time::sleep(std::time::Duration::from_millis(SHUTDOWN_GRACE_PERIOD_MS)).await;

			// DO NOT wait for blocking inference threads - they cannot be cancelled
			info!("✅ Exiting process (OS will clean up any remaining inference threads)");

			std::process::exit(0);
		}
	}
}

async fn wait_for_shutdown_signal() {
	let ctrl_c = async {
		signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
	};

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}

impl Worker {
	async fn run(self) -> Result<()> {
		let mut subscriber = self.nats_client.subscribe(TASK_COMMAND_SUBJECT).await?;

		info!("🎧 Subscribed to '{}', waiting for task commands...", TASK_COMMAND_SUBJECT);

		loop {
			tokio::select! {
				_ = self.cancellation_token.cancelled() => {
					info!("🛑 Task command loop cancelled");
					break;
				}
				maybe_message = subscriber.next() => {
					match maybe_message {
						Some(message) => self.dispatch(&message.payload).await,
						None => {
							error!("task command subscription closed");
							break;
						}
					}
				}
			}
		}

		Ok(())
	}

	async fn dispatch(&self, payload: &[u8]) {
		match queue::decode_command(payload) {
			Ok(TaskCommand::Transcribe {
				task_id,
				source_path,
				enqueued_at,
			}) => {
				// Spawn one handler per delivery; the slot pool does the
				// real bounding, so waiting tasks just park cheaply.
				let executor = Arc::clone(&self.executor);
				tokio::spawn(async move {
					executor.run(task_id, source_path, enqueued_at).await;
				});
			}
			Ok(TaskCommand::Cancel { task_id }) => {
				self.executor.cancel(task_id).await;
			}
			Err(e) => {
				warn!(error = %e, "undecodable task command; dropping");
				self.metrics.deliveries_rejected.add(1, &[]);
			}
		}
	}
}

fn init_observability_with_fallback(config: &Config) -> (Option<opentelemetry_sdk::metrics::SdkMeterProvider>, observability::WorkerMetrics) {
	// The OTLP exporters retry internally; if they cannot even be built we
	// continue with local-only metrics rather than refuse to start.
	match observability::init_observability(&config.service_name) {
		Ok((provider, metrics)) => {
			info!("✅ Observability initialized with OTLP export");
			(Some(provider), metrics)
		}
		Err(e) => {
			warn!(
				error = %e,
				"⚠️ OTLP observability failed to initialize, falling back to local metrics only"
			);
			warn!("   Traces and metrics will NOT be exported (service will continue)");

			let metrics = observability::create_local_metrics();
			(None, metrics)
		}
	}
}
