use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::executor::CancelRegistry;
use crate::scheduler::SlotPool;

/// Global state for worker metrics and status
pub struct WorkerState {
	// Queue intake
	pub deliveries_received: AtomicU64,
	pub deliveries_duplicate: AtomicU64,

	// Task outcomes
	pub tasks_completed: AtomicU64,
	pub tasks_failed: AtomicU64,
	pub tasks_cancelled: AtomicU64,

	// Monitor
	pub pressure_warnings: AtomicU64,
}

impl Default for WorkerState {
	fn default() -> Self {
		Self {
			deliveries_received: AtomicU64::new(0),
			deliveries_duplicate: AtomicU64::new(0),
			tasks_completed: AtomicU64::new(0),
			tasks_failed: AtomicU64::new(0),
			tasks_cancelled: AtomicU64::new(0),
			pressure_warnings: AtomicU64::new(0),
		}
	}
}

impl WorkerState {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Register OpenTelemetry gauge callbacks.
	///
	/// Gauges read the slot pool and the in-flight registry directly; the
	/// hot path never writes a gauge.
	pub fn register_gauges(self: &Arc<Self>, pool: &Arc<SlotPool>, registry: &CancelRegistry) -> Result<()> {
		let meter = opentelemetry::global::meter("transcribe-worker");

		let pool_clone = Arc::clone(pool);
		let _slots_in_use_reg = meter
			.u64_observable_gauge("worker.slots.in_use")
			.with_callback(move |observer| {
				observer.observe(pool_clone.in_use() as u64, &[]);
			})
			.build();

		let pool_clone = Arc::clone(pool);
		let _slots_waiting_reg = meter
			.u64_observable_gauge("worker.slots.waiting")
			.with_callback(move |observer| {
				observer.observe(pool_clone.waiting() as u64, &[]);
			})
			.build();

		let registry_clone = registry.clone();
		let _in_flight_reg = meter
			.u64_observable_gauge("worker.tasks.in_flight")
			.with_callback(move |observer| {
				observer.observe(registry_clone.in_flight() as u64, &[]);
			})
			.build();

		let _heartbeat_reg = meter
			.u64_observable_gauge("worker.heartbeat")
			.with_callback(move |observer| {
				let timestamp = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs();
				observer.observe(timestamp, &[]);
			})
			.build();

		Ok(())
	}

	// Convenience methods
	pub fn record_duplicate_delivery(&self) {
		self.deliveries_duplicate.fetch_add(1, Ordering::Relaxed);
	}

	pub fn completed(&self) -> u64 {
		self.tasks_completed.load(Ordering::Relaxed)
	}

	pub fn failed(&self) -> u64 {
		self.tasks_failed.load(Ordering::Relaxed)
	}
}
