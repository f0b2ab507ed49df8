use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use uuid::Uuid;

/// The two phases a task passes through, in order. Both draw from the same
/// slot pool; the phase is a scheduling tag, not a sub-pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Preprocess,
	Infer,
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Preprocess => write!(f, "preprocess"),
			Self::Infer => write!(f, "infer"),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
	#[error("cancelled while waiting for a {0} slot")]
	Cancelled(Phase),
}

/// Hand-off ordering: earliest enqueue time wins, equal timestamps break by
/// task id so tests (and incident timelines) see one deterministic order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct WaiterKey {
	enqueued_at: DateTime<Utc>,
	task_id: Uuid,
}

struct Waiter {
	phase: Phase,
	grant: oneshot::Sender<()>,
}

struct PoolState {
	free: usize,
	waiters: BTreeMap<WaiterKey, Waiter>,
}

/// Fixed pool of execution slots bounding concurrent task phases.
///
/// Acquisition suspends the caller until a slot frees up; release is the
/// RAII drop of the [`SlotGuard`], so a slot can be neither double-released
/// nor leaked when a phase body errors or panics. Counters are only touched
/// under the internal lock; acquire and release are each one indivisible
/// step.
pub struct SlotPool {
	slots: usize,
	state: Mutex<PoolState>,
	high_water: AtomicUsize,
}

impl SlotPool {
	pub fn new(slots: usize) -> Arc<Self> {
		assert!(slots >= 1, "slot pool needs at least one slot");
		Arc::new(Self {
			slots,
			state: Mutex::new(PoolState {
				free: slots,
				waiters: BTreeMap::new(),
			}),
			high_water: AtomicUsize::new(0),
		})
	}

	/// Total slot count the pool was built with.
	pub fn slots(&self) -> usize {
		self.slots
	}

	/// Slots currently held (granted-but-unreleased included).
	pub fn in_use(&self) -> usize {
		self.slots - self.state.lock().expect("slot pool poisoned").free
	}

	/// Tasks parked waiting for a slot.
	pub fn waiting(&self) -> usize {
		self.state.lock().expect("slot pool poisoned").waiters.len()
	}

	/// Highest concurrent slot usage observed since startup.
	pub fn high_water_mark(&self) -> usize {
		self.high_water.load(Ordering::Relaxed)
	}

	/// Acquire a slot for one phase of `task_id`.
	///
	/// Suspends until a slot is free or `cancel` fires. When several tasks
	/// are waiting, the free slot goes to the earliest `enqueued_at`
	/// (task id breaking ties), regardless of phase.
	pub async fn acquire(self: &Arc<Self>, phase: Phase, task_id: Uuid, enqueued_at: DateTime<Utc>, cancel: &CancellationToken) -> Result<SlotGuard, AcquireError> {
		let key = WaiterKey { enqueued_at, task_id };

		let granted = {
			let mut state = self.state.lock().expect("slot pool poisoned");
			if state.free > 0 {
				state.free -= 1;
				self.high_water.fetch_max(self.slots - state.free, Ordering::Relaxed);
				None
			} else {
				let (grant, granted) = oneshot::channel();
				state.waiters.insert(key, Waiter { phase, grant });
				Some(granted)
			}
		};

		let Some(granted) = granted else {
			trace!(%task_id, %phase, "slot acquired immediately");
			return Ok(SlotGuard::new(Arc::clone(self), phase, task_id));
		};

		tokio::select! {
			outcome = granted => match outcome {
				Ok(()) => {
					trace!(%task_id, %phase, "slot handed off");
					Ok(SlotGuard::new(Arc::clone(self), phase, task_id))
				}
				// The pool vanished from under us; treat it like cancellation
				Err(_) => Err(AcquireError::Cancelled(phase)),
			},
			_ = cancel.cancelled() => {
				let already_granted = self.state.lock().expect("slot pool poisoned").waiters.remove(&key).is_none();
				if already_granted {
					// The grant raced the cancellation; hand the slot straight back
					drop(SlotGuard::new(Arc::clone(self), phase, task_id));
				}
				Err(AcquireError::Cancelled(phase))
			}
		}
	}

	fn release(&self, phase: Phase, task_id: Uuid) {
		let mut state = self.state.lock().expect("slot pool poisoned");

		// Hand the slot to the longest-waiting task. A waiter whose receiver
		// is gone (its future was dropped without cleanup) is skipped.
		while let Some(key) = state.waiters.keys().next().copied() {
			let waiter = state.waiters.remove(&key).expect("waiter key just observed");
			if waiter.grant.send(()).is_ok() {
				trace!(from_task = %task_id, from_phase = %phase, to_task = %key.task_id, to_phase = %waiter.phase, "slot transferred");
				return;
			}
		}

		state.free += 1;
		trace!(%task_id, %phase, free = state.free, "slot returned to pool");
	}
}

/// Execution lease for one phase of one task. Dropping it releases the
/// slot, exactly once, on every exit path.
pub struct SlotGuard {
	pool: Arc<SlotPool>,
	phase: Phase,
	task_id: Uuid,
}

impl SlotGuard {
	fn new(pool: Arc<SlotPool>, phase: Phase, task_id: Uuid) -> Self {
		Self { pool, phase, task_id }
	}

	pub fn phase(&self) -> Phase {
		self.phase
	}
}

impl Drop for SlotGuard {
	fn drop(&mut self) {
		self.pool.release(self.phase, self.task_id);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn ids(n: usize) -> Vec<Uuid> {
		(1..=n).map(|i| Uuid::from_u128(i as u128)).collect()
	}

	#[tokio::test]
	async fn test_never_exceeds_slot_count() {
		let pool = SlotPool::new(2);
		let cancel = CancellationToken::new();

		let mut handles = Vec::new();
		for id in ids(10) {
			let pool = Arc::clone(&pool);
			let cancel = cancel.clone();
			handles.push(tokio::spawn(async move {
				let slot = pool.acquire(Phase::Preprocess, id, Utc::now(), &cancel).await.unwrap();
				assert!(pool.in_use() <= pool.slots());
				tokio::time::sleep(Duration::from_millis(10)).await;
				drop(slot);
			}));
		}

		for handle in handles {
			handle.await.unwrap();
		}

		assert!(pool.high_water_mark() <= 2, "high water {} exceeded slot count", pool.high_water_mark());
		assert_eq!(pool.in_use(), 0);
		assert_eq!(pool.waiting(), 0);
	}

	#[tokio::test]
	async fn test_hand_off_is_fifo_by_enqueue_time() {
		let pool = SlotPool::new(1);
		let cancel = CancellationToken::new();

		let holder = pool.acquire(Phase::Preprocess, Uuid::from_u128(99), Utc::now(), &cancel).await.unwrap();

		let base = Utc::now();
		let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

		// Spawn waiters out of enqueue order: their enqueue times, not their
		// arrival at the pool, must decide who goes first.
		for offset_ms in [30i64, 10, 20] {
			let pool = Arc::clone(&pool);
			let cancel = cancel.clone();
			let order_tx = order_tx.clone();
			let enqueued_at = base + chrono::Duration::milliseconds(offset_ms);
			tokio::spawn(async move {
				let slot = pool.acquire(Phase::Infer, Uuid::new_v4(), enqueued_at, &cancel).await.unwrap();
				order_tx.send(offset_ms).unwrap();
				drop(slot);
			});
		}

		// Let all three park before releasing the held slot
		while pool.waiting() < 3 {
			tokio::time::sleep(Duration::from_millis(2)).await;
		}
		drop(holder);

		let mut granted = Vec::new();
		for _ in 0..3 {
			granted.push(order_rx.recv().await.unwrap());
		}
		assert_eq!(granted, vec![10, 20, 30]);
	}

	#[tokio::test]
	async fn test_equal_enqueue_times_break_by_task_id() {
		let pool = SlotPool::new(1);
		let cancel = CancellationToken::new();
		let holder = pool.acquire(Phase::Preprocess, Uuid::from_u128(99), Utc::now(), &cancel).await.unwrap();

		let enqueued_at = Utc::now();
		let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

		// Register in descending id order; grants must come back ascending
		for id in [3u128, 1, 2] {
			let pool = Arc::clone(&pool);
			let cancel = cancel.clone();
			let order_tx = order_tx.clone();
			tokio::spawn(async move {
				let slot = pool.acquire(Phase::Infer, Uuid::from_u128(id), enqueued_at, &cancel).await.unwrap();
				order_tx.send(id).unwrap();
				drop(slot);
			});
		}

		while pool.waiting() < 3 {
			tokio::time::sleep(Duration::from_millis(2)).await;
		}
		drop(holder);

		let mut granted = Vec::new();
		for _ in 0..3 {
			granted.push(order_rx.recv().await.unwrap());
		}
		assert_eq!(granted, vec![1, 2, 3]);
	}

	#[tokio::test]
	async fn test_cancelled_waiter_leaves_the_queue() {
		let pool = SlotPool::new(1);
		let cancel = CancellationToken::new();
		let holder = pool.acquire(Phase::Preprocess, Uuid::from_u128(1), Utc::now(), &cancel).await.unwrap();

		let waiter_cancel = CancellationToken::new();
		let waiter = {
			let pool = Arc::clone(&pool);
			let waiter_cancel = waiter_cancel.clone();
			tokio::spawn(async move { pool.acquire(Phase::Infer, Uuid::from_u128(2), Utc::now(), &waiter_cancel).await })
		};

		while pool.waiting() < 1 {
			tokio::time::sleep(Duration::from_millis(2)).await;
		}
		waiter_cancel.cancel();

		let outcome = waiter.await.unwrap();
		assert!(matches!(outcome, Err(AcquireError::Cancelled(Phase::Infer))));
		assert_eq!(pool.waiting(), 0);

		// The held slot is unaffected and still releases cleanly
		drop(holder);
		assert_eq!(pool.in_use(), 0);
	}

	#[tokio::test]
	async fn test_slot_is_released_when_the_phase_body_panics() {
		let pool = SlotPool::new(1);
		let cancel = CancellationToken::new();

		let crashed = {
			let pool = Arc::clone(&pool);
			let cancel = cancel.clone();
			tokio::spawn(async move {
				let _slot = pool.acquire(Phase::Preprocess, Uuid::from_u128(1), Utc::now(), &cancel).await.unwrap();
				panic!("phase body blew up");
			})
		};

		assert!(crashed.await.is_err());
		assert_eq!(pool.in_use(), 0, "panicked holder must not leak its slot");

		// And the pool still serves new acquisitions
		let slot = pool.acquire(Phase::Infer, Uuid::from_u128(2), Utc::now(), &cancel).await.unwrap();
		assert_eq!(pool.in_use(), 1);
		drop(slot);
		assert_eq!(pool.in_use(), 0);
	}

	#[tokio::test]
	async fn test_release_is_exactly_once_per_acquire() {
		let pool = SlotPool::new(2);
		let cancel = CancellationToken::new();

		let a = pool.acquire(Phase::Preprocess, Uuid::from_u128(1), Utc::now(), &cancel).await.unwrap();
		let b = pool.acquire(Phase::Infer, Uuid::from_u128(2), Utc::now(), &cancel).await.unwrap();
		assert_eq!(pool.in_use(), 2);

		drop(a);
		assert_eq!(pool.in_use(), 1);
		drop(b);
		assert_eq!(pool.in_use(), 0);
		assert_eq!(pool.high_water_mark(), 2);
	}
}
