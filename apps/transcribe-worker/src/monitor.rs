use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gpu;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
	Ram,
	Vram,
}

impl fmt::Display for ResourceKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Ram => write!(f, "ram"),
			Self::Vram => write!(f, "vram"),
		}
	}
}

/// One observation of memory usage. Ephemeral: only the current sample is
/// ever looked at, nothing is persisted.
#[derive(Debug, Clone)]
pub struct ResourceSample {
	pub taken_at: DateTime<Utc>,
	pub ram_used_ratio: f64,
	/// Absent when no GPU is visible; evaluated as "no GPU pressure".
	pub vram_used_ratio: Option<f64>,
}

/// A memory-pressure event. Strictly advisory: it never fails a task,
/// never blocks the pool, never throttles admission.
#[derive(Debug, Clone)]
pub struct PressureWarning {
	pub kind: ResourceKind,
	pub used_ratio: f64,
	pub threshold: f64,
	pub taken_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
	#[error("memory statistics unavailable: {0}")]
	Unavailable(String),
}

/// Source of resource samples. Injectable so tests can drive the monitor
/// with synthetic readings.
#[async_trait::async_trait]
pub trait ResourceSampler: Send + 'static {
	async fn sample(&mut self) -> Result<ResourceSample, SampleError>;
}

/// Production sampler: RAM from the OS, VRAM from the GPU probe.
pub struct SystemSampler {
	system: System,
}

impl SystemSampler {
	pub fn new() -> Self {
		Self { system: System::new() }
	}
}

impl Default for SystemSampler {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait::async_trait]
impl ResourceSampler for SystemSampler {
	async fn sample(&mut self) -> Result<ResourceSample, SampleError> {
		self.system.refresh_memory();
		let total = self.system.total_memory();
		if total == 0 {
			return Err(SampleError::Unavailable("total memory reported as zero".to_string()));
		}
		let used = total.saturating_sub(self.system.available_memory());
		let ram_used_ratio = used as f64 / total as f64;

		// Worst ratio across visible GPUs; the probe is best-effort and an
		// empty probe simply means no VRAM reading this interval.
		let vram_used_ratio = gpu::probe()
			.await
			.iter()
			.map(gpu::GpuMemory::used_ratio)
			.max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

		Ok(ResourceSample {
			taken_at: Utc::now(),
			ram_used_ratio,
			vram_used_ratio,
		})
	}
}

/// Compares samples against the configured warning ratios.
///
/// Yields at most one warning per resource kind per sample, which bounds
/// the warning rate to once per sampling interval per kind.
#[derive(Debug, Clone)]
pub struct ThresholdEvaluator {
	ram_warning_ratio: f64,
	vram_warning_ratio: f64,
}

impl ThresholdEvaluator {
	pub fn new(ram_warning_ratio: f64, vram_warning_ratio: f64) -> Self {
		Self {
			ram_warning_ratio,
			vram_warning_ratio,
		}
	}

	pub fn evaluate(&self, sample: &ResourceSample) -> Vec<PressureWarning> {
		let mut warnings = Vec::new();

		if sample.ram_used_ratio >= self.ram_warning_ratio {
			warnings.push(PressureWarning {
				kind: ResourceKind::Ram,
				used_ratio: sample.ram_used_ratio,
				threshold: self.ram_warning_ratio,
				taken_at: sample.taken_at,
			});
		}

		if let Some(vram_used_ratio) = sample.vram_used_ratio {
			if vram_used_ratio >= self.vram_warning_ratio {
				warnings.push(PressureWarning {
					kind: ResourceKind::Vram,
					used_ratio: vram_used_ratio,
					threshold: self.vram_warning_ratio,
					taken_at: sample.taken_at,
				});
			}
		}

		warnings
	}
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
	pub enabled: bool,
	pub interval: Duration,
	pub ram_warning_ratio: f64,
	pub vram_warning_ratio: f64,
}

impl MonitorConfig {
	pub fn from_config(config: &Config) -> Self {
		Self {
			enabled: config.monitoring_enabled,
			interval: Duration::from_secs(config.monitor_interval_secs),
			ram_warning_ratio: config.ram_warning_ratio,
			vram_warning_ratio: config.vram_warning_ratio,
		}
	}
}

/// Spawn the background monitor loop.
///
/// Warnings are delivered over the returned channel; the loop itself holds
/// no state shared with task execution. With monitoring disabled the loop
/// exits immediately and the channel closes without ever carrying a sample.
pub fn spawn<S: ResourceSampler>(config: MonitorConfig, mut sampler: S, cancel: CancellationToken) -> (JoinHandle<()>, mpsc::UnboundedReceiver<PressureWarning>) {
	let (events, receiver) = mpsc::unbounded_channel();

	let handle = tokio::spawn(async move {
		if !config.enabled {
			debug!("memory monitoring is disabled via configuration");
			return;
		}

		info!(
			interval_secs = config.interval.as_secs_f64(),
			ram_warning_ratio = config.ram_warning_ratio,
			vram_warning_ratio = config.vram_warning_ratio,
			"🩺 Memory monitor started"
		);

		let evaluator = ThresholdEvaluator::new(config.ram_warning_ratio, config.vram_warning_ratio);
		let mut ticker = tokio::time::interval(config.interval);

		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					info!("🛑 Memory monitor stopped");
					break;
				}
				_ = ticker.tick() => {
					match sampler.sample().await {
						Ok(sample) => {
							debug!(
								ram_used_ratio = format!("{:.3}", sample.ram_used_ratio),
								vram_used_ratio = sample.vram_used_ratio.map(|r| format!("{r:.3}")),
								"memory usage sample"
							);
							for warning in evaluator.evaluate(&sample) {
								if events.send(warning).is_err() {
									// Drain gone; nobody is listening anymore
									return;
								}
							}
						}
						Err(err) => {
							// Skip this interval; the loop must outlive a flaky probe
							warn!(error = %err, "resource sampling failed; skipping interval");
						}
					}
				}
			}
		}
	});

	(handle, receiver)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	struct FakeSampler {
		ram: f64,
		vram: Option<f64>,
		calls: Arc<AtomicUsize>,
		fail_first: bool,
	}

	#[async_trait::async_trait]
	impl ResourceSampler for FakeSampler {
		async fn sample(&mut self) -> Result<ResourceSample, SampleError> {
			let call = self.calls.fetch_add(1, Ordering::SeqCst);
			if self.fail_first && call == 0 {
				return Err(SampleError::Unavailable("probe went away".to_string()));
			}
			Ok(ResourceSample {
				taken_at: Utc::now(),
				ram_used_ratio: self.ram,
				vram_used_ratio: self.vram,
			})
		}
	}

	fn monitor_config(enabled: bool) -> MonitorConfig {
		MonitorConfig {
			enabled,
			interval: Duration::from_millis(20),
			ram_warning_ratio: 0.9,
			vram_warning_ratio: 0.9,
		}
	}

	#[test]
	fn test_evaluator_is_quiet_below_threshold() {
		let evaluator = ThresholdEvaluator::new(0.9, 0.9);
		let sample = ResourceSample {
			taken_at: Utc::now(),
			ram_used_ratio: 0.5,
			vram_used_ratio: Some(0.7),
		};
		assert!(evaluator.evaluate(&sample).is_empty());
	}

	#[test]
	fn test_evaluator_warns_at_threshold() {
		// "at or above": equality counts
		let evaluator = ThresholdEvaluator::new(0.9, 0.9);
		let sample = ResourceSample {
			taken_at: Utc::now(),
			ram_used_ratio: 0.9,
			vram_used_ratio: None,
		};
		let warnings = evaluator.evaluate(&sample);
		assert_eq!(warnings.len(), 1);
		assert_eq!(warnings[0].kind, ResourceKind::Ram);
	}

	#[test]
	fn test_evaluator_emits_one_warning_per_kind() {
		let evaluator = ThresholdEvaluator::new(0.9, 0.9);
		let sample = ResourceSample {
			taken_at: Utc::now(),
			ram_used_ratio: 0.95,
			vram_used_ratio: Some(0.99),
		};
		let warnings = evaluator.evaluate(&sample);
		assert_eq!(warnings.len(), 2);
		assert!(warnings.iter().any(|w| w.kind == ResourceKind::Ram));
		assert!(warnings.iter().any(|w| w.kind == ResourceKind::Vram));
	}

	#[test]
	fn test_missing_gpu_reading_means_no_vram_pressure() {
		let evaluator = ThresholdEvaluator::new(0.1, 0.1);
		let sample = ResourceSample {
			taken_at: Utc::now(),
			ram_used_ratio: 0.05,
			vram_used_ratio: None,
		};
		assert!(evaluator.evaluate(&sample).is_empty());
	}

	#[tokio::test]
	async fn test_exactly_one_warning_per_sampling_interval() {
		let calls = Arc::new(AtomicUsize::new(0));
		let sampler = FakeSampler {
			ram: 0.95,
			vram: None,
			calls: Arc::clone(&calls),
			fail_first: false,
		};

		let cancel = CancellationToken::new();
		let (handle, mut warnings) = spawn(monitor_config(true), sampler, cancel.clone());

		tokio::time::sleep(Duration::from_millis(90)).await;
		cancel.cancel();
		handle.await.unwrap();

		let mut received = 0;
		while warnings.try_recv().is_ok() {
			received += 1;
		}

		let samples_taken = calls.load(Ordering::SeqCst);
		assert!(samples_taken >= 2, "expected several sampling intervals, got {samples_taken}");
		// One warning per interval, not one per check
		assert_eq!(received, samples_taken);
	}

	#[tokio::test]
	async fn test_disabled_monitor_never_samples_or_warns() {
		let calls = Arc::new(AtomicUsize::new(0));
		let sampler = FakeSampler {
			ram: 0.99,
			vram: Some(0.99),
			calls: Arc::clone(&calls),
			fail_first: false,
		};

		let cancel = CancellationToken::new();
		let (handle, mut warnings) = spawn(monitor_config(false), sampler, cancel);

		handle.await.unwrap();
		tokio::time::sleep(Duration::from_millis(50)).await;

		assert_eq!(calls.load(Ordering::SeqCst), 0);
		assert!(warnings.recv().await.is_none(), "channel must close without warnings");
	}

	#[tokio::test]
	async fn test_sampling_failure_does_not_kill_the_loop() {
		let calls = Arc::new(AtomicUsize::new(0));
		let sampler = FakeSampler {
			ram: 0.95,
			vram: None,
			calls: Arc::clone(&calls),
			fail_first: true,
		};

		let cancel = CancellationToken::new();
		let (handle, mut warnings) = spawn(monitor_config(true), sampler, cancel.clone());

		tokio::time::sleep(Duration::from_millis(90)).await;
		cancel.cancel();
		handle.await.unwrap();

		// The first sample failed, later ones still produced warnings
		assert!(calls.load(Ordering::SeqCst) >= 2);
		assert!(warnings.try_recv().is_ok(), "loop must survive a failed sample");
	}
}
