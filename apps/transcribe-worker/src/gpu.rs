use tokio::process::Command;
use tracing::debug;

/// Memory usage for a single visible GPU, in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMemory {
	pub index: u32,
	pub used_mb: u64,
	pub total_mb: u64,
}

impl GpuMemory {
	pub fn free_mb(&self) -> u64 {
		self.total_mb.saturating_sub(self.used_mb)
	}

	pub fn used_ratio(&self) -> f64 {
		if self.total_mb == 0 {
			return 0.0;
		}
		self.used_mb as f64 / self.total_mb as f64
	}
}

/// Query per-GPU memory usage via `nvidia-smi`.
///
/// Best-effort: a missing binary, a failing driver, or unparseable output
/// all yield an empty probe. Callers treat "no GPUs visible" and "cannot
/// ask" the same way.
pub async fn probe() -> Vec<GpuMemory> {
	let output = Command::new("nvidia-smi")
		.args(["--query-gpu=index,memory.used,memory.total", "--format=csv,noheader,nounits"])
		.output()
		.await;

	match output {
		Ok(output) if output.status.success() => parse_query_output(&String::from_utf8_lossy(&output.stdout)),
		Ok(output) => {
			debug!(status = %output.status, "nvidia-smi exited unsuccessfully; assuming no GPUs");
			Vec::new()
		}
		Err(err) => {
			debug!(error = %err, "nvidia-smi unavailable; assuming no GPUs");
			Vec::new()
		}
	}
}

fn parse_query_output(stdout: &str) -> Vec<GpuMemory> {
	let mut gpus = Vec::new();
	for line in stdout.trim().lines() {
		let parts: Vec<&str> = line.split(',').map(str::trim).filter(|part| !part.is_empty()).collect();
		if parts.len() != 3 {
			continue;
		}
		let (Ok(index), Ok(used_mb), Ok(total_mb)) = (parts[0].parse(), parts[1].parse(), parts[2].parse()) else {
			continue;
		};
		gpus.push(GpuMemory { index, used_mb, total_mb });
	}
	gpus
}
