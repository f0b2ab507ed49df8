use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::config::Config;
use crate::gpu::{self, GpuMemory};

/// Free VRAM a GPU must offer before auto-select will pick it over the CPU.
const MIN_FREE_VRAM_MB: u64 = 1024;

/// Everything the bootstrapper needs to resolve and load the model once.
#[derive(Debug, Clone)]
pub struct ModelConfig {
	pub model_name: String,
	pub models_dir: PathBuf,
	pub device_index: Option<u32>,
	pub compute_type: String,
	pub load_in_8bit: bool,
	pub threads: i32,
}

impl ModelConfig {
	pub fn from_config(config: &Config) -> Self {
		Self {
			model_name: config.model_name.clone(),
			models_dir: config.models_dir.clone(),
			device_index: config.device_index,
			compute_type: config.compute_type.clone(),
			load_in_8bit: config.load_in_8bit,
			threads: config.whisper_threads,
		}
	}
}

/// The compute device the model ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
	Cpu,
	Gpu(u32),
}

impl fmt::Display for Device {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Cpu => write!(f, "cpu"),
			Self::Gpu(index) => write!(f, "gpu:{index}"),
		}
	}
}

/// Identity of the loaded model, fixed for the process lifetime. Changing
/// any of these requires a restart; the handle is never rebuilt in place.
#[derive(Debug, Clone)]
pub struct ModelFingerprint {
	pub model_name: String,
	pub compute_type: String,
	pub quantized: bool,
	pub device: Device,
}

/// Startup failures. All of them are deployment configuration errors: the
/// process refuses to start and nothing retries.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
	#[error("model file {0} does not exist; check TRANSCRIPTION_MODEL_NAME / TRANSCRIPTION_MODELS_DIR")]
	ModelFileMissing(PathBuf),

	#[error("requested GPU device {requested} but {visible} device(s) are visible")]
	DeviceNotFound { requested: u32, visible: usize },

	#[error("failed to load model: {0}")]
	Load(String),
}

/// Inference failures, reported per task.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
	#[error("failed to create decode state: {0}")]
	State(String),

	#[error("transcription failed: {0}")]
	Inference(String),
}

/// The opaque inference capability: audio samples in, text out.
///
/// Implemented by the whisper-backed engine in production and by fakes in
/// tests; the executor only ever sees this trait behind an `Arc`, so the
/// singleton stays explicit instead of ambient.
pub trait TranscriptionEngine: Send + Sync + 'static {
	fn fingerprint(&self) -> &ModelFingerprint;

	/// Transcribe 16 kHz mono f32 samples. Blocking; call it from the
	/// blocking thread pool. Safe to interleave across threads: every call
	/// gets its own decode state.
	fn transcribe(&self, samples: &[f32]) -> Result<String, EngineError>;
}

/// whisper.cpp-backed engine holding the context for the process lifetime.
pub struct WhisperEngine {
	ctx: WhisperContext,
	fingerprint: ModelFingerprint,
	threads: i32,
}

/// Load the model exactly once, before the scheduler accepts work.
pub async fn load(config: &ModelConfig) -> Result<WhisperEngine, BootstrapError> {
	let model_path = resolve_model_file(config)?;
	let device = select_device(config.device_index, &gpu::probe().await)?;

	let fingerprint = ModelFingerprint {
		model_name: config.model_name.clone(),
		compute_type: config.compute_type.clone(),
		quantized: config.load_in_8bit,
		device,
	};

	info!(
		model = %config.model_name,
		path = %model_path.display(),
		device = %device,
		compute_type = %config.compute_type,
		quantized = config.load_in_8bit,
		"🔄 Loading transcription model..."
	);
	let start = Instant::now();

	let mut ctx_params = WhisperContextParameters::default();
	match device {
		Device::Gpu(index) => {
			ctx_params.use_gpu(true).gpu_device(index as i32);
		}
		Device::Cpu => {
			ctx_params.use_gpu(false);
		}
	}

	let ctx = WhisperContext::new_with_params(&model_path.to_string_lossy(), ctx_params).map_err(|e| BootstrapError::Load(e.to_string()))?;

	info!(load_time_ms = start.elapsed().as_millis(), "✅ Transcription model loaded");

	Ok(WhisperEngine {
		ctx,
		fingerprint,
		threads: config.threads,
	})
}

/// Map the model identifier to a ggml file.
///
/// A bare name like `base` resolves to `ggml-base.bin` (or the `q8_0`
/// variant when quantized loading is on) under the models directory; an
/// identifier containing a separator or a `.bin` suffix is taken as a path.
fn resolve_model_file(config: &ModelConfig) -> Result<PathBuf, BootstrapError> {
	let name = config.model_name.as_str();
	let path = if name.contains(std::path::MAIN_SEPARATOR) || name.ends_with(".bin") {
		PathBuf::from(name)
	} else if config.load_in_8bit {
		config.models_dir.join(format!("ggml-{name}-q8_0.bin"))
	} else {
		config.models_dir.join(format!("ggml-{name}.bin"))
	};

	if !path.exists() {
		return Err(BootstrapError::ModelFileMissing(path));
	}
	Ok(path)
}

/// Pick the compute device.
///
/// An explicit index must exist among the visible GPUs. Auto-select takes
/// the GPU with the most free memory, provided it clears the
/// [`MIN_FREE_VRAM_MB`] floor; otherwise the CPU.
fn select_device(requested: Option<u32>, gpus: &[GpuMemory]) -> Result<Device, BootstrapError> {
	match requested {
		Some(index) => {
			if gpus.iter().any(|gpu| gpu.index == index) {
				Ok(Device::Gpu(index))
			} else {
				Err(BootstrapError::DeviceNotFound {
					requested: index,
					visible: gpus.len(),
				})
			}
		}
		None => {
			let best = gpus.iter().max_by_key(|gpu| gpu.free_mb());
			match best {
				Some(gpu) if gpu.free_mb() >= MIN_FREE_VRAM_MB => Ok(Device::Gpu(gpu.index)),
				_ => Ok(Device::Cpu),
			}
		}
	}
}

impl TranscriptionEngine for WhisperEngine {
	fn fingerprint(&self) -> &ModelFingerprint {
		&self.fingerprint
	}

	fn transcribe(&self, samples: &[f32]) -> Result<String, EngineError> {
		let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
		params.set_translate(false);
		params.set_print_special(false);
		params.set_print_progress(false);
		params.set_print_realtime(false);
		params.set_print_timestamps(false);
		params.set_n_threads(self.threads);

		let mut state = self.ctx.create_state().map_err(|e| EngineError::State(e.to_string()))?;
		state.full(params, samples).map_err(|e| EngineError::Inference(e.to_string()))?;

		let num_segments = state.full_n_segments();
		let mut segments = Vec::new();
		for i in 0..num_segments {
			if let Some(segment) = state.get_segment(i) {
				if let Ok(text) = segment.to_str() {
					let trimmed = text.trim();
					if !trimmed.is_empty() {
						segments.push(trimmed.to_string());
					}
				}
			}
		}

		Ok(segments.join("\n"))
	}
}
