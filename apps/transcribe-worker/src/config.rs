use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "transcribe-worker")]
#[command(about = "Queue-driven audio transcription worker", long_about = None)]
pub struct Config {
	/// NATS server URL
	#[arg(long, env = "NATS_URL", default_value = "nats://localhost:4222")]
	pub nats_url: String,

	/// Task database shared with the API tier
	#[arg(long, env = "DATABASE_URL", default_value = "sqlite://storage/tasks.db")]
	pub database_url: String,

	/// Storage root shared with the API tier; uploads/ and results/ live under it
	#[arg(long, env = "STORAGE_ROOT", default_value = "./storage")]
	pub storage_root: PathBuf,

	/// Model identifier: a bare whisper model name or an explicit ggml file path
	#[arg(long, env = "TRANSCRIPTION_MODEL_NAME", default_value = "base")]
	pub model_name: String,

	/// Directory holding ggml model files
	#[arg(long, env = "TRANSCRIPTION_MODELS_DIR", default_value = "./models")]
	pub models_dir: PathBuf,

	/// GPU device index; omit to auto-select the device with the most free memory
	#[arg(long, env = "TRANSCRIPTION_DEVICE_INDEX")]
	pub device_index: Option<u32>,

	/// Compute precision hint, recorded in the model fingerprint
	#[arg(long, env = "TRANSCRIPTION_COMPUTE_TYPE", default_value = "default")]
	pub compute_type: String,

	/// Load the quantized (q8_0) model variant to reduce memory footprint
	#[arg(long, env = "TRANSCRIPTION_LOAD_IN_8BIT", default_value_t = false, action = clap::ArgAction::Set)]
	pub load_in_8bit: bool,

	/// Number of threads for whisper inference
	#[arg(long, env = "WHISPER_THREADS", default_value = "2")]
	pub whisper_threads: i32,

	/// Concurrency slots shared by the preprocess and inference phases
	#[arg(long, env = "TASK_SLOTS", default_value = "2")]
	pub task_slots: usize,

	/// Memory monitor sampling interval in seconds
	#[arg(long, env = "MEMORY_MONITOR_INTERVAL_SECONDS", default_value = "30")]
	pub monitor_interval_secs: u64,

	/// RAM usage ratio at or above which a pressure warning is emitted
	#[arg(long, env = "MEMORY_MONITOR_RAM_RATIO", default_value = "0.9")]
	pub ram_warning_ratio: f64,

	/// VRAM usage ratio at or above which a pressure warning is emitted
	#[arg(long, env = "MEMORY_MONITOR_VRAM_RATIO", default_value = "0.9")]
	pub vram_warning_ratio: f64,

	/// Toggle the background memory monitor
	#[arg(long, env = "ENABLE_MEMORY_MONITORING", default_value_t = true, action = clap::ArgAction::Set)]
	pub monitoring_enabled: bool,

	/// Service name for observability
	#[arg(long, env = "OTEL_SERVICE_NAME", default_value = "transcribe-worker")]
	pub service_name: String,
}

impl Config {
	/// Validate configuration values
	pub fn validate(&self) -> Result<(), String> {
		if self.task_slots < 1 {
			return Err("task_slots must be at least 1".to_string());
		}

		if self.whisper_threads < 1 {
			return Err("whisper_threads must be at least 1".to_string());
		}

		if self.monitor_interval_secs == 0 {
			return Err("monitor_interval_secs must be greater than 0".to_string());
		}

		if !(0.0..=1.0).contains(&self.ram_warning_ratio) || self.ram_warning_ratio == 0.0 {
			return Err("ram_warning_ratio must be within (0.0, 1.0]".to_string());
		}

		if !(0.0..=1.0).contains(&self.vram_warning_ratio) || self.vram_warning_ratio == 0.0 {
			return Err("vram_warning_ratio must be within (0.0, 1.0]".to_string());
		}

		Ok(())
	}
}
