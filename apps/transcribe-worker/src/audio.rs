use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Sample rate the model expects
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Decode failure on the preprocess path. These are permanent input errors:
/// the task fails without retry and the source file is left untouched.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
	#[error("cannot read source audio {path}: {source}")]
	Unreadable {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("source audio {path} is empty")]
	Empty { path: PathBuf },

	#[error("malformed audio in {path}: {reason}")]
	Malformed { path: PathBuf, reason: String },
}

/// Uploaded audio decoded and normalized into the model's input form:
/// mono f32 PCM at [`TARGET_SAMPLE_RATE`].
#[derive(Debug, Clone)]
pub struct DecodedAudio {
	pub samples: Vec<f32>,
	pub sample_rate: u32,
	pub source_sample_rate: u32,
	pub source_channels: u16,
}

impl DecodedAudio {
	pub fn duration_secs(&self) -> f64 {
		self.samples.len() as f64 / f64::from(self.sample_rate)
	}
}

/// Decode a WAV upload into 16 kHz mono f32 samples.
///
/// Blocking; run it on the blocking thread pool, it is the CPU-bound half
/// of a task.
pub fn decode_wav(path: &Path) -> Result<DecodedAudio, AudioError> {
	let metadata = std::fs::metadata(path).map_err(|source| AudioError::Unreadable {
		path: path.to_path_buf(),
		source,
	})?;
	if metadata.len() == 0 {
		return Err(AudioError::Empty { path: path.to_path_buf() });
	}

	let file = std::fs::File::open(path).map_err(|source| AudioError::Unreadable {
		path: path.to_path_buf(),
		source,
	})?;
	let mut reader = hound::WavReader::new(BufReader::new(file)).map_err(|e| AudioError::Malformed {
		path: path.to_path_buf(),
		reason: e.to_string(),
	})?;

	let spec = reader.spec();
	let samples = read_samples(&mut reader, spec).map_err(|reason| AudioError::Malformed {
		path: path.to_path_buf(),
		reason,
	})?;
	if samples.is_empty() {
		return Err(AudioError::Malformed {
			path: path.to_path_buf(),
			reason: "no audio frames".to_string(),
		});
	}

	let mono = downmix(&samples, spec.channels);
	let resampled = resample_simple(&mono, spec.sample_rate, TARGET_SAMPLE_RATE);

	Ok(DecodedAudio {
		samples: resampled,
		sample_rate: TARGET_SAMPLE_RATE,
		source_sample_rate: spec.sample_rate,
		source_channels: spec.channels,
	})
}

fn read_samples<R: std::io::Read>(reader: &mut hound::WavReader<R>, spec: hound::WavSpec) -> Result<Vec<f32>, String> {
	match spec.sample_format {
		hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string()),
		hound::SampleFormat::Int => {
			// Normalize signed integer PCM to [-1.0, 1.0]
			let scale = f32::from(2u16).powi(i32::from(spec.bits_per_sample) - 1);
			reader
				.samples::<i32>()
				.map(|sample| sample.map(|v| v as f32 / scale).map_err(|e| e.to_string()))
				.collect()
		}
	}
}

fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
	if channels <= 1 {
		return samples.to_vec();
	}

	let channels = usize::from(channels);
	samples.chunks(channels).map(|frame| frame.iter().sum::<f32>() / frame.len() as f32).collect()
}

fn resample_simple(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
	if from_rate == to_rate {
		return samples.to_vec();
	}

	let ratio = from_rate as f32 / to_rate as f32;
	let output_len = (samples.len() as f32 / ratio) as usize;

	(0..output_len)
		.map(|i| {
			let src_idx = (i as f32 * ratio) as usize;
			samples.get(src_idx).copied().unwrap_or(0.0)
		})
		.collect()
}
