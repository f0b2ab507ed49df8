use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Subject the API tier publishes task commands on.
pub const TASK_COMMAND_SUBJECT: &str = "tasks.worker";

const CONNECT_MAX_RETRIES: u32 = 5;
const CONNECT_INITIAL_BACKOFF_MS: u64 = 500;

/// Commands delivered over the queue.
///
/// The broker is an external at-least-once channel: commands may arrive
/// more than once and the handlers must stay idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskCommand {
	/// Run one transcription job.
	Transcribe {
		task_id: Uuid,
		source_path: String,
		/// When the job entered the queue; drives FIFO slot hand-off.
		/// Producers that omit it get receipt time.
		#[serde(default = "Utc::now")]
		enqueued_at: DateTime<Utc>,
	},
	/// Cooperatively cancel a queued or running job.
	Cancel { task_id: Uuid },
}

/// Decode one queue payload.
pub fn decode_command(payload: &[u8]) -> Result<TaskCommand, serde_json::Error> {
	serde_json::from_slice(payload)
}

/// Connect to the broker, retrying with exponential backoff.
///
/// Startup-only: once connected, the client reconnects on its own; if the
/// broker is unreachable after the retry budget the worker cannot start.
pub async fn connect_with_retry(url: &str) -> Result<async_nats::Client> {
	for attempt in 1..=CONNECT_MAX_RETRIES {
		match async_nats::connect(url).await {
			Ok(client) => {
				info!(url = %url, "✅ Connected to NATS");
				return Ok(client);
			}
			Err(e) => {
				if attempt == CONNECT_MAX_RETRIES {
					error!(
						error = %e,
						url = %url,
						"❌ Failed to connect to NATS after {} attempts - worker cannot start",
						CONNECT_MAX_RETRIES
					);
					return Err(e.into());
				}

				let backoff = CONNECT_INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
				warn!(
					attempt,
					max_retries = CONNECT_MAX_RETRIES,
					backoff_ms = backoff,
					error = %e,
					"⚠️ NATS connection failed, retrying..."
				);

				tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
			}
		}
	}

	unreachable!()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_decodes_transcribe_commands() {
		let id = Uuid::new_v4();
		let payload = format!(r#"{{"op":"transcribe","task_id":"{id}","source_path":"uploads/a.wav","enqueued_at":"2026-08-01T12:00:00Z"}}"#);

		let command = decode_command(payload.as_bytes()).unwrap();
		match command {
			TaskCommand::Transcribe { task_id, source_path, enqueued_at } => {
				assert_eq!(task_id, id);
				assert_eq!(source_path, "uploads/a.wav");
				assert_eq!(enqueued_at.to_rfc3339(), "2026-08-01T12:00:00+00:00");
			}
			other => panic!("unexpected command {other:?}"),
		}
	}

	#[test]
	fn test_enqueued_at_defaults_to_receipt_time() {
		let id = Uuid::new_v4();
		let payload = format!(r#"{{"op":"transcribe","task_id":"{id}","source_path":"a.wav"}}"#);

		let before = Utc::now();
		let command = decode_command(payload.as_bytes()).unwrap();
		let TaskCommand::Transcribe { enqueued_at, .. } = command else {
			panic!("expected transcribe");
		};
		assert!(enqueued_at >= before && enqueued_at <= Utc::now());
	}

	#[test]
	fn test_decodes_cancel_commands() {
		let id = Uuid::new_v4();
		let payload = format!(r#"{{"op":"cancel","task_id":"{id}"}}"#);

		let command = decode_command(payload.as_bytes()).unwrap();
		assert!(matches!(command, TaskCommand::Cancel { task_id } if task_id == id));
	}

	#[test]
	fn test_rejects_unknown_payloads() {
		assert!(decode_command(b"not json").is_err());
		assert!(decode_command(br#"{"op":"reboot"}"#).is_err());
	}

	#[test]
	fn test_round_trips_through_json() {
		let command = TaskCommand::Transcribe {
			task_id: Uuid::new_v4(),
			source_path: "uploads/a.wav".to_string(),
			enqueued_at: Utc::now(),
		};
		let encoded = serde_json::to_vec(&command).unwrap();
		let decoded = decode_command(&encoded).unwrap();
		assert!(matches!(decoded, TaskCommand::Transcribe { .. }));
	}
}
