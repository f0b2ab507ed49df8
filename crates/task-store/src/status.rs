use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Workflow status for transcription tasks.
///
/// The lifecycle is `PENDING → PROCESSING → {COMPLETED | FAILED}`, with
/// cancellation permitted from either non-terminal state. There is no edge
/// out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
	Pending,
	Processing,
	Completed,
	Failed,
	Cancelled,
}

impl TaskStatus {
	/// Returns true once a task can never change status again.
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
	}

	/// Whether `self -> to` is an edge of the status state machine.
	pub fn can_transition_to(self, to: Self) -> bool {
		match self {
			Self::Pending => matches!(to, Self::Processing | Self::Cancelled),
			Self::Processing => matches!(to, Self::Completed | Self::Failed | Self::Cancelled),
			// Terminal states are absorbing
			Self::Completed | Self::Failed | Self::Cancelled => false,
		}
	}

	/// Wire/database representation, matching the API tier's enum values.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "PENDING",
			Self::Processing => "PROCESSING",
			Self::Completed => "COMPLETED",
			Self::Failed => "FAILED",
			Self::Cancelled => "CANCELLED",
		}
	}
}

impl fmt::Display for TaskStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for TaskStatus {
	type Err = String;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw {
			"PENDING" => Ok(Self::Pending),
			"PROCESSING" => Ok(Self::Processing),
			"COMPLETED" => Ok(Self::Completed),
			"FAILED" => Ok(Self::Failed),
			"CANCELLED" => Ok(Self::Cancelled),
			other => Err(format!("unknown task status '{other}'")),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const ALL: [TaskStatus; 5] = [
		TaskStatus::Pending,
		TaskStatus::Processing,
		TaskStatus::Completed,
		TaskStatus::Failed,
		TaskStatus::Cancelled,
	];

	#[test]
	fn test_only_lifecycle_edges_are_legal() {
		let legal = [
			(TaskStatus::Pending, TaskStatus::Processing),
			(TaskStatus::Pending, TaskStatus::Cancelled),
			(TaskStatus::Processing, TaskStatus::Completed),
			(TaskStatus::Processing, TaskStatus::Failed),
			(TaskStatus::Processing, TaskStatus::Cancelled),
		];

		for from in ALL {
			for to in ALL {
				let expected = legal.contains(&(from, to));
				assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
			}
		}
	}

	#[test]
	fn test_terminal_states_are_absorbing() {
		for from in ALL.into_iter().filter(|s| s.is_terminal()) {
			for to in ALL {
				assert!(!from.can_transition_to(to), "{from} must not leave terminal state");
			}
		}
	}

	#[test]
	fn test_round_trips_through_wire_form() {
		for status in ALL {
			assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
		}
		assert!("RUNNING".parse::<TaskStatus>().is_err());
	}
}
