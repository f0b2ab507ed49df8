use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

pub const UPLOADS_SUBDIR: &str = "uploads";
pub const RESULTS_SUBDIR: &str = "results";

/// The storage area shared with the API tier: uploaded audio under
/// `<root>/uploads`, result artifacts under `<root>/results`.
#[derive(Debug, Clone)]
pub struct StorageLayout {
	root: PathBuf,
}

impl StorageLayout {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	/// Create the uploads and results areas if they do not exist yet.
	pub async fn ensure_dirs(&self) -> std::io::Result<()> {
		tokio::fs::create_dir_all(self.root.join(UPLOADS_SUBDIR)).await?;
		tokio::fs::create_dir_all(self.root.join(RESULTS_SUBDIR)).await?;
		Ok(())
	}

	/// Resolve the on-disk location of an uploaded file.
	///
	/// The API tier records paths in several historical shapes (absolute,
	/// rooted at the storage directory, rooted at `uploads/`, or a bare file
	/// name); all of them must resolve against this worker's storage root so
	/// that the two tiers can run with different working directories.
	pub fn resolve_upload(&self, file_path: &str) -> PathBuf {
		let candidate = Path::new(file_path);
		if candidate.is_absolute() {
			return candidate.to_path_buf();
		}

		// Already prefixed with the full storage root
		if let Ok(remainder) = candidate.strip_prefix(&self.root) {
			return self.root.join(remainder);
		}

		// Prefixed with the root's directory name, e.g. "storage/uploads/a.wav"
		if let Some(root_name) = self.root.file_name() {
			if let Ok(remainder) = candidate.strip_prefix(root_name) {
				return self.root.join(remainder);
			}
		}

		// Prefixed with the uploads area, e.g. "uploads/a.wav"
		if candidate.starts_with(UPLOADS_SUBDIR) {
			return self.root.join(candidate);
		}

		// Bare file name
		self.root.join(UPLOADS_SUBDIR).join(candidate)
	}

	/// Where the result artifact for `task_id` lives.
	pub fn result_path(&self, task_id: Uuid) -> PathBuf {
		self.root.join(RESULTS_SUBDIR).join(format!("{task_id}.txt"))
	}

	/// Persist a finished transcription and return its path.
	pub async fn write_result(&self, task_id: Uuid, contents: &str) -> std::io::Result<PathBuf> {
		let destination = self.result_path(task_id);
		if let Some(parent) = destination.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		tokio::fs::write(&destination, contents).await?;
		Ok(destination)
	}

	/// Best-effort removal of a partially written artifact after a failure.
	pub async fn discard_result(&self, task_id: Uuid) {
		let destination = self.result_path(task_id);
		if let Err(err) = tokio::fs::remove_file(&destination).await {
			if err.kind() != std::io::ErrorKind::NotFound {
				debug!(path = %destination.display(), error = %err, "could not remove partial result artifact");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn layout() -> StorageLayout {
		StorageLayout::new("/srv/scribe/storage")
	}

	#[test]
	fn test_absolute_paths_pass_through() {
		let resolved = layout().resolve_upload("/mnt/shared/uploads/a.wav");
		assert_eq!(resolved, PathBuf::from("/mnt/shared/uploads/a.wav"));
	}

	#[test]
	fn test_storage_root_prefix_is_collapsed() {
		// A relative path that already embeds the root's directory name
		let resolved = layout().resolve_upload("storage/uploads/a.wav");
		assert_eq!(resolved, PathBuf::from("/srv/scribe/storage/uploads/a.wav"));
	}

	#[test]
	fn test_uploads_prefix_is_rooted() {
		let resolved = layout().resolve_upload("uploads/a.wav");
		assert_eq!(resolved, PathBuf::from("/srv/scribe/storage/uploads/a.wav"));
	}

	#[test]
	fn test_bare_names_land_in_uploads() {
		let resolved = layout().resolve_upload("a.wav");
		assert_eq!(resolved, PathBuf::from("/srv/scribe/storage/uploads/a.wav"));
	}

	#[test]
	fn test_result_paths_are_keyed_by_task_id() {
		let id = Uuid::new_v4();
		let path = layout().result_path(id);
		assert_eq!(path, PathBuf::from(format!("/srv/scribe/storage/results/{id}.txt")));
	}

	#[tokio::test]
	async fn test_write_and_discard_result() {
		let dir = tempfile::tempdir().unwrap();
		let layout = StorageLayout::new(dir.path());
		let id = Uuid::new_v4();

		let path = layout.write_result(id, "hello").await.unwrap();
		assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "hello");

		layout.discard_result(id).await;
		assert!(!path.exists());

		// Discarding an artifact that never existed must be silent
		layout.discard_result(Uuid::new_v4()).await;
	}
}
