use crate::pipeline::services::CleanupQueue;
use crate::pipeline::FileRecord;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deletes local copies of delivered instances in the background.
///
/// Directories that become empty are removed as well, up to the storage root.
pub struct FileCleanupQueue {
	sender: mpsc::UnboundedSender<FileRecord>,
}

impl FileCleanupQueue {
	pub fn spawn(root: impl Into<PathBuf>, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
		let (sender, mut receiver) = mpsc::unbounded_channel::<FileRecord>();
		let root = root.into();

		let handle = tokio::spawn(async move {
			loop {
				let file = tokio::select! {
					() = cancel.cancelled() => break,
					file = receiver.recv() => match file {
						Some(file) => file,
						None => break,
					},
				};
				remove(&root, &file).await;
			}
			info!(
				pending = receiver.len(),
				"Stopped cleanup of delivered instances"
			);
		});

		(Self { sender }, handle)
	}
}

impl CleanupQueue for FileCleanupQueue {
	fn enqueue(&self, file: FileRecord) {
		if let Err(err) = self.sender.send(file) {
			warn!(path = %err.0.file_path.display(), "Cleanup queue is closed, keeping file");
		}
	}
}

async fn remove(root: &Path, file: &FileRecord) {
	for path in file.local_paths() {
		match tokio::fs::remove_file(path).await {
			Ok(()) => debug!(path = %path.display(), "Removed delivered file"),
			Err(err) if err.kind() == ErrorKind::NotFound => {}
			Err(err) => warn!(path = %path.display(), "Failed to remove delivered file: {err}"),
		}
	}

	let mut directory = file.file_path.parent();
	while let Some(current) = directory {
		if current == root || !current.starts_with(root) {
			break;
		}
		// Fails for directories that still have entries.
		if tokio::fs::remove_dir(current).await.is_err() {
			break;
		}
		directory = current.parent();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pipeline::file_record;
	use std::time::Duration;

	async fn wait_until(condition: impl Fn() -> bool) {
		for _ in 0..500 {
			if condition() {
				return;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("condition was not met in time");
	}

	fn create(path: &Path) {
		std::fs::create_dir_all(path.parent().unwrap()).unwrap();
		std::fs::write(path, b"DICM").unwrap();
	}

	#[tokio::test]
	async fn removes_files_and_empty_directories() {
		let dir = tempfile::tempdir().unwrap();
		let root = dir.path().to_path_buf();
		let series = root.join("ct/1.2/1.2.3");

		let first = file_record(series.join("1.dcm").to_str().unwrap());
		let second = file_record(series.join("2.dcm").to_str().unwrap());
		for file in [&first, &second] {
			for path in file.local_paths() {
				create(path);
			}
		}

		let cancel = CancellationToken::new();
		let (queue, handle) = FileCleanupQueue::spawn(&root, cancel.clone());

		queue.enqueue(first.clone());
		wait_until(|| !first.file_path.exists()).await;
		assert!(!first.metadata_path.exists());
		assert!(series.exists(), "directory with remaining files is kept");

		queue.enqueue(second.clone());
		wait_until(|| !root.join("ct").exists()).await;
		assert!(root.exists());

		cancel.cancel();
		handle.await.unwrap();
	}

	#[tokio::test]
	async fn missing_files_are_ignored() {
		let dir = tempfile::tempdir().unwrap();
		let cancel = CancellationToken::new();
		let (queue, handle) = FileCleanupQueue::spawn(dir.path(), cancel.clone());

		let missing = file_record(dir.path().join("gone.dcm").to_str().unwrap());
		queue.enqueue(missing);
		drop(queue);

		// Dropping the queue closes the channel and ends the task.
		handle.await.unwrap();
		assert!(dir.path().exists());
	}
}
