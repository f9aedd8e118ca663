use crate::types::{AE, UI};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Delivery state of a [`Payload`].
///
/// `Created -> Upload -> Notify -> (Completed | Abandoned)`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadState {
	/// The payload is still accepting instances.
	Created,
	/// Instances are waiting to be uploaded to the object store.
	Upload,
	/// Instances are uploaded, the workflow request is not published yet.
	Notify,
	Completed,
	Abandoned,
}

impl PayloadState {
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Abandoned)
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Created => "created",
			Self::Upload => "upload",
			Self::Notify => "notify",
			Self::Completed => "completed",
			Self::Abandoned => "abandoned",
		}
	}
}

impl Display for PayloadState {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The Study, Series and SOP Instance UID of a stored instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceUids {
	pub study_instance_uid: UI,
	pub series_instance_uid: UI,
	pub sop_instance_uid: UI,
}

/// An instance persisted to the temporary content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
	pub file_path: PathBuf,
	/// DICOM JSON sidecar without bulk data.
	pub metadata_path: PathBuf,
	/// Calling AE title.
	pub source: AE,
	/// Called AE title.
	pub destination: AE,
	pub size: u64,
	pub uids: Option<InstanceUids>,
	#[serde(default)]
	pub workflows: Vec<String>,
}

const UNNAMED_INSTANCE: &str = "instance.dcm";

impl FileRecord {
	/// Object key of the instance, relative to the payload.
	pub fn upload_path(&self) -> String {
		match &self.uids {
			Some(uids) => format!(
				"{}/{}/{}.dcm",
				uids.study_instance_uid, uids.series_instance_uid, uids.sop_instance_uid
			),
			None => {
				// Without UIDs the key follows the local path, so a retried upload overwrites
				// the same object instead of leaving a second copy behind.
				let key = self
					.file_path
					.components()
					.filter_map(|component| match component {
						Component::Normal(part) => Some(part.to_string_lossy()),
						_ => None,
					})
					.collect::<Vec<_>>()
					.join("/");
				if key.is_empty() {
					String::from(UNNAMED_INSTANCE)
				} else {
					key
				}
			}
		}
	}

	/// Object key of the metadata sidecar, relative to the payload.
	pub fn metadata_upload_path(&self) -> String {
		format!("{}.json", self.upload_path())
	}

	pub fn local_paths(&self) -> [&Path; 2] {
		[&self.file_path, &self.metadata_path]
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
	#[error("Payload {id} is in state {state} and no longer accepts files")]
	Sealed { id: Uuid, state: PayloadState },
}

/// A group of instances that is delivered as one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
	pub id: Uuid,
	/// The bucket key the payload was assembled under.
	pub key: String,
	pub correlation_id: String,
	pub created: DateTime<Utc>,
	/// Inactivity timeout of the bucket in seconds.
	pub timeout: u32,
	pub retry_count: u32,
	pub state: PayloadState,
	files: Vec<FileRecord>,
}

impl Payload {
	pub fn new(key: impl Into<String>, timeout: u32) -> Self {
		Self {
			id: Uuid::new_v4(),
			key: key.into(),
			correlation_id: Uuid::new_v4().to_string(),
			created: Utc::now(),
			timeout,
			retry_count: 0,
			state: PayloadState::Created,
			files: Vec::new(),
		}
	}

	/// Appends a file in arrival order.
	///
	/// Returns `Ok(false)` if a file with the same path is already part of the payload.
	pub fn add(&mut self, file: FileRecord) -> Result<bool, PayloadError> {
		if self.state != PayloadState::Created {
			return Err(PayloadError::Sealed {
				id: self.id,
				state: self.state,
			});
		}
		if self.contains(&file.file_path) {
			return Ok(false);
		}
		self.files.push(file);
		Ok(true)
	}

	pub fn contains(&self, path: &Path) -> bool {
		self.files.iter().any(|file| file.file_path == path)
	}

	pub fn files(&self) -> &[FileRecord] {
		&self.files
	}

	pub fn count(&self) -> usize {
		self.files.len()
	}

	/// Workflows of all files, in order of first appearance.
	pub fn workflows(&self) -> Vec<String> {
		let mut workflows: Vec<String> = Vec::new();
		for workflow in self.files.iter().flat_map(|file| &file.workflows) {
			if !workflows.contains(workflow) {
				workflows.push(workflow.clone());
			}
		}
		workflows
	}

	/// Moves the payload to the next phase and resets its retry budget.
	pub fn advance(&mut self, state: PayloadState) {
		self.state = state;
		self.retry_count = 0;
	}
}

#[cfg(test)]
pub(crate) fn file_record(path: &str) -> FileRecord {
	FileRecord {
		file_path: PathBuf::from(path),
		metadata_path: PathBuf::from(format!("{path}.json")),
		source: AE::from("STORESCU"),
		destination: AE::from("GATEWAY"),
		size: 128,
		uids: None,
		workflows: Vec::new(),
	}
}
