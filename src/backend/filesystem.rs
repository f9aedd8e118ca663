use crate::pipeline::services::{
	string_attribute, ContentStore, ContentStoreError, DicomInstance, StorageCapacity,
	StoredInstance,
};
use crate::pipeline::InstanceUids;
use async_trait::async_trait;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use dicom_json::DicomJson;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, instrument, trace};
use uuid::Uuid;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Writes received instances to `{root}/{endpoint}/{study}/{series}/{sop}.{unique}.dcm`.
///
/// Every save gets its own file, so a re-sent instance never overwrites a copy that an
/// earlier payload still has to upload. Each instance gets a DICOM JSON sidecar without
/// pixel data next to it.
pub struct FileSystemContentStore {
	root: PathBuf,
}

impl FileSystemContentStore {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}
}

#[async_trait]
impl ContentStore for FileSystemContentStore {
	#[instrument(skip_all, fields(endpoint = endpoint))]
	async fn save(
		&self,
		endpoint: &str,
		instance: Arc<DicomInstance>,
	) -> Result<StoredInstance, ContentStoreError> {
		let uids = InstanceUids {
			study_instance_uid: required(&instance, tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?,
			series_instance_uid: required(&instance, tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?,
			sop_instance_uid: required(&instance, tags::SOP_INSTANCE_UID, "SOPInstanceUID")?,
		};

		let directory = self
			.root
			.join(path_component(endpoint))
			.join(path_component(&uids.study_instance_uid))
			.join(path_component(&uids.series_instance_uid));
		let name = format!(
			"{}.{}",
			path_component(&uids.sop_instance_uid),
			Uuid::new_v4().simple()
		);
		let file_path = directory.join(format!("{name}.dcm"));
		let metadata_path = directory.join(format!("{name}.dcm.json"));

		let (file, metadata) = (file_path.clone(), metadata_path.clone());
		let size = tokio::task::spawn_blocking(move || write_instance(&instance, &file, &metadata))
			.await
			.map_err(|err| ContentStoreError::StorageWriteFailed {
				path: file_path.clone(),
				source: Box::new(err),
			})?
			.map_err(|source| ContentStoreError::StorageWriteFailed {
				path: file_path.clone(),
				source,
			})?;

		trace!(path = %file_path.display(), size, "Instance written to disk");
		Ok(StoredInstance {
			file_path,
			metadata_path,
			size,
			uids,
		})
	}
}

fn required(
	instance: &DicomInstance,
	tag: dicom::core::Tag,
	name: &'static str,
) -> Result<String, ContentStoreError> {
	string_attribute(instance, tag).ok_or(ContentStoreError::MissingAttribute(name))
}

/// Replaces everything that could escape the storage directory.
fn path_component(value: &str) -> String {
	let component: String = value
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
				c
			} else {
				'_'
			}
		})
		.collect();
	if component.is_empty() || component.chars().all(|c| c == '.') {
		return component.replace('.', "_") + "_";
	}
	component
}

fn write_instance(instance: &DicomInstance, file: &Path, metadata: &Path) -> Result<u64, BoxError> {
	if let Some(parent) = file.parent() {
		std::fs::create_dir_all(parent)?;
	}
	instance.write_to_file(file)?;

	let mut sidecar = InMemDicomObject::clone(instance);
	sidecar.remove_element(tags::PIXEL_DATA);
	let writer = BufWriter::new(File::create(metadata)?);
	serde_json::to_writer(writer, &DicomJson::from(sidecar))?;

	Ok(std::fs::metadata(file)?.len())
}

/// Free space of the volume that holds the temporary storage.
pub struct DiskCapacity {
	path: PathBuf,
	/// Maximum usage in percent.
	watermark: u8,
	reserved_bytes: u64,
}

impl DiskCapacity {
	pub fn new(path: impl Into<PathBuf>, watermark: u8, reserved_space_gb: u64) -> Self {
		Self {
			path: path.into(),
			watermark,
			reserved_bytes: reserved_space_gb.saturating_mul(1024 * 1024 * 1024),
		}
	}
}

impl StorageCapacity for DiskCapacity {
	fn has_space_available(&self) -> bool {
		let (available, total) = match (
			fs2::available_space(&self.path),
			fs2::total_space(&self.path),
		) {
			(Ok(available), Ok(total)) => (available, total),
			(Err(err), _) | (_, Err(err)) => {
				error!(path = %self.path.display(), "Unable to determine disk space: {err}");
				return false;
			}
		};
		if total == 0 {
			return false;
		}

		let used = total.saturating_sub(available);
		let usage = u128::from(used) * 100 / u128::from(total);
		available >= self.reserved_bytes && usage < u128::from(self.watermark)
	}

	fn available_bytes(&self) -> u64 {
		fs2::available_space(&self.path).unwrap_or_default()
	}
}
