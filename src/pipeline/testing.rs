//! In-memory collaborators for pipeline tests.

use crate::pipeline::message::BrokerMessage;
use crate::pipeline::payload::{FileRecord, InstanceUids, Payload};
use crate::pipeline::services::{
	string_attribute, BrokerPublisher, CleanupQueue, ContentStore, ContentStoreError,
	DicomInstance, ObjectStore, ObjectStoreError, PublishError, PutObject, StorageCapacity,
	StoreError, StoredInstance, WorkItemStore,
};
use async_trait::async_trait;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Builds a minimal instance with the given UIDs.
pub fn instance(sop_class_uid: &str, study: &str, series: &str, sop: &str) -> Arc<DicomInstance> {
	let object = InMemDicomObject::from_element_iter([
		DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
		DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop)),
		DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, study)),
		DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, series)),
		DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "PAT-1")),
	]);
	let meta = FileMetaTableBuilder::new()
		.media_storage_sop_class_uid(sop_class_uid)
		.media_storage_sop_instance_uid(sop)
		.transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
		.build()
		.unwrap();
	Arc::new(object.with_exact_meta(meta))
}

/// Polls `condition` with the (paused) tokio clock until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
	for _ in 0..10_000 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition was not met in time");
}

#[derive(Default)]
pub struct MemoryStore {
	payloads: Mutex<HashMap<Uuid, Payload>>,
	failing_upserts: AtomicU32,
	upserts: AtomicU32,
	deletes: AtomicU32,
}

impl MemoryStore {
	pub fn insert(&self, payload: Payload) {
		self.payloads.lock().unwrap().insert(payload.id, payload);
	}

	pub fn get(&self, id: Uuid) -> Option<Payload> {
		self.payloads.lock().unwrap().get(&id).cloned()
	}

	pub fn all(&self) -> Vec<Payload> {
		self.payloads.lock().unwrap().values().cloned().collect()
	}

	/// The next `count` upserts fail.
	pub fn fail_upserts(&self, count: u32) {
		self.failing_upserts.store(count, Ordering::SeqCst);
	}

	pub fn upsert_calls(&self) -> u32 {
		self.upserts.load(Ordering::SeqCst)
	}

	pub fn delete_calls(&self) -> u32 {
		self.deletes.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl WorkItemStore for MemoryStore {
	async fn upsert(&self, payload: &Payload) -> Result<(), StoreError> {
		self.upserts.fetch_add(1, Ordering::SeqCst);
		let failing = self
			.failing_upserts
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
		if failing.is_ok() {
			return Err(StoreError::Database(String::from("database is locked")));
		}
		self.insert(payload.clone());
		Ok(())
	}

	async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
		self.deletes.fetch_add(1, Ordering::SeqCst);
		self.payloads.lock().unwrap().remove(&id);
		Ok(())
	}

	async fn list_non_terminal(&self) -> Result<Vec<Payload>, StoreError> {
		Ok(self
			.all()
			.into_iter()
			.filter(|payload| !payload.state.is_terminal())
			.collect())
	}
}

#[derive(Default)]
pub struct MemoryContentStore {
	saved: AtomicUsize,
}

impl MemoryContentStore {
	pub fn saved(&self) -> usize {
		self.saved.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl ContentStore for MemoryContentStore {
	async fn save(
		&self,
		endpoint: &str,
		instance: Arc<DicomInstance>,
	) -> Result<StoredInstance, ContentStoreError> {
		let read = |tag, name| string_attribute(&instance, tag).ok_or(ContentStoreError::MissingAttribute(name));
		let uids = InstanceUids {
			study_instance_uid: read(tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?,
			series_instance_uid: read(tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?,
			sop_instance_uid: read(tags::SOP_INSTANCE_UID, "SOPInstanceUID")?,
		};
		self.saved.fetch_add(1, Ordering::SeqCst);
		let file_path = PathBuf::from(format!("/memory/{endpoint}/{}.dcm", uids.sop_instance_uid));
		Ok(StoredInstance {
			metadata_path: file_path.with_extension("dcm.json"),
			file_path,
			size: 1024,
			uids,
		})
	}
}

pub struct FixedCapacity {
	available: AtomicBool,
}

impl FixedCapacity {
	pub fn new(available: bool) -> Self {
		Self {
			available: AtomicBool::new(available),
		}
	}

	pub fn set(&self, available: bool) {
		self.available.store(available, Ordering::SeqCst);
	}
}

impl StorageCapacity for FixedCapacity {
	fn has_space_available(&self) -> bool {
		self.available.load(Ordering::SeqCst)
	}

	fn available_bytes(&self) -> u64 {
		if self.has_space_available() {
			u64::MAX
		} else {
			0
		}
	}
}

/// Records uploads. Scripted failures are returned first, in order.
#[derive(Default)]
pub struct RecordingObjectStore {
	puts: Mutex<Vec<PutObject>>,
	failures: Mutex<VecDeque<ObjectStoreError>>,
	always_fail: Mutex<Option<bool>>,
	latency: Mutex<Duration>,
	active: AtomicUsize,
	max_active: AtomicUsize,
	attempts: AtomicUsize,
}

impl RecordingObjectStore {
	pub fn fail_with(&self, error: ObjectStoreError) {
		self.failures.lock().unwrap().push_back(error);
	}

	/// Every upload fails with a transient (`true`) or permanent (`false`) error.
	pub fn always_fail(&self, transient: bool) {
		*self.always_fail.lock().unwrap() = Some(transient);
	}

	pub fn set_latency(&self, latency: Duration) {
		*self.latency.lock().unwrap() = latency;
	}

	pub fn puts(&self) -> Vec<PutObject> {
		self.puts.lock().unwrap().clone()
	}

	pub fn attempts(&self) -> usize {
		self.attempts.load(Ordering::SeqCst)
	}

	/// Highest number of uploads that were running at the same time.
	pub fn max_active(&self) -> usize {
		self.max_active.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl ObjectStore for RecordingObjectStore {
	async fn put_object(&self, request: PutObject) -> Result<(), ObjectStoreError> {
		self.attempts.fetch_add(1, Ordering::SeqCst);
		let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
		self.max_active.fetch_max(active, Ordering::SeqCst);
		let latency = *self.latency.lock().unwrap();
		if !latency.is_zero() {
			tokio::time::sleep(latency).await;
		}
		self.active.fetch_sub(1, Ordering::SeqCst);

		if let Some(error) = self.failures.lock().unwrap().pop_front() {
			return Err(error);
		}
		match *self.always_fail.lock().unwrap() {
			Some(true) => return Err(ObjectStoreError::Transient(String::from("connection reset"))),
			Some(false) => return Err(ObjectStoreError::Permanent(String::from("NoSuchBucket"))),
			None => {}
		}
		self.puts.lock().unwrap().push(request);
		Ok(())
	}
}

#[derive(Default)]
pub struct RecordingPublisher {
	messages: Mutex<Vec<(String, BrokerMessage)>>,
	failures: Mutex<VecDeque<PublishError>>,
	attempts: AtomicUsize,
}

impl RecordingPublisher {
	pub fn fail_with(&self, error: PublishError) {
		self.failures.lock().unwrap().push_back(error);
	}

	pub fn messages(&self) -> Vec<(String, BrokerMessage)> {
		self.messages.lock().unwrap().clone()
	}

	pub fn attempts(&self) -> usize {
		self.attempts.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl BrokerPublisher for RecordingPublisher {
	async fn publish(&self, topic: &str, message: &BrokerMessage) -> Result<(), PublishError> {
		self.attempts.fetch_add(1, Ordering::SeqCst);
		if let Some(error) = self.failures.lock().unwrap().pop_front() {
			return Err(error);
		}
		self.messages
			.lock()
			.unwrap()
			.push((topic.to_owned(), message.clone()));
		Ok(())
	}
}

#[derive(Default)]
pub struct RecordingCleanup {
	files: Mutex<Vec<FileRecord>>,
}

impl RecordingCleanup {
	pub fn files(&self) -> Vec<FileRecord> {
		self.files.lock().unwrap().clone()
	}
}

impl CleanupQueue for RecordingCleanup {
	fn enqueue(&self, file: FileRecord) {
		self.files.lock().unwrap().push(file);
	}
}
