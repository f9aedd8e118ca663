//! Interfaces of the collaborators the pipeline depends on.
//! Implementations live in [`crate::backend`].

use crate::pipeline::payload::{FileRecord, InstanceUids, Payload};
use crate::pipeline::message::BrokerMessage;
use crate::types::UI;
use async_trait::async_trait;
use dicom::object::{FileDicomObject, InMemDicomObject};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// A received DICOM instance including its file meta group.
pub type DicomInstance = FileDicomObject<InMemDicomObject>;

/// Location of an instance written by a [`ContentStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredInstance {
	pub file_path: PathBuf,
	pub metadata_path: PathBuf,
	pub size: u64,
	pub uids: InstanceUids,
}

#[derive(Debug, Error)]
pub enum ContentStoreError {
	#[error("Failed to write instance to {path}: {source}")]
	StorageWriteFailed {
		path: PathBuf,
		source: Box<dyn std::error::Error + Send + Sync>,
	},
	#[error("Instance is missing mandatory attribute {0}")]
	MissingAttribute(&'static str),
}

/// Persists received instances to local disk until they are delivered.
#[async_trait]
pub trait ContentStore: Send + Sync {
	async fn save(
		&self,
		endpoint: &str,
		instance: Arc<DicomInstance>,
	) -> Result<StoredInstance, ContentStoreError>;
}

/// Reports whether the temporary storage can take more instances.
pub trait StorageCapacity: Send + Sync {
	fn has_space_available(&self) -> bool;
	fn available_bytes(&self) -> u64;
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("Database error: {0}")]
	Database(String),
	#[error("Failed to (de)serialize payload: {0}")]
	Serialization(#[from] serde_json::Error),
}

/// Durable record of payloads that are not delivered yet.
#[async_trait]
pub trait WorkItemStore: Send + Sync {
	/// Inserts or replaces the payload.
	async fn upsert(&self, payload: &Payload) -> Result<(), StoreError>;
	async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
	/// All payloads that are neither completed nor abandoned.
	async fn list_non_terminal(&self) -> Result<Vec<Payload>, StoreError>;
}

/// A single object upload. The body is streamed from `source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutObject {
	pub bucket: String,
	pub key: String,
	pub source: PathBuf,
	/// Size of `source`, if known in advance.
	pub length: Option<u64>,
	pub content_type: &'static str,
	pub metadata: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
	/// The upload may succeed if attempted again.
	#[error("Transient object store failure: {0}")]
	Transient(String),
	/// Retrying will not help (e.g. missing bucket, access denied).
	#[error("Permanent object store failure: {0}")]
	Permanent(String),
}

impl ObjectStoreError {
	pub const fn is_transient(&self) -> bool {
		matches!(self, Self::Transient(_))
	}
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
	async fn put_object(&self, request: PutObject) -> Result<(), ObjectStoreError>;
}

#[derive(Debug, Error)]
pub enum PublishError {
	#[error("Failed to reach message broker: {0}")]
	Unavailable(String),
	#[error("Message broker rejected message {message_id}: {reason}")]
	Rejected { message_id: Uuid, reason: String },
}

#[async_trait]
pub trait BrokerPublisher: Send + Sync {
	async fn publish(&self, topic: &str, message: &BrokerMessage) -> Result<(), PublishError>;
}

/// Reclaims the local copies of delivered instances.
///
/// Best effort: implementations log failures instead of reporting them.
pub trait CleanupQueue: Send + Sync {
	fn enqueue(&self, file: FileRecord);
}

/// Reads a string attribute from the data set, without DICOM padding.
pub fn string_attribute(instance: &InMemDicomObject, tag: dicom::core::Tag) -> Option<UI> {
	instance
		.get(tag)
		.and_then(|element| element.to_str().ok())
		.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
		.filter(|value| !value.is_empty())
}
