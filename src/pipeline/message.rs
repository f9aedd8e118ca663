use crate::pipeline::payload::Payload;
use crate::types::AE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies this gateway as the producer of broker messages.
pub const APPLICATION_ID: &str = "16988a78-87b5-4168-a5c3-2cfc2bab8e54";

/// Object store locations of one delivered instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageLocation {
	pub path: String,
	pub metadata: String,
}

/// Announces a delivered payload to the workflow manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRequestEvent {
	pub payload_id: Uuid,
	pub correlation_id: String,
	pub timestamp: DateTime<Utc>,
	pub bucket: String,
	pub file_count: usize,
	pub workflows: Vec<String>,
	pub calling_ae_title: Option<AE>,
	pub called_ae_title: Option<AE>,
	pub payload: Vec<StorageLocation>,
}

impl WorkflowRequestEvent {
	pub fn new(payload: &Payload, bucket: &str) -> Self {
		let first = payload.files().first();
		Self {
			payload_id: payload.id,
			correlation_id: payload.correlation_id.clone(),
			timestamp: payload.created,
			bucket: bucket.to_owned(),
			file_count: payload.count(),
			workflows: payload.workflows(),
			calling_ae_title: first.map(|file| file.source.clone()),
			called_ae_title: first.map(|file| file.destination.clone()),
			payload: payload
				.files()
				.iter()
				.map(|file| StorageLocation {
					path: object_key(payload, &file.upload_path()),
					metadata: object_key(payload, &file.metadata_upload_path()),
				})
				.collect(),
		}
	}
}

/// Object key of a file inside the payload's namespace.
pub fn object_key(payload: &Payload, relative: &str) -> String {
	format!("{}/{relative}", payload.id)
}

/// Envelope published to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerMessage {
	pub message_id: Uuid,
	pub application_id: String,
	pub correlation_id: String,
	pub content_type: String,
	pub creation_date_time: DateTime<Utc>,
	pub body: serde_json::Value,
}

impl BrokerMessage {
	pub fn new<T: Serialize>(correlation_id: &str, body: &T) -> Result<Self, serde_json::Error> {
		Ok(Self {
			message_id: Uuid::new_v4(),
			application_id: String::from(APPLICATION_ID),
			correlation_id: correlation_id.to_owned(),
			content_type: mime::APPLICATION_JSON.to_string(),
			creation_date_time: Utc::now(),
			body: serde_json::to_value(body)?,
		})
	}

	#[cfg(test)]
	pub fn body_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
		T::deserialize(&self.body)
	}
}
