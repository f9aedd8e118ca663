use crate::config::EndpointConfig;
use crate::pipeline::assembler::{BucketAssembler, QueueError};
use crate::pipeline::payload::FileRecord;
use crate::pipeline::registry::{ChangeNotifier, EndpointRegistry};
use crate::pipeline::services::{
	string_attribute, ContentStore, ContentStoreError, DicomInstance, StorageCapacity,
};
use crate::types::{AE, UI};
use dicom::dictionary_std::tags;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// An instance received by a STORE-SCP.
pub struct AdmissionRequest {
	pub called_aet: AE,
	pub calling_aet: AE,
	/// Peer address of the association.
	pub host: String,
	pub instance: Arc<DicomInstance>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admitted {
	/// The instance was stored and added to the bucket `key`.
	Queued { key: String },
	/// The endpoint ignores instances of this SOP class. Nothing was stored.
	Ignored,
}

#[derive(Debug, Error)]
pub enum AdmissionError {
	#[error("No endpoint is configured for called AE title {0}")]
	UnknownEndpoint(AE),
	#[error("Source {aet} ({host}) is not allowed to send instances")]
	UntrustedSource { aet: AE, host: String },
	#[error("Not enough storage space available ({available} bytes free)")]
	InsufficientStorage { available: u64 },
	#[error(transparent)]
	Storage(#[from] ContentStoreError),
	#[error(transparent)]
	Queue(#[from] QueueError),
}

/// Decides whether a received instance enters the pipeline and routes it to its bucket.
#[derive(Clone)]
pub struct DispatchGuard {
	registry: Arc<EndpointRegistry>,
	assembler: BucketAssembler,
	content_store: Arc<dyn ContentStore>,
	capacity: Arc<dyn StorageCapacity>,
}

impl DispatchGuard {
	pub fn new(
		registry: Arc<EndpointRegistry>,
		assembler: BucketAssembler,
		content_store: Arc<dyn ContentStore>,
		capacity: Arc<dyn StorageCapacity>,
	) -> Self {
		Self {
			registry,
			assembler,
			content_store,
			capacity,
		}
	}

	#[instrument(skip_all, fields(called_aet = request.called_aet, calling_aet = request.calling_aet))]
	pub async fn admit(&self, request: AdmissionRequest) -> Result<Admitted, AdmissionError> {
		// Holding on to one snapshot keeps the whole admission consistent.
		let snapshot = self.registry.snapshot();
		let endpoint = snapshot
			.endpoint(&request.called_aet)
			.ok_or_else(|| AdmissionError::UnknownEndpoint(request.called_aet.clone()))?;

		if endpoint.reject_unknown_sources
			&& !snapshot.is_source_trusted(&request.calling_aet, &request.host)
		{
			return Err(AdmissionError::UntrustedSource {
				aet: request.calling_aet,
				host: request.host,
			});
		}

		if let Some(sop_class_uid) = sop_class_uid(&request.instance) {
			if endpoint.ignored_sop_classes.contains(&sop_class_uid) {
				info!(
					endpoint = endpoint.name,
					sop_class_uid, "Instance ignored by endpoint configuration"
				);
				return Ok(Admitted::Ignored);
			}
		}

		// Nothing would deliver an instance that is written now.
		if self.assembler.is_shutting_down() {
			return Err(QueueError::ShuttingDown.into());
		}

		if !self.capacity.has_space_available() {
			return Err(AdmissionError::InsufficientStorage {
				available: self.capacity.available_bytes(),
			});
		}

		let stored = self
			.content_store
			.save(&endpoint.name, Arc::clone(&request.instance))
			.await?;

		let key = bucket_key(endpoint, &request.instance, &stored.uids.study_instance_uid);
		let file = FileRecord {
			file_path: stored.file_path,
			metadata_path: stored.metadata_path,
			source: request.calling_aet,
			destination: request.called_aet,
			size: stored.size,
			uids: Some(stored.uids),
			workflows: endpoint.workflows.clone(),
		};
		self.assembler.queue(&key, endpoint.timeout, file)?;
		debug!(key, "Instance admitted");

		Ok(Admitted::Queued { key })
	}

	pub fn is_endpoint_known(&self, aet: &str) -> bool {
		self.registry.snapshot().endpoint(aet).is_some()
	}

	pub fn is_source_trusted(&self, aet: &str, host: &str) -> bool {
		self.registry.snapshot().is_source_trusted(aet, host)
	}

	/// Whether the endpoint serving `aet` only accepts configured sources.
	pub fn rejects_unknown_sources(&self, aet: &str) -> bool {
		self.registry
			.snapshot()
			.endpoint(aet)
			.is_some_and(|endpoint| endpoint.reject_unknown_sources)
	}

	/// Applies configuration changes to the registry until `cancel` is triggered.
	pub fn subscribe(&self, notifier: &ChangeNotifier, cancel: CancellationToken) -> JoinHandle<()> {
		let mut changes = notifier.subscribe();
		let registry = Arc::clone(&self.registry);
		tokio::spawn(async move {
			loop {
				let change = tokio::select! {
					() = cancel.cancelled() => return,
					change = changes.recv() => change,
				};
				match change {
					Ok(change) => registry.apply(&change),
					Err(RecvError::Lagged(skipped)) => {
						warn!("Missed {skipped} configuration changes");
					}
					Err(RecvError::Closed) => return,
				}
			}
		})
	}
}

fn sop_class_uid(instance: &DicomInstance) -> Option<UI> {
	string_attribute(instance, tags::SOP_CLASS_UID).or_else(|| {
		let uid = instance.meta().media_storage_sop_class_uid();
		let uid = uid.trim_end_matches(['\0', ' ']);
		(!uid.is_empty()).then(|| uid.to_owned())
	})
}

/// Builds the bucket key from the endpoint's grouping attribute.
///
/// Falls back to the Study Instance UID if the instance lacks the attribute.
fn bucket_key(endpoint: &EndpointConfig, instance: &DicomInstance, study_instance_uid: &str) -> String {
	let value = string_attribute(instance, endpoint.grouping.tag()).unwrap_or_else(|| {
		debug!(
			grouping = %endpoint.grouping,
			"Grouping attribute missing, using Study Instance UID"
		);
		study_instance_uid.to_owned()
	});
	format!("{}/{value}", endpoint.aet)
}
