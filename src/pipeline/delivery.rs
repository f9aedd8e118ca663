use crate::config::{AbandonPolicy, AppConfig};
use crate::pipeline::assembler::BucketAssembler;
use crate::pipeline::message::{object_key, BrokerMessage, WorkflowRequestEvent};
use crate::pipeline::payload::{Payload, PayloadState};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::services::{
	BrokerPublisher, CleanupQueue, ObjectStore, ObjectStoreError, PublishError, PutObject,
	WorkItemStore,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

const CONTENT_TYPE_DICOM: &str = "application/dicom";
const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOptions {
	/// Object store bucket that receives the instances.
	pub bucket: String,
	/// Broker topic for workflow requests.
	pub topic: String,
	pub concurrency: usize,
	pub abandoned: AbandonPolicy,
}

impl From<&AppConfig> for DeliveryOptions {
	fn from(config: &AppConfig) -> Self {
		Self {
			bucket: config.s3.bucket.clone(),
			topic: config.messaging.workflow_request_topic.clone(),
			concurrency: config.delivery.concurrency,
			abandoned: config.delivery.abandoned,
		}
	}
}

#[derive(Debug, Error)]
enum DeliveryError {
	#[error("Failed to upload {key}: {source}")]
	Upload {
		key: String,
		source: ObjectStoreError,
	},
	#[error(transparent)]
	Publish(#[from] PublishError),
	#[error("Failed to build workflow request: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl DeliveryError {
	/// Errors that will not go away by trying again.
	const fn is_permanent(&self) -> bool {
		match self {
			Self::Upload { source, .. } => !source.is_transient(),
			Self::Publish(PublishError::Rejected { .. }) | Self::Serialization(_) => true,
			Self::Publish(PublishError::Unavailable(_)) => false,
		}
	}
}

pub struct DeliveryCollaborators {
	pub store: Arc<dyn WorkItemStore>,
	pub object_store: Arc<dyn ObjectStore>,
	pub publisher: Arc<dyn BrokerPublisher>,
	pub cleanup: Arc<dyn CleanupQueue>,
}

/// Uploads ready payloads to the object store and publishes a workflow request for each.
pub struct DeliveryWorker {
	inner: Arc<InnerDeliveryWorker>,
}

struct InnerDeliveryWorker {
	assembler: BucketAssembler,
	services: DeliveryCollaborators,
	retry: RetryPolicy,
	options: DeliveryOptions,
}

impl DeliveryWorker {
	pub fn new(
		assembler: BucketAssembler,
		services: DeliveryCollaborators,
		retry: RetryPolicy,
		options: DeliveryOptions,
	) -> Self {
		Self {
			inner: Arc::new(InnerDeliveryWorker {
				assembler,
				services,
				retry,
				options,
			}),
		}
	}

	/// Processes payloads until `cancel` is triggered, then waits for in-flight deliveries.
	pub async fn run(&self, cancel: CancellationToken) {
		let permits = Arc::new(Semaphore::new(self.inner.options.concurrency.max(1)));
		let mut tasks = JoinSet::new();
		info!(
			concurrency = self.inner.options.concurrency,
			"Started delivery worker"
		);

		loop {
			let permit = tokio::select! {
				biased;
				() = cancel.cancelled() => break,
				permit = Arc::clone(&permits).acquire_owned() => match permit {
					Ok(permit) => permit,
					Err(_closed) => break,
				},
			};
			let Ok(payload) = self.inner.assembler.drain(&cancel).await else {
				break;
			};

			let inner = Arc::clone(&self.inner);
			tasks.spawn(async move {
				inner.process(payload).await;
				drop(permit);
			});

			while let Some(result) = tasks.try_join_next() {
				if let Err(err) = result {
					error!("Delivery task failed: {err}");
				}
			}
		}

		if !tasks.is_empty() {
			info!("Waiting for {} in-flight deliveries", tasks.len());
		}
		while let Some(result) = tasks.join_next().await {
			if let Err(err) = result {
				error!("Delivery task failed: {err}");
			}
		}
		info!("Stopped delivery worker");
	}
}

impl InnerDeliveryWorker {
	#[instrument(skip_all, fields(payload_id = %payload.id, key = payload.key))]
	async fn process(&self, mut payload: Payload) {
		let result = match payload.state {
			PayloadState::Upload => match self.upload(&payload).await {
				Ok(()) => {
					for file in payload.files() {
						self.services.cleanup.enqueue(file.clone());
					}
					payload.advance(PayloadState::Notify);
					if let Err(err) = self.services.store.upsert(&payload).await {
						warn!("Failed to record upload of payload: {err}");
					}
					self.notify(&payload).await
				}
				Err(err) => Err(err),
			},
			PayloadState::Notify => self.notify(&payload).await,
			state => {
				warn!(%state, "Payload is not ready for delivery");
				return;
			}
		};

		match result {
			Ok(()) => self.complete(payload).await,
			Err(err) => self.retry(payload, err).await,
		}
	}

	async fn upload(&self, payload: &Payload) -> Result<(), DeliveryError> {
		let metadata = HashMap::from([
			(String::from("payload-id"), payload.id.to_string()),
			(String::from("correlation-id"), payload.correlation_id.clone()),
		]);

		for file in payload.files() {
			let mut metadata = metadata.clone();
			metadata.insert(String::from("source"), file.source.clone());
			metadata.insert(String::from("destination"), file.destination.clone());

			let objects = [
				(
					object_key(payload, &file.upload_path()),
					&file.file_path,
					Some(file.size),
					CONTENT_TYPE_DICOM,
				),
				(
					object_key(payload, &file.metadata_upload_path()),
					&file.metadata_path,
					None,
					CONTENT_TYPE_JSON,
				),
			];
			for (key, source, length, content_type) in objects {
				let request = PutObject {
					bucket: self.options.bucket.clone(),
					key: key.clone(),
					source: source.clone(),
					length,
					content_type,
					metadata: metadata.clone(),
				};
				self.services
					.object_store
					.put_object(request)
					.await
					.map_err(|source| DeliveryError::Upload { key, source })?;
			}
		}

		info!(files = payload.count(), "Uploaded payload to {}", self.options.bucket);
		Ok(())
	}

	async fn notify(&self, payload: &Payload) -> Result<(), DeliveryError> {
		let event = WorkflowRequestEvent::new(payload, &self.options.bucket);
		let message = BrokerMessage::new(&payload.correlation_id, &event)?;
		self.services
			.publisher
			.publish(&self.options.topic, &message)
			.await?;
		info!(
			message_id = %message.message_id,
			"Workflow request published to {}", self.options.topic
		);
		Ok(())
	}

	async fn complete(&self, mut payload: Payload) {
		payload.advance(PayloadState::Completed);

		let mut delays = self.retry.schedule();
		loop {
			match self.services.store.delete(payload.id).await {
				Ok(()) => break,
				Err(err) => match delays.next() {
					Some(delay) => {
						warn!("Failed to remove delivered payload, retrying in {delay:?}: {err}");
						tokio::time::sleep(delay).await;
					}
					None => {
						// The payload will be published again after a restart.
						error!("Failed to remove delivered payload: {err}");
						break;
					}
				},
			}
		}
		info!(files = payload.count(), "Payload delivered");
	}

	async fn retry(&self, mut payload: Payload, err: DeliveryError) {
		payload.retry_count += 1;
		if err.is_permanent() || self.retry.is_exhausted(payload.retry_count) {
			self.abandon(payload, &err).await;
			return;
		}

		let delay = self.retry.delay(payload.retry_count);
		warn!(
			state = %payload.state,
			retry = payload.retry_count,
			"Delivery failed, retrying in {delay:?}: {err}"
		);
		if let Err(err) = self.services.store.upsert(&payload).await {
			warn!("Failed to record retry of payload: {err}");
		}
		self.assembler.requeue(payload, delay);
	}

	async fn abandon(&self, mut payload: Payload, err: &DeliveryError) {
		error!(
			payload_id = %payload.id,
			key = payload.key,
			state = %payload.state,
			retries = payload.retry_count,
			"Payload abandoned: {err}"
		);
		payload.state = PayloadState::Abandoned;

		let result = match self.options.abandoned {
			AbandonPolicy::Retain => self.services.store.upsert(&payload).await,
			AbandonPolicy::Purge => {
				for file in payload.files() {
					self.services.cleanup.enqueue(file.clone());
				}
				self.services.store.delete(payload.id).await
			}
		};
		if let Err(err) = result {
			error!("Failed to record abandoned payload: {err}");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::EndpointConfig;
	use crate::pipeline::guard::{AdmissionRequest, DispatchGuard};
	use crate::pipeline::payload::{file_record, InstanceUids};
	use crate::pipeline::registry::{EndpointRegistry, EndpointSnapshot};
	use crate::pipeline::testing::{
		eventually, instance, FixedCapacity, MemoryContentStore, MemoryStore, RecordingCleanup,
		RecordingObjectStore, RecordingPublisher,
	};
	use dicom::dictionary_std::uids;
	use std::path::PathBuf;
	use std::time::Duration;

	struct Fixture {
		store: Arc<MemoryStore>,
		objects: Arc<RecordingObjectStore>,
		publisher: Arc<RecordingPublisher>,
		cleanup: Arc<RecordingCleanup>,
		token: CancellationToken,
		worker: Option<tokio::task::JoinHandle<()>>,
	}

	impl Fixture {
		fn new() -> Self {
			Self {
				store: Arc::new(MemoryStore::default()),
				objects: Arc::new(RecordingObjectStore::default()),
				publisher: Arc::new(RecordingPublisher::default()),
				cleanup: Arc::new(RecordingCleanup::default()),
				token: CancellationToken::new(),
				worker: None,
			}
		}

		/// Starts a worker that delivers every payload in the store.
		async fn start(&mut self, delays: &[u64], abandoned: AbandonPolicy, concurrency: usize) {
			let retry = RetryPolicy::new(
				delays.iter().copied().map(Duration::from_millis).collect(),
				None,
			);
			let assembler = BucketAssembler::restore(
				Arc::clone(&self.store) as Arc<dyn WorkItemStore>,
				retry.clone(),
				self.token.clone(),
			)
			.await
			.unwrap();
			let worker = DeliveryWorker::new(
				assembler,
				DeliveryCollaborators {
					store: Arc::clone(&self.store) as Arc<dyn WorkItemStore>,
					object_store: Arc::clone(&self.objects) as Arc<dyn ObjectStore>,
					publisher: Arc::clone(&self.publisher) as Arc<dyn BrokerPublisher>,
					cleanup: Arc::clone(&self.cleanup) as Arc<dyn CleanupQueue>,
				},
				retry,
				DeliveryOptions {
					bucket: String::from("dicom"),
					topic: String::from("md.workflow.request"),
					concurrency,
					abandoned,
				},
			);
			let token = self.token.clone();
			self.worker = Some(tokio::spawn(async move { worker.run(token).await }));
		}

		async fn stop(mut self) {
			self.token.cancel();
			if let Some(worker) = self.worker.take() {
				worker.await.unwrap();
			}
		}
	}

	fn ready_payload(key: &str, files: usize) -> Payload {
		let mut payload = Payload::new(key, 5);
		for i in 0..files {
			let mut file = file_record(&format!("/data/{key}/{i}.dcm"));
			file.uids = Some(InstanceUids {
				study_instance_uid: key.to_owned(),
				series_instance_uid: format!("{key}.1"),
				sop_instance_uid: format!("{key}.1.{i}"),
			});
			file.workflows = vec![String::from("workflow")];
			payload.add(file).unwrap();
		}
		payload.advance(PayloadState::Upload);
		payload
	}

	#[tokio::test(start_paused = true)]
	async fn delivers_payload() {
		let mut fixture = Fixture::new();
		let payload = ready_payload("1.2", 2);
		fixture.store.insert(payload.clone());
		fixture.start(&[100], AbandonPolicy::Retain, 1).await;

		eventually(|| fixture.store.all().is_empty()).await;

		let puts = fixture.objects.puts();
		let keys: Vec<_> = puts.iter().map(|put| put.key.clone()).collect();
		assert_eq!(
			keys,
			vec![
				format!("{}/1.2/1.2.1/1.2.1.0.dcm", payload.id),
				format!("{}/1.2/1.2.1/1.2.1.0.dcm.json", payload.id),
				format!("{}/1.2/1.2.1/1.2.1.1.dcm", payload.id),
				format!("{}/1.2/1.2.1/1.2.1.1.dcm.json", payload.id),
			]
		);
		assert_eq!(puts[0].content_type, CONTENT_TYPE_DICOM);
		assert_eq!(puts[0].source, PathBuf::from("/data/1.2/0.dcm"));
		assert_eq!(puts[0].length, Some(128));
		assert_eq!(puts[1].content_type, CONTENT_TYPE_JSON);
		assert_eq!(puts[0].bucket, "dicom");
		assert_eq!(puts[0].metadata["correlation-id"], payload.correlation_id);
		assert_eq!(puts[0].metadata["source"], "STORESCU");

		let messages = fixture.publisher.messages();
		assert_eq!(messages.len(), 1);
		let (topic, message) = &messages[0];
		assert_eq!(topic, "md.workflow.request");
		assert_eq!(message.correlation_id, payload.correlation_id);
		let event: WorkflowRequestEvent = message.body_as().unwrap();
		assert_eq!(event.payload_id, payload.id);
		assert_eq!(event.file_count, 2);
		assert_eq!(event.workflows, vec!["workflow"]);
		assert_eq!(event.payload[1].path, keys[2]);

		assert_eq!(fixture.cleanup.files().len(), 2);
		fixture.stop().await;
	}

	#[tokio::test(start_paused = true)]
	async fn transient_upload_failure_is_retried() {
		let mut fixture = Fixture::new();
		let payload = ready_payload("1.3", 2);
		fixture.store.insert(payload.clone());
		fixture
			.objects
			.fail_with(ObjectStoreError::Transient(String::from("timeout")));
		fixture.start(&[1000, 2000], AbandonPolicy::Retain, 1).await;

		// The failed attempt is recorded before waiting for the retry.
		eventually(|| fixture.store.get(payload.id).is_some_and(|p| p.retry_count == 1)).await;
		let retried = fixture.store.get(payload.id).unwrap();
		assert_eq!(retried.state, PayloadState::Upload);
		assert_eq!(retried.files(), payload.files());
		assert!(fixture.publisher.messages().is_empty());

		eventually(|| fixture.store.all().is_empty()).await;
		assert_eq!(fixture.objects.attempts(), 5);

		// The retry uploads every file of the same payload.
		let sources: Vec<_> = fixture.objects.puts().into_iter().map(|put| put.source).collect();
		let expected: Vec<_> = payload
			.files()
			.iter()
			.flat_map(|file| [file.file_path.clone(), file.metadata_path.clone()])
			.collect();
		assert_eq!(sources, expected);
		assert!(fixture
			.objects
			.puts()
			.iter()
			.all(|put| put.key.starts_with(&payload.id.to_string())));

		let messages = fixture.publisher.messages();
		assert_eq!(messages.len(), 1);
		let event: WorkflowRequestEvent = messages[0].1.body_as().unwrap();
		assert_eq!(event.payload_id, payload.id);
		assert_eq!(event.file_count, 2);
		fixture.stop().await;
	}

	#[tokio::test(start_paused = true)]
	async fn admitted_instances_are_delivered_as_one_payload() {
		let store = Arc::new(MemoryStore::default());
		let objects = Arc::new(RecordingObjectStore::default());
		let publisher = Arc::new(RecordingPublisher::default());
		let cleanup = Arc::new(RecordingCleanup::default());
		let token = CancellationToken::new();
		let retry = RetryPolicy::new(vec![Duration::from_millis(100)], None);

		let assembler = BucketAssembler::restore(
			Arc::clone(&store) as Arc<dyn WorkItemStore>,
			retry.clone(),
			token.clone(),
		)
		.await
		.unwrap();
		let mut endpoint = EndpointConfig::new("ct", "CT");
		endpoint.reject_unknown_sources = false;
		endpoint.timeout = 1;
		let guard = DispatchGuard::new(
			Arc::new(EndpointRegistry::new(EndpointSnapshot::new(vec![endpoint], Vec::new()))),
			assembler.clone(),
			Arc::new(MemoryContentStore::default()),
			Arc::new(FixedCapacity::new(true)),
		);
		let worker = DeliveryWorker::new(
			assembler.clone(),
			DeliveryCollaborators {
				store: Arc::clone(&store) as Arc<dyn WorkItemStore>,
				object_store: Arc::clone(&objects) as Arc<dyn ObjectStore>,
				publisher: Arc::clone(&publisher) as Arc<dyn BrokerPublisher>,
				cleanup: Arc::clone(&cleanup) as Arc<dyn CleanupQueue>,
			},
			retry,
			DeliveryOptions {
				bucket: String::from("dicom"),
				topic: String::from("md.workflow.request"),
				concurrency: 1,
				abandoned: AbandonPolicy::Retain,
			},
		);

		let admit = |sop: &'static str| AdmissionRequest {
			called_aet: String::from("CT"),
			calling_aet: String::from("MODALITY"),
			host: String::from("10.0.0.5"),
			instance: instance(uids::CT_IMAGE_STORAGE, "1.2", "1.2.1", sop),
		};
		let first = guard.admit(admit("1.2.1.1")).await.unwrap();
		tokio::time::sleep(Duration::from_millis(200)).await;
		let second = guard.admit(admit("1.2.1.2")).await.unwrap();
		let last_arrival = tokio::time::Instant::now();
		assert_eq!(first, second);

		let payload = assembler.drain(&token).await.unwrap();
		assert!(last_arrival.elapsed() >= Duration::from_secs(1));
		assert_eq!(payload.key, "CT/1.2");
		assert_eq!(payload.state, PayloadState::Upload);
		assert_eq!(payload.retry_count, 0);
		let paths: Vec<_> = payload.files().iter().map(|file| file.file_path.clone()).collect();
		assert_eq!(
			paths,
			vec![
				PathBuf::from("/memory/ct/1.2.1.1.dcm"),
				PathBuf::from("/memory/ct/1.2.1.2.dcm")
			]
		);
		assert_eq!(store.get(payload.id), Some(payload.clone()));

		worker.inner.process(payload.clone()).await;

		assert!(store.get(payload.id).is_none());
		assert_eq!(store.delete_calls(), 1);
		assert_eq!(objects.puts().len(), 4);
		assert_eq!(cleanup.files().len(), 2);
		let messages = publisher.messages();
		assert_eq!(messages.len(), 1);
		let event: WorkflowRequestEvent = messages[0].1.body_as().unwrap();
		assert_eq!(event.payload_id, payload.id);
		assert_eq!(event.file_count, 2);

		let another = tokio::time::timeout(Duration::from_secs(10), assembler.drain(&token)).await;
		assert!(another.is_err());
		assert_eq!(assembler.open_buckets(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn exhausted_retries_abandon_payload() {
		let mut fixture = Fixture::new();
		let payload = ready_payload("1.4", 1);
		fixture.store.insert(payload.clone());
		fixture.objects.always_fail(true);
		fixture.start(&[10, 20], AbandonPolicy::Retain, 1).await;

		eventually(|| {
			fixture
				.store
				.get(payload.id)
				.is_some_and(|p| p.state == PayloadState::Abandoned)
		})
		.await;

		// One attempt plus two retries.
		assert_eq!(fixture.objects.attempts(), 3);
		let abandoned = fixture.store.get(payload.id).unwrap();
		assert_eq!(abandoned.retry_count, 3);
		assert!(fixture.publisher.messages().is_empty());
		assert!(fixture.cleanup.files().is_empty());
		fixture.stop().await;
	}

	#[tokio::test(start_paused = true)]
	async fn permanent_failure_abandons_immediately() {
		let mut fixture = Fixture::new();
		let payload = ready_payload("1.5", 2);
		fixture.store.insert(payload.clone());
		fixture.objects.always_fail(false);
		fixture.start(&[10, 20], AbandonPolicy::Purge, 1).await;

		eventually(|| fixture.store.delete_calls() == 1).await;

		assert_eq!(fixture.objects.attempts(), 1);
		assert!(fixture.store.get(payload.id).is_none());
		assert_eq!(fixture.cleanup.files().len(), 2);
		fixture.stop().await;
	}

	#[tokio::test(start_paused = true)]
	async fn publish_failure_does_not_upload_again() {
		let mut fixture = Fixture::new();
		let payload = ready_payload("1.6", 2);
		fixture.store.insert(payload.clone());
		fixture
			.publisher
			.fail_with(PublishError::Unavailable(String::from("connection refused")));
		fixture.start(&[500], AbandonPolicy::Retain, 1).await;

		eventually(|| {
			fixture
				.store
				.get(payload.id)
				.is_some_and(|p| p.state == PayloadState::Notify && p.retry_count == 1)
		})
		.await;

		eventually(|| fixture.store.all().is_empty()).await;
		assert_eq!(fixture.objects.attempts(), 4);
		assert_eq!(fixture.publisher.attempts(), 2);
		fixture.stop().await;
	}

	#[tokio::test(start_paused = true)]
	async fn rejected_message_abandons_payload() {
		let mut fixture = Fixture::new();
		let payload = ready_payload("1.7", 1);
		fixture.store.insert(payload.clone());
		fixture.publisher.fail_with(PublishError::Rejected {
			message_id: payload.id,
			reason: String::from("400 Bad Request"),
		});
		fixture.start(&[10], AbandonPolicy::Retain, 1).await;

		eventually(|| {
			fixture
				.store
				.get(payload.id)
				.is_some_and(|p| p.state == PayloadState::Abandoned)
		})
		.await;
		assert_eq!(fixture.publisher.attempts(), 1);
		fixture.stop().await;
	}

	#[tokio::test(start_paused = true)]
	async fn restored_notify_payload_is_only_published() {
		let mut fixture = Fixture::new();
		let mut payload = ready_payload("1.8", 3);
		payload.advance(PayloadState::Notify);
		fixture.store.insert(payload.clone());
		fixture.start(&[10], AbandonPolicy::Retain, 1).await;

		eventually(|| fixture.store.all().is_empty()).await;
		assert_eq!(fixture.objects.attempts(), 0);
		assert_eq!(fixture.publisher.messages().len(), 1);
		fixture.stop().await;
	}

	#[tokio::test(start_paused = true)]
	async fn concurrency_is_bounded() {
		let mut fixture = Fixture::new();
		for i in 0..6 {
			fixture.store.insert(ready_payload(&format!("2.{i}"), 1));
		}
		fixture.objects.set_latency(Duration::from_secs(1));
		fixture.start(&[10], AbandonPolicy::Retain, 2).await;

		eventually(|| fixture.store.all().is_empty()).await;
		assert_eq!(fixture.publisher.messages().len(), 6);
		assert_eq!(fixture.objects.max_active(), 2);
		fixture.stop().await;
	}

	#[tokio::test(start_paused = true)]
	async fn cancellation_waits_for_in_flight_delivery() {
		let mut fixture = Fixture::new();
		fixture.store.insert(ready_payload("3.1", 1));
		fixture.objects.set_latency(Duration::from_secs(5));
		fixture.start(&[10], AbandonPolicy::Retain, 1).await;

		eventually(|| fixture.objects.attempts() == 1).await;
		let publisher = Arc::clone(&fixture.publisher);
		let store = Arc::clone(&fixture.store);
		fixture.stop().await;

		assert_eq!(publisher.messages().len(), 1);
		assert!(store.all().is_empty());
	}
}
