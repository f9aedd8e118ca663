use crate::pipeline::payload::{FileRecord, Payload, PayloadError, PayloadState};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::services::{StoreError, WorkItemStore};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Inactivity timeout in seconds used when an endpoint does not configure one.
pub const DEFAULT_TIMEOUT: u32 = 5;

/// Lower bound for the delay between persist attempts once the retry schedule is used up.
const MIN_PERSIST_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
	#[error("Invalid argument: {0}")]
	InvalidArgument(&'static str),
	#[error(transparent)]
	Payload(#[from] PayloadError),
	#[error("Shutting down, no more instances are accepted")]
	ShuttingDown,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Operation was cancelled")]
pub struct Cancelled;

/// Groups arriving files into payloads and hands closed payloads to the delivery worker.
///
/// Every bucket has a sliding inactivity deadline that is pushed back on each arrival.
/// Once the deadline passes, the bucket is removed from the table, its payload is persisted
/// and placed on the ready queue that [`BucketAssembler::drain`] reads from.
#[derive(Clone)]
pub struct BucketAssembler {
	inner: Arc<InnerAssembler>,
}

struct InnerAssembler {
	buckets: Mutex<HashMap<String, Bucket>>,
	ready_tx: mpsc::UnboundedSender<Payload>,
	ready_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Payload>>,
	store: Arc<dyn WorkItemStore>,
	persist_retry: RetryPolicy,
	shutdown: CancellationToken,
	tasks: TaskTracker,
}

struct Bucket {
	payload: Payload,
	timeout: Duration,
	deadline: Instant,
	wake: Arc<Notify>,
}

impl BucketAssembler {
	/// Creates the assembler and re-enqueues every payload that was in delivery when the
	/// process stopped.
	///
	/// Payloads in state `Created` belonged to a bucket that no longer exists. They are
	/// left in the store untouched.
	pub async fn restore(
		store: Arc<dyn WorkItemStore>,
		persist_retry: RetryPolicy,
		shutdown: CancellationToken,
	) -> Result<Self, StoreError> {
		let assembler = Self::new(store, persist_retry, shutdown);

		info!("Restoring payloads from database.");
		let mut restored = 0;
		for payload in assembler.inner.store.list_non_terminal().await? {
			match payload.state {
				PayloadState::Upload | PayloadState::Notify => {
					debug!(
						payload_id = %payload.id,
						key = payload.key,
						state = %payload.state,
						"Restored payload"
					);
					assembler.inner.enqueue(payload);
					restored += 1;
				}
				state => warn!(
					payload_id = %payload.id,
					key = payload.key,
					%state,
					"Payload cannot be resumed and is left in the database"
				),
			}
		}
		info!("{restored} payloads restored from database.");

		Ok(assembler)
	}

	fn new(
		store: Arc<dyn WorkItemStore>,
		persist_retry: RetryPolicy,
		shutdown: CancellationToken,
	) -> Self {
		let (ready_tx, ready_rx) = mpsc::unbounded_channel();
		Self {
			inner: Arc::new(InnerAssembler {
				buckets: Mutex::new(HashMap::new()),
				ready_tx,
				ready_rx: tokio::sync::Mutex::new(ready_rx),
				store,
				persist_retry,
				shutdown,
				tasks: TaskTracker::new(),
			}),
		}
	}

	/// Adds a file to the bucket `key`, creating the bucket if it does not exist.
	///
	/// A new bucket closes after `timeout` seconds without arrivals; later calls keep the
	/// timeout the bucket was created with. Files whose path is already part of the bucket
	/// are not added a second time, but still extend the deadline.
	///
	/// Once shutdown was requested, no bucket is created or extended anymore.
	pub fn queue(&self, key: &str, timeout: u32, file: FileRecord) -> Result<(), QueueError> {
		if key.trim().is_empty() {
			return Err(QueueError::InvalidArgument("bucket key must not be empty"));
		}
		if timeout == 0 {
			return Err(QueueError::InvalidArgument("timeout must be greater than zero"));
		}

		let now = Instant::now();
		let mut buckets = self.inner.buckets();
		if self.is_shutting_down() {
			return Err(QueueError::ShuttingDown);
		}
		let created = match buckets.entry(key.to_owned()) {
			Entry::Occupied(mut entry) => {
				let bucket = entry.get_mut();
				let path = file.file_path.clone();
				if !bucket.payload.add(file)? {
					debug!(key, path = %path.display(), "Instance already part of bucket");
				}
				bucket.deadline = now + bucket.timeout;
				trace!(key, files = bucket.payload.count(), "Bucket deadline extended");
				None
			}
			Entry::Vacant(entry) => {
				let mut payload = Payload::new(key, timeout);
				payload.add(file)?;
				let id = payload.id;
				let wake = Arc::new(Notify::new());
				let timeout = Duration::from_secs(u64::from(timeout));
				entry.insert(Bucket {
					payload,
					timeout,
					deadline: now + timeout,
					wake: Arc::clone(&wake),
				});
				Some((id, wake))
			}
		};
		let open_buckets = buckets.len();
		drop(buckets);

		if let Some((id, wake)) = created {
			info!(
				key,
				payload_id = %id,
				open_buckets,
				"Bucket {key} created with timeout {timeout}s."
			);
			let inner = Arc::clone(&self.inner);
			let key = key.to_owned();
			self.inner
				.tasks
				.spawn(async move { inner.watch(key, id, wake).await });
		} else {
			debug!(key, open_buckets, "Instance added to bucket {key}.");
		}

		Ok(())
	}

	/// Closes the bucket `key` without waiting for its deadline.
	///
	/// Returns `false` if there is no open bucket with that key.
	pub fn close_bucket(&self, key: &str) -> bool {
		let mut buckets = self.inner.buckets();
		match buckets.get_mut(key) {
			Some(bucket) => {
				bucket.deadline = Instant::now();
				bucket.wake.notify_one();
				true
			}
			None => false,
		}
	}

	/// Waits for the next payload that is ready for delivery.
	///
	/// Cancelling the token never consumes a payload; it stays queued for the next call.
	pub async fn drain(&self, cancel: &CancellationToken) -> Result<Payload, Cancelled> {
		let mut ready = tokio::select! {
			biased;
			() = cancel.cancelled() => return Err(Cancelled),
			ready = self.inner.ready_rx.lock() => ready,
		};

		tokio::select! {
			biased;
			() = cancel.cancelled() => Err(Cancelled),
			payload = ready.recv() => payload.ok_or(Cancelled),
		}
	}

	/// Puts a payload back on the ready queue after `delay`.
	///
	/// The payload must already be persisted: a pending requeue is dropped on shutdown and
	/// picked up again by [`BucketAssembler::restore`].
	pub fn requeue(&self, payload: Payload, delay: Duration) {
		if delay.is_zero() {
			self.inner.enqueue(payload);
			return;
		}

		let inner = Arc::clone(&self.inner);
		self.inner.tasks.spawn(async move {
			tokio::select! {
				() = tokio::time::sleep(delay) => inner.enqueue(payload),
				() = inner.shutdown.cancelled() => {
					debug!(payload_id = %payload.id, "Shutting down, payload will be restored on next start");
				}
			}
		});
	}

	pub fn is_shutting_down(&self) -> bool {
		self.inner.shutdown.is_cancelled()
	}

	pub fn open_buckets(&self) -> usize {
		self.inner.buckets().len()
	}

	/// Waits until every open bucket has been persisted after shutdown was requested.
	pub async fn wait_for_shutdown(&self) {
		self.inner.tasks.close();
		self.inner.tasks.wait().await;
	}
}

impl InnerAssembler {
	fn buckets(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
		self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn enqueue(&self, payload: Payload) {
		if let Err(err) = self.ready_tx.send(payload) {
			// The receiver lives as long as the assembler itself.
			error!(payload_id = %err.0.id, "Ready queue is closed");
		}
	}

	/// Sleeps until the bucket's deadline and closes it once the deadline did not move.
	async fn watch(&self, key: String, id: Uuid, wake: Arc<Notify>) {
		loop {
			let deadline = match self.buckets().get(&key) {
				Some(bucket) if bucket.payload.id == id => bucket.deadline,
				_ => return,
			};

			let shutting_down = tokio::select! {
				() = tokio::time::sleep_until(deadline) => false,
				() = wake.notified() => false,
				() = self.shutdown.cancelled() => true,
			};

			let (closed, open_buckets) = {
				let mut buckets = self.buckets();
				let closed = match buckets.entry(key.clone()) {
					Entry::Occupied(entry)
						if entry.get().payload.id == id
							&& (shutting_down || entry.get().deadline <= Instant::now()) =>
					{
						Some(entry.remove())
					}
					Entry::Occupied(entry) if entry.get().payload.id == id => None,
					_ => return,
				};
				(closed, buckets.len())
			};

			if let Some(bucket) = closed {
				trace!("Number of buckets active: {open_buckets}.");
				self.complete(bucket.payload, open_buckets).await;
				return;
			}
		}
	}

	/// Seals the payload, persists it and puts it on the ready queue.
	///
	/// Only persisted payloads are enqueued. After shutdown was requested the payload is
	/// only persisted.
	async fn complete(&self, mut payload: Payload, open_buckets: usize) {
		payload.advance(PayloadState::Upload);

		if let Err(err) = self.persist(&payload).await {
			error!(
				payload_id = %payload.id,
				key = payload.key,
				files = payload.count(),
				"Failed to persist payload before shutdown, it is lost and its files stay on disk: {err}"
			);
			return;
		}

		if self.shutdown.is_cancelled() {
			info!(
				payload_id = %payload.id,
				key = payload.key,
				open_buckets,
				"Bucket {} persisted with {} files for processing after restart.",
				payload.key,
				payload.count()
			);
			return;
		}

		info!(
			payload_id = %payload.id,
			key = payload.key,
			open_buckets,
			"Bucket {} sent to processing queue with {} files.",
			payload.key,
			payload.count()
		);
		self.enqueue(payload);
	}

	/// Writes the payload to the store.
	///
	/// Follows the retry schedule, then keeps retrying with its last delay for as long as
	/// the assembler runs. Fails only once shutdown was requested and the schedule is used up.
	async fn persist(&self, payload: &Payload) -> Result<(), StoreError> {
		let mut retry = 0;
		loop {
			let err = match self.store.upsert(payload).await {
				Ok(()) => return Ok(()),
				Err(err) => err,
			};
			retry += 1;

			let exhausted = self.persist_retry.is_exhausted(retry);
			if exhausted && self.shutdown.is_cancelled() {
				return Err(err);
			}

			let mut delay = self.persist_retry.delay(retry);
			if exhausted {
				delay = delay.max(MIN_PERSIST_DELAY);
			}
			warn!(
				payload_id = %payload.id,
				retry,
				"Error processing bucket {}, retrying in {delay:?}: {err}",
				payload.key
			);
			if exhausted {
				// A pending shutdown cuts the wait short for one last attempt.
				tokio::select! {
					() = tokio::time::sleep(delay) => {}
					() = self.shutdown.cancelled() => {}
				}
			} else {
				tokio::time::sleep(delay).await;
			}
		}
	}
}
