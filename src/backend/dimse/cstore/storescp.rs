use crate::backend::dimse::association::server::{ServerAssociation, ServerAssociationOptions};
use crate::backend::dimse::association::Association;
use crate::backend::dimse::cecho::{CompositeEchoResponse, COMMAND_FIELD_COMPOSITE_ECHO_REQUEST};
use crate::backend::dimse::cstore::{
	CompositeStoreRequest, CompositeStoreResponse, COMMAND_FIELD_COMPOSITE_STORE_REQUEST,
};
use crate::backend::dimse::{
	status, DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError,
};
use crate::config::DimseServerConfig;
use crate::pipeline::{AdmissionError, AdmissionRequest, Admitted, DispatchGuard, QueueError};
use crate::types::US;
use anyhow::Context;
use dicom::object::FileMetaTableBuilder;
use dicom::ul::Pdu;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts C-ECHO and C-STORE requests addressed to one AE title.
pub struct StoreServiceClassProvider {
	inner: Arc<InnerStoreServiceClassProvider>,
}

struct InnerStoreServiceClassProvider {
	guard: DispatchGuard,
	config: DimseServerConfig,
}

impl StoreServiceClassProvider {
	pub fn new(guard: DispatchGuard, config: DimseServerConfig) -> Self {
		Self {
			inner: Arc::new(InnerStoreServiceClassProvider { guard, config }),
		}
	}

	/// Accepts associations until `cancel` is triggered.
	///
	/// Returns once every association has ended, so no instance is admitted afterwards.
	/// A message that is being handled is answered first; idle associations are closed.
	pub async fn spawn(&self, cancel: CancellationToken) -> anyhow::Result<()> {
		let address = SocketAddr::from((self.inner.config.interface, self.inner.config.port));
		let listener = TcpListener::bind(&address)
			.await
			.with_context(|| format!("Failed to bind STORE-SCP to {address}"))?;
		info!(aet = self.inner.config.aet, "Started Store Service Class Provider on {address}");

		let associations = TaskTracker::new();
		loop {
			let accepted = tokio::select! {
				() = cancel.cancelled() => break,
				accepted = listener.accept() => accepted,
			};
			match accepted {
				Ok((stream, peer)) => {
					let span = info_span!(
						"STORE-SCP",
						aet = &self.inner.config.aet,
						peer = peer.to_string()
					);
					info!("Accepted incoming connection from {peer}");
					let inner = Arc::clone(&self.inner);
					let cancel = cancel.clone();
					associations.spawn(
						async move {
							if let Err(err) = Self::process(stream, peer, inner, cancel).await {
								error!("{err:#}");
							}
						}
						.instrument(span),
					);
				}
				Err(err) => error!("Failed to accept incoming connection: {err}"),
			}
		}

		associations.close();
		if !associations.is_empty() {
			info!(
				aet = self.inner.config.aet,
				associations = associations.len(),
				"Waiting for open associations"
			);
		}
		associations.wait().await;

		info!(aet = self.inner.config.aet, "Stopped Store Service Class Provider");
		Ok(())
	}

	#[instrument(skip_all)]
	async fn process(
		stream: TcpStream,
		peer: SocketAddr,
		inner: Arc<InnerStoreServiceClassProvider>,
		cancel: CancellationToken,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// dicom-ul uses blocking reads and writes, which ServerAssociation moves to its own thread.
		tcp_stream.set_nonblocking(false)?;

		let association = ServerAssociation::new(ServerAssociationOptions {
			aet: inner.config.aet.clone(),
			tcp_stream,
			uncompressed: inner.config.uncompressed,
		})
		.await?;

		let called_aet = inner.config.aet.clone();
		let calling_aet = association.calling_aet().to_owned();
		let host = peer.ip().to_string();

		if !inner.guard.is_endpoint_known(&called_aet) {
			warn!(called_aet, "No endpoint configured, aborting association");
			association.abort(RESPONSE_TIMEOUT).await;
			return Ok(());
		}
		if inner.guard.rejects_unknown_sources(&called_aet)
			&& !inner.guard.is_source_trusted(&calling_aet, &host)
		{
			warn!(calling_aet, host, "Untrusted source, aborting association");
			association.abort(RESPONSE_TIMEOUT).await;
			return Ok(());
		}

		loop {
			// Duration::MAX to indefinitely wait for incoming messages
			let received = tokio::select! {
				biased;
				() = cancel.cancelled() => None,
				received = association.read_message(Duration::MAX) => Some(received),
			};
			let Some(received) = received else {
				// Dropping the association closes the connection.
				info!("Shutting down, closing association");
				return Ok(());
			};
			let message = match received {
				Ok(message) => message,
				Err(ReadError::UnexpectedPdu(Pdu::ReleaseRQ)) => {
					association.send(Pdu::ReleaseRP, RESPONSE_TIMEOUT).await?;
					info!("Association released");
					return Ok(());
				}
				Err(ReadError::UnexpectedPdu(Pdu::AbortRQ { source })) => {
					info!("Association aborted by peer ({source:?})");
					return Ok(());
				}
				Err(err) => return Err(err.into()),
			};

			match message.command_field()? {
				COMMAND_FIELD_COMPOSITE_ECHO_REQUEST => {
					debug!("Received C-ECHO-RQ");
					let response = CompositeEchoResponse {
						message_id: message.message_id()?,
						status: status::SUCCESS,
						presentation_context_id: message.presentation_context_id,
					};
					association
						.write_message(response, None, RESPONSE_TIMEOUT)
						.await?;
				}
				COMMAND_FIELD_COMPOSITE_STORE_REQUEST => {
					let presentation_context_id = message.presentation_context_id;
					let response = store(&inner, &association, &calling_aet, &host, message).await?;
					association
						.write_message(response, presentation_context_id, RESPONSE_TIMEOUT)
						.await?;
				}
				command_field => {
					anyhow::bail!("Unsupported command field {command_field:#06x}");
				}
			}
		}
	}
}

/// Hands one received instance to the dispatch guard and builds the response.
async fn store(
	inner: &InnerStoreServiceClassProvider,
	association: &ServerAssociation,
	calling_aet: &str,
	host: &str,
	message: DicomMessage,
) -> anyhow::Result<CompositeStoreResponse> {
	let request = CompositeStoreRequest::try_from(message)?;
	info!(
		sop_instance_uid = request.affected_sop_instance_uid,
		sop_class_uid = request.affected_sop_class_uid,
		"Received instance"
	);

	let transfer_syntax = association
		.presentation_contexts()
		.iter()
		.find(|pctx| Some(pctx.id) == request.presentation_context_id)
		.or_else(|| association.presentation_contexts().first())
		.map(|pctx| pctx.transfer_syntax.clone())
		.context("No presentation context available")?;

	let meta = FileMetaTableBuilder::new()
		.media_storage_sop_class_uid(request.affected_sop_class_uid.as_str())
		.media_storage_sop_instance_uid(request.affected_sop_instance_uid.as_str())
		.transfer_syntax(transfer_syntax)
		.build();

	let status = match meta {
		Ok(meta) => {
			let admission = AdmissionRequest {
				called_aet: inner.config.aet.clone(),
				calling_aet: calling_aet.to_owned(),
				host: host.to_owned(),
				instance: Arc::new(request.data_set.with_exact_meta(meta)),
			};
			admission_status(inner.guard.admit(admission).await)
		}
		Err(err) => {
			warn!("Unable to build file meta information: {err}");
			status::CANNOT_UNDERSTAND
		}
	};

	Ok(CompositeStoreResponse {
		message_id: request.message_id,
		sop_class_uid: request.affected_sop_class_uid,
		sop_instance_uid: request.affected_sop_instance_uid,
		status,
	})
}

fn admission_status(result: Result<Admitted, AdmissionError>) -> US {
	match result {
		Ok(Admitted::Queued { key }) => {
			debug!(key, "Instance queued");
			status::SUCCESS
		}
		Ok(Admitted::Ignored) => status::SUCCESS,
		Err(AdmissionError::InsufficientStorage { available }) => {
			warn!(available, "Rejected instance, storage is full");
			status::OUT_OF_RESOURCES
		}
		Err(AdmissionError::Queue(QueueError::ShuttingDown)) => {
			warn!("Rejected instance, shutting down");
			status::PROCESSING_FAILURE
		}
		Err(err) => {
			error!("Failed to admit instance: {err}");
			status::PROCESSING_FAILURE
		}
	}
}
