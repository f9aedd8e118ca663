use super::{oneshot, AskPattern, Association, AssociationError, ChannelError, Command, Sender};
use crate::types::AE;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{AbortRQSource, Pdu, PresentationContextNegotiated};
use std::convert::identity;
use std::io::ErrorKind;
use std::{net::TcpStream, thread, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Server side of an association.
///
/// `dicom-ul` only offers blocking IO, so the association lives on a dedicated thread
/// and is driven through a command channel.
#[derive(Debug)]
pub struct ServerAssociation {
	channel: Sender<Command>,
	presentation_contexts: Vec<PresentationContextNegotiated>,
	calling_aet: AE,
	tcp_stream: TcpStream,
}

pub struct ServerAssociationOptions {
	/// The AE title this node answers to. Associations calling any other title are rejected.
	pub aet: AE,
	pub tcp_stream: TcpStream,
	pub uncompressed: bool,
}

struct Established {
	tcp_stream: TcpStream,
	presentation_contexts: Vec<PresentationContextNegotiated>,
	calling_aet: AE,
}

impl ServerAssociation {
	pub async fn new(options: ServerAssociationOptions) -> Result<Self, AssociationError> {
		let association_id = Uuid::new_v4();
		let mut server_options = dicom::ul::ServerAssociationOptions::new()
			.ae_title(options.aet.clone())
			.accept_called_ae_title()
			.promiscuous(true);

		for syntax in TransferSyntaxRegistry.iter() {
			if (options.uncompressed && syntax.is_codec_free())
				|| (!options.uncompressed && !syntax.is_unsupported())
			{
				server_options = server_options.with_transfer_syntax(syntax.uid());
			}
		}

		let (connect_tx, connect_result) = oneshot::channel::<Result<Established, AssociationError>>();
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);

		thread::Builder::new()
			.name(format!("{}-server", options.aet))
			.spawn(move || {
				let span = tracing::info_span!(
					"ServerAssociation",
					association_id = association_id.to_string()
				);
				let _enter = span.enter();

				let mut association = match server_options.establish(options.tcp_stream) {
					Ok(association) => association,
					Err(err) => {
						let _ = connect_tx.send(Err(err.into()));
						return;
					}
				};
				let calling_aet = AE::from(association.client_ae_title());
				info!(
					calling_aet = calling_aet,
					called_aet = options.aet,
					"Established new server association"
				);

				let established = association
					.inner_stream()
					.try_clone()
					.map_err(AssociationError::Stream)
					.map(|tcp_stream| Established {
						tcp_stream,
						presentation_contexts: association.presentation_contexts().to_vec(),
						calling_aet,
					});
				let failed = established.is_err();
				if connect_tx.send(established).is_err() || failed {
					let _ = association.abort();
					return;
				}

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, response) => {
							let sent = association.send(&pdu).map_err(AssociationError::Association);
							response.send(sent).map_err(|_| ChannelError::Closed)
						}
						Command::Receive(response) => {
							let received = association.receive().map_err(AssociationError::Association);
							response.send(received).map_err(|_| ChannelError::Closed)
						}
					};

					if let Err(err) = result {
						error!("Error in ServerAssociation: {err}");
						return;
					}
				}

				rx.close();

				if let Err(err) = association.abort() {
					match err {
						dicom::ul::association::Error::WireSend { source, .. }
							if source.kind() == ErrorKind::BrokenPipe => {}
						_ => warn!("ServerAssociation.abort() returned error: {err}"),
					}
				}
			})
			.map_err(AssociationError::OsThread)?;

		let established = connect_result
			.await
			.map_err(|_| AssociationError::Channel(ChannelError::Closed))??;

		Ok(Self {
			channel: tx,
			presentation_contexts: established.presentation_contexts,
			calling_aet: established.calling_aet,
			tcp_stream: established.tcp_stream,
		})
	}

	/// The AE title of the peer that requested the association.
	pub fn calling_aet(&self) -> &str {
		&self.calling_aet
	}

	/// Sends an A-ABORT and closes the connection.
	pub async fn abort(mut self, timeout: Duration) {
		let abort = Pdu::AbortRQ {
			source: AbortRQSource::ServiceUser,
		};
		if let Err(err) = self.send(abort, timeout).await {
			debug!("Failed to send A-ABORT: {err}");
		}
		self.close();
	}
}

impl Association for ServerAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		debug!("Closing TcpStream from outside");
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			if err.kind() != ErrorKind::NotConnected {
				warn!("TcpStream::shutdown failed: {err}");
			}
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}
}

impl Drop for ServerAssociation {
	fn drop(&mut self) {
		self.close();
	}
}
