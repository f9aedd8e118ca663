//! This module contains the DIMSE backend.
//! The gateway only acts as a service class provider: it answers C-ECHO and accepts C-STORE
//! requests, routing each received instance through the [`DispatchGuard`](crate::pipeline::DispatchGuard).

mod cecho;
mod cstore;

pub mod association;

use crate::types::{UI, US};
use association::{Association, AssociationError};
pub use cstore::storescp::StoreServiceClassProvider;
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType, PresentationContextNegotiated};
use dicom::ul::Pdu;
use std::fmt::{Debug, Formatter};
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message has no data set.
pub const DATA_SET_MISSING: US = 0x0101; // DICOM NULL

/// Status codes sent in DIMSE responses.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
pub mod status {
	use crate::types::US;

	pub const SUCCESS: US = 0x0000;
	/// Refused: Out of Resources
	pub const OUT_OF_RESOURCES: US = 0xA700;
	/// Error: Cannot understand
	pub const CANNOT_UNDERSTAND: US = 0xC000;
	pub const PROCESSING_FAILURE: US = 0x0110;
}

/// Represents a DICOM message composed of a command set followed by an optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	/// The command set.
	pub command: InMemDicomObject,
	/// The data set.
	pub data: Option<InMemDicomObject>,
	/// The presentation context the message was received on or should be sent on.
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command, data }}")
		} else {
			write!(f, "DicomMessage {{ command }}")
		}
	}
}

impl DicomMessage {
	pub fn command_field(&self) -> Result<US, ReadError> {
		self.command
			.get(tags::COMMAND_FIELD)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.ok_or(ReadError::MissingAttribute(tags::COMMAND_FIELD))
	}

	pub fn message_id(&self) -> Result<US, ReadError> {
		self.command
			.get(tags::MESSAGE_ID)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID))
	}

	pub fn command_uid(&self, tag: Tag) -> Result<UI, ReadError> {
		self.command
			.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
			.ok_or(ReadError::MissingAttribute(tag))
	}
}

pub trait DicomMessageReader {
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError>;
}

pub trait DicomMessageWriter {
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError>;
}

fn find_presentation_context(
	contexts: &[PresentationContextNegotiated],
	id: Option<u8>,
) -> Result<&PresentationContextNegotiated, NegotiationError> {
	match id {
		None => contexts.first(),
		Some(id) => contexts.iter().find(|pctx| pctx.id == id),
	}
	.ok_or(NegotiationError::NoPresentationContext)
}

impl<A: Association> DicomMessageWriter for A {
	#[instrument(skip_all)]
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError> {
		let message: DicomMessage = Into::into(message);
		let presentation_context = find_presentation_context(
			self.presentation_contexts(),
			presentation_context_id.or(message.presentation_context_id),
		)?;

		let mut command_buf = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;
		self.send(
			Pdu::PData {
				data: vec![PDataValue {
					value_type: PDataValueType::Command,
					presentation_context_id: presentation_context.id,
					is_last: true,
					data: command_buf,
				}],
			},
			timeout,
		)
		.await?;

		if let Some(data) = message.data {
			let transfer_syntax = TransferSyntaxRegistry
				.get(&presentation_context.transfer_syntax)
				.ok_or_else(|| {
					NegotiationError::UnknownTransferSyntax(UI::from(
						&presentation_context.transfer_syntax,
					))
				})?;
			let mut data_buf = Vec::new();
			data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;
			self.send(
				Pdu::PData {
					data: vec![PDataValue {
						value_type: PDataValueType::Data,
						presentation_context_id: presentation_context.id,
						is_last: true,
						data: data_buf,
					}],
				},
				timeout,
			)
			.await?;
		}

		Ok(())
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Pdu),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute {0} is missing")]
	MissingAttribute(Tag),
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Failed to negotiate a presentation context")]
	NoPresentationContext,
}

impl<A: Association> DicomMessageReader for A {
	#[instrument(skip_all)]
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let mut command_fragments = Vec::new();
		let mut data_fragments = Vec::new();
		let mut message_command: Option<InMemDicomObject> = None;

		loop {
			let data = match self.receive(timeout).await? {
				Pdu::PData { data } => data,
				// A-RELEASE-RQ and A-ABORT end up here as well
				pdu => return Err(ReadError::UnexpectedPdu(pdu)),
			};

			for mut pdv in data {
				match pdv.value_type {
					PDataValueType::Command => {
						trace!("Received command fragment (last={})", pdv.is_last);
						if message_command.is_some() {
							return Err(ReadError::OutOfOrder);
						}
						command_fragments.append(&mut pdv.data);
						if !pdv.is_last {
							continue;
						}

						let command = InMemDicomObject::read_dataset_with_ts(
							command_fragments.as_slice(),
							&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
						)?;
						let has_data_set = command
							.get(tags::COMMAND_DATA_SET_TYPE)
							.map(InMemElement::to_int::<US>)
							.and_then(Result::ok)
							.is_some_and(|value| value != DATA_SET_MISSING);

						if !has_data_set {
							return Ok(DicomMessage {
								command,
								data: None,
								presentation_context_id: Some(pdv.presentation_context_id),
							});
						}
						message_command = Some(command);
					}
					PDataValueType::Data => {
						trace!("Received data fragment (last={})", pdv.is_last);
						data_fragments.append(&mut pdv.data);
						if !pdv.is_last {
							continue;
						}

						// Cannot handle data fragments before the entire command set is received.
						let command = message_command.take().ok_or(ReadError::OutOfOrder)?;
						let presentation_context = find_presentation_context(
							self.presentation_contexts(),
							Some(pdv.presentation_context_id),
						)?;
						let transfer_syntax = TransferSyntaxRegistry
							.get(&presentation_context.transfer_syntax)
							.ok_or_else(|| {
								NegotiationError::UnknownTransferSyntax(UI::from(
									&presentation_context.transfer_syntax,
								))
							})?;
						let data = InMemDicomObject::read_dataset_with_ts(
							data_fragments.as_slice(),
							transfer_syntax,
						)?;

						return Ok(DicomMessage {
							command,
							data: Some(data),
							presentation_context_id: Some(pdv.presentation_context_id),
						});
					}
				}
			}
		}
	}
}
