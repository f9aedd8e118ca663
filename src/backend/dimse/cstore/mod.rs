pub mod storescp;

use crate::backend::dimse::{DicomMessage, ReadError, DATA_SET_MISSING};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;
pub const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: US = 0x8001;

/// C-STORE-RQ
pub struct CompositeStoreRequest {
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub message_id: US,
	pub presentation_context_id: Option<u8>,
	pub data_set: InMemDicomObject,
}

impl TryFrom<DicomMessage> for CompositeStoreRequest {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let message_id = message.message_id()?;
		let affected_sop_class_uid = message.command_uid(tags::AFFECTED_SOP_CLASS_UID)?;
		let affected_sop_instance_uid = message.command_uid(tags::AFFECTED_SOP_INSTANCE_UID)?;
		let data_set = message.data.ok_or(ReadError::MissingAttribute(tags::COMMAND_DATA_SET_TYPE))?;

		Ok(Self {
			affected_sop_class_uid,
			affected_sop_instance_uid,
			message_id,
			presentation_context_id: message.presentation_context_id,
			data_set,
		})
	}
}

/// C-STORE-RSP
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub status: US,
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid)),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::dimse::status;

	#[rustfmt::skip]
	fn store_request(with_instance_uid: bool) -> DicomMessage {
		let mut command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_REQUEST])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0102])),
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.2\0")),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [3])),
		]);
		if with_instance_uid {
			command.put_element(DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3.4")));
		}
		DicomMessage {
			command,
			data: Some(InMemDicomObject::new_empty()),
			presentation_context_id: Some(5),
		}
	}

	#[test]
	fn parses_store_request() {
		let request = CompositeStoreRequest::try_from(store_request(true)).unwrap();
		assert_eq!(request.affected_sop_class_uid, "1.2.840.10008.5.1.4.1.1.2");
		assert_eq!(request.affected_sop_instance_uid, "1.2.3.4");
		assert_eq!(request.message_id, 3);
		assert_eq!(request.presentation_context_id, Some(5));
	}

	#[test]
	fn rejects_request_without_instance_uid() {
		let result = CompositeStoreRequest::try_from(store_request(false));
		assert!(matches!(
			result,
			Err(ReadError::MissingAttribute(tag)) if tag == tags::AFFECTED_SOP_INSTANCE_UID
		));
	}

	#[test]
	fn response_carries_status() {
		let message = DicomMessage::from(CompositeStoreResponse {
			message_id: 3,
			sop_class_uid: UI::from("1.2.840.10008.5.1.4.1.1.2"),
			sop_instance_uid: UI::from("1.2.3.4"),
			status: status::OUT_OF_RESOURCES,
		});

		let code = message.command.element(tags::STATUS).unwrap().to_int::<US>().unwrap();
		assert_eq!(code, status::OUT_OF_RESOURCES);
		assert_eq!(
			message.command_field().unwrap(),
			COMMAND_FIELD_COMPOSITE_STORE_RESPONSE
		);
	}
}
