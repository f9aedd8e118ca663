use dicom::core::Tag;
use dicom::dictionary_std::tags;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// A DICOM tag used to decide which instances belong to the same payload.
///
/// Serialized in the `gggg,eeee` notation used by the configuration, e.g. `0020,000D`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupingTag(pub Tag);

impl GroupingTag {
	pub const STUDY_INSTANCE_UID: Self = Self(tags::STUDY_INSTANCE_UID);

	pub const fn tag(self) -> Tag {
		self.0
	}
}

impl Default for GroupingTag {
	fn default() -> Self {
		Self::STUDY_INSTANCE_UID
	}
}

impl Display for GroupingTag {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:04X},{:04X}", self.0.group(), self.0.element())
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid DICOM tag '{0}', expected the format gggg,eeee")]
pub struct InvalidTag(String);

impl FromStr for GroupingTag {
	type Err = InvalidTag;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		let trimmed = value.trim().trim_start_matches('(').trim_end_matches(')');
		let (group, element) = trimmed
			.split_once(',')
			.ok_or_else(|| InvalidTag(value.to_owned()))?;

		let parse = |part: &str| {
			let part = part.trim();
			if part.len() == 4 {
				u16::from_str_radix(part, 16).ok()
			} else {
				None
			}
		};

		match (parse(group), parse(element)) {
			(Some(group), Some(element)) => Ok(Self(Tag(group, element))),
			_ => Err(InvalidTag(value.to_owned())),
		}
	}
}

impl TryFrom<String> for GroupingTag {
	type Error = InvalidTag;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		value.parse()
	}
}

impl From<GroupingTag> for String {
	fn from(tag: GroupingTag) -> Self {
		tag.to_string()
	}
}
