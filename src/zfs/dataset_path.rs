//! Hierarchical dataset paths.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::error::ZfsError;

/// A ZFS dataset path: an ordered sequence of non-empty name
/// components, rendered with `/` separators. The empty path is
/// invalid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatasetPath {
	components: Vec<String>,
}

impl DatasetPath {
	pub fn new(s: &str) -> Result<Self, ZfsError> {
		let invalid = |message: &str| ZfsError::InvalidPath {
			path: s.to_string(),
			message: message.to_string(),
		};
		if s.is_empty() {
			return Err(invalid("path must not be empty"));
		}
		let mut components = Vec::new();
		for comp in s.split('/') {
			if comp.is_empty() {
				return Err(invalid("empty path component"));
			}
			if comp.contains(|c: char| c.is_whitespace()) {
				return Err(invalid("whitespace in path component"));
			}
			if comp.contains('@') || comp.contains('#') {
				return Err(invalid("version delimiter in path component"));
			}
			components.push(comp.to_string());
		}
		Ok(DatasetPath { components })
	}

	pub fn components(&self) -> &[String] {
		&self.components
	}

	pub fn len(&self) -> usize {
		self.components.len()
	}

	pub fn is_empty(&self) -> bool {
		self.components.is_empty()
	}

	/// The pool this dataset lives in (the first component).
	pub fn pool(&self) -> &str {
		&self.components[0]
	}

	pub fn starts_with(&self, prefix: &DatasetPath) -> bool {
		self.components.len() >= prefix.components.len()
			&& self.components[..prefix.components.len()] == prefix.components[..]
	}

	/// The components of `self` below `prefix`, or `None` if `self`
	/// does not live under it. Equal paths yield an empty suffix.
	pub fn suffix_under(&self, prefix: &DatasetPath) -> Option<&[String]> {
		if !self.starts_with(prefix) {
			return None;
		}
		Some(&self.components[prefix.components.len()..])
	}

	/// `self` extended by the given components.
	pub fn join(&self, suffix: &[String]) -> DatasetPath {
		let mut components = self.components.clone();
		components.extend_from_slice(suffix);
		DatasetPath { components }
	}

	pub(crate) fn from_components(components: Vec<String>) -> DatasetPath {
		DatasetPath { components }
	}
}

impl fmt::Display for DatasetPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.components.join("/"))
	}
}

impl FromStr for DatasetPath {
	type Err = ZfsError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		DatasetPath::new(s)
	}
}

impl Serialize for DatasetPath {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for DatasetPath {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		DatasetPath::new(&s).map_err(serde::de::Error::custom)
	}
}


// vim: ts=4
