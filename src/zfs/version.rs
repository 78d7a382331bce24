//! Filesystem versions: snapshots and bookmarks.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::dataset_path::DatasetPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionKind {
	Snapshot,
	Bookmark,
}

impl VersionKind {
	/// The character separating the filesystem path from the version
	/// name: `@` for snapshots, `#` for bookmarks.
	pub fn delimiter(self) -> char {
		match self {
			VersionKind::Snapshot => '@',
			VersionKind::Bookmark => '#',
		}
	}
}

/// A named, immutable point in a dataset's history.
///
/// The GUID is assigned by ZFS and stable across hosts: two versions
/// with equal GUIDs refer to the same underlying data regardless of
/// their names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FilesystemVersion {
	#[serde(rename = "Type")]
	pub kind: VersionKind,
	pub name: String,
	pub guid: u64,
	#[serde(rename = "CreateTXG")]
	pub create_txg: u64,
	/// Creation time as unix seconds.
	pub creation: u64,
}

impl FilesystemVersion {
	/// Render as an absolute ZFS reference, e.g. `tank/db@backup_1`.
	pub fn to_abs_path(&self, fs: &DatasetPath) -> String {
		format!("{}{}{}", fs, self.kind.delimiter(), self.name)
	}

	/// Render as a relative reference, e.g. `@backup_1` or `#mark`.
	pub fn relative_name(&self) -> String {
		format!("{}{}", self.kind.delimiter(), self.name)
	}
}

impl fmt::Display for FilesystemVersion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.relative_name())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn version(kind: VersionKind, name: &str) -> FilesystemVersion {
		FilesystemVersion { kind, name: name.to_string(), guid: 1, create_txg: 1, creation: 1 }
	}

	#[test]
	fn test_abs_path_rendering() {
		let fs = DatasetPath::new("tank/db").unwrap();
		assert_eq!(version(VersionKind::Snapshot, "a").to_abs_path(&fs), "tank/db@a");
		assert_eq!(version(VersionKind::Bookmark, "b").to_abs_path(&fs), "tank/db#b");
	}
}

// vim: ts=4
