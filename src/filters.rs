//! Dataset filters, version filters and dataset mappings.
//!
//! Filters are the ACL a source job applies before exposing anything to
//! a puller; mappings are the pull job's translation from remote
//! dataset paths to local ones. All of them are small capability
//! predicates handed into the core as trait objects.

use crate::zfs::{
	DatasetFilter, DatasetPath, FilesystemVersion, FilterError, VersionFilter, VersionKind,
};

/// Admits a dataset iff it equals or descends from one of the
/// configured prefixes.
pub struct PrefixDatasetFilter {
	prefixes: Vec<DatasetPath>,
}

impl PrefixDatasetFilter {
	pub fn new(prefixes: Vec<DatasetPath>) -> Self {
		PrefixDatasetFilter { prefixes }
	}
}

impl DatasetFilter for PrefixDatasetFilter {
	fn filter(&self, path: &DatasetPath) -> Result<bool, FilterError> {
		Ok(self.prefixes.iter().any(|p| path.starts_with(p)))
	}
}

/// Admits every dataset. Used by local pull jobs where the mapping
/// already decides what is replicated.
pub struct AnyDatasetFilter;

impl DatasetFilter for AnyDatasetFilter {
	fn filter(&self, _path: &DatasetPath) -> Result<bool, FilterError> {
		Ok(true)
	}
}

/// Admits snapshots whose name starts with the configured prefix.
/// Bookmarks never pass: they cannot be sent as a full stream and a
/// source exposes them only through snapshot history.
pub struct PrefixSnapshotFilter {
	prefix: String,
}

impl PrefixSnapshotFilter {
	pub fn new(prefix: impl Into<String>) -> Self {
		PrefixSnapshotFilter { prefix: prefix.into() }
	}
}

impl VersionFilter for PrefixSnapshotFilter {
	fn filter(&self, version: &FilesystemVersion) -> Result<bool, FilterError> {
		Ok(version.kind == VersionKind::Snapshot && version.name.starts_with(&self.prefix))
	}
}

/// Translation from remote dataset paths to local ones.
///
/// `Ok(None)` means the path has no mapping and is skipped silently;
/// an error aborts the pull cycle.
pub trait DatasetMapping: Send + Sync {
	fn map(&self, remote: &DatasetPath) -> Result<Option<DatasetPath>, FilterError>;
}

/// Prefix-based mapping table. The longest matching prefix entry wins;
/// the remote path's suffix below the prefix is appended to the entry's
/// target.
pub struct DatasetMapFilter {
	entries: Vec<MapEntry>,
}

struct MapEntry {
	prefix: DatasetPath,
	target: DatasetPath,
}

impl DatasetMapFilter {
	pub fn new() -> Self {
		DatasetMapFilter { entries: Vec::new() }
	}

	/// Build from rendered `prefix -> target` pairs as they appear in a
	/// job configuration.
	pub fn from_entries<'a, I>(entries: I) -> Result<Self, FilterError>
	where
		I: IntoIterator<Item = (&'a str, &'a str)>,
	{
		let mut m = DatasetMapFilter::new();
		for (prefix, target) in entries {
			let prefix = DatasetPath::new(prefix)
				.map_err(|e| FilterError::new(format!("invalid mapping prefix: {}", e)))?;
			let target = DatasetPath::new(target)
				.map_err(|e| FilterError::new(format!("invalid mapping target: {}", e)))?;
			m.add(prefix, target);
		}
		Ok(m)
	}

	pub fn add(&mut self, prefix: DatasetPath, target: DatasetPath) {
		self.entries.push(MapEntry { prefix, target });
	}
}

impl Default for DatasetMapFilter {
	fn default() -> Self {
		DatasetMapFilter::new()
	}
}

impl DatasetMapping for DatasetMapFilter {
	fn map(&self, remote: &DatasetPath) -> Result<Option<DatasetPath>, FilterError> {
		let best = self
			.entries
			.iter()
			.filter(|e| remote.starts_with(&e.prefix))
			.max_by_key(|e| e.prefix.len());
		let Some(entry) = best else {
			return Ok(None);
		};
		let suffix = remote
			.suffix_under(&entry.prefix)
			.expect("matched entry must be a prefix of the remote path");
		Ok(Some(entry.target.join(suffix)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn path(s: &str) -> DatasetPath {
		DatasetPath::new(s).unwrap()
	}

	fn snap(name: &str) -> FilesystemVersion {
		FilesystemVersion {
			kind: VersionKind::Snapshot,
			name: name.to_string(),
			guid: 1,
			create_txg: 1,
			creation: 1,
		}
	}

	fn bookmark(name: &str) -> FilesystemVersion {
		FilesystemVersion { kind: VersionKind::Bookmark, ..snap(name) }
	}

	#[test]
	fn test_prefix_dataset_filter() {
		let f = PrefixDatasetFilter::new(vec![path("tank/var"), path("zroot")]);
		assert!(f.filter(&path("tank/var")).unwrap());
		assert!(f.filter(&path("tank/var/db")).unwrap());
		assert!(f.filter(&path("zroot/home")).unwrap());
		assert!(!f.filter(&path("tank/usr")).unwrap());
		assert!(!f.filter(&path("tank")).unwrap());
	}

	#[test]
	fn test_prefix_snapshot_filter() {
		let f = PrefixSnapshotFilter::new("backup_");
		assert!(f.filter(&snap("backup_20170815")).unwrap());
		assert!(!f.filter(&snap("manual_1")).unwrap());
		assert!(!f.filter(&bookmark("backup_20170815")).unwrap());
	}

	#[test]
	fn test_map_filter_longest_prefix_wins() {
		let m = DatasetMapFilter::from_entries([
			("tank", "backup/misc"),
			("tank/var", "backup/var"),
		])
		.unwrap();
		assert_eq!(m.map(&path("tank/var/db")).unwrap(), Some(path("backup/var/db")));
		assert_eq!(m.map(&path("tank/usr")).unwrap(), Some(path("backup/misc/usr")));
		assert_eq!(m.map(&path("tank/var")).unwrap(), Some(path("backup/var")));
	}

	#[test]
	fn test_map_filter_no_match_is_none() {
		let m = DatasetMapFilter::from_entries([("tank/var", "backup/var")]).unwrap();
		assert_eq!(m.map(&path("zroot/home")).unwrap(), None);
	}

	#[test]
	fn test_map_filter_rejects_invalid_entries() {
		assert!(DatasetMapFilter::from_entries([("", "backup")]).is_err());
		assert!(DatasetMapFilter::from_entries([("tank", "back up")]).is_err());
	}
}

// vim: ts=4
