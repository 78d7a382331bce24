//! Abstract interface over local ZFS operations.
//!
//! The replication core only ever talks to ZFS through [`ZfsOps`]; the
//! production implementation shells out to the `zfs` binary and tests
//! substitute an in-memory fake. All operations are synchronous from
//! the caller's point of view and fail atomically.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::io::AsyncRead;

use super::dataset_path::DatasetPath;
use super::error::{FilterError, ZfsError};
use super::version::FilesystemVersion;

/// User property marking a dataset as a placeholder. The value `on`
/// means placeholder; any other value or absence means a normal
/// dataset.
pub const PLACEHOLDER_PROPERTY: &str = "zrepl:placeholder";

/// Capability predicate over dataset paths (the pull ACL).
pub trait DatasetFilter: Send + Sync {
	fn filter(&self, path: &DatasetPath) -> Result<bool, FilterError>;
}

/// Capability predicate over filesystem versions.
pub trait VersionFilter: Send + Sync {
	fn filter(&self, version: &FilesystemVersion) -> Result<bool, FilterError>;
}

/// Local state of one filesystem as far as replication cares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilesystemState {
	pub placeholder: bool,
}

/// A `zfs send` output stream. Owns whatever produces the bytes.
pub type SendStream = Box<dyn AsyncRead + Send + Unpin>;

/// Options for receiving a stream into a local filesystem. The
/// receive never mounts the result; `force_rollback` additionally
/// rolls the target back, which is how a placeholder gets replaced by
/// real data.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecvOptions {
	pub force_rollback: bool,
}

/// Consumer side of an in-progress `zfs receive`.
///
/// The stream is fed in chunks through `write_all`; `finish` completes
/// the receive and reports whether it succeeded as a whole. An aborted
/// receive leaves no partial state behind.
#[async_trait]
pub trait RecvSink: Send {
	async fn write_all(&mut self, buf: &[u8]) -> Result<(), ZfsError>;

	/// Close the input and wait for the receive to complete.
	async fn finish(self: Box<Self>) -> Result<(), ZfsError>;

	/// Tear down the receive without completing it.
	async fn abort(self: Box<Self>);
}

#[async_trait]
pub trait ZfsOps: Send + Sync {
	/// All filesystems the filter admits, parents before children.
	async fn list_filesystems(
		&self,
		filter: &dyn DatasetFilter,
	) -> Result<Vec<DatasetPath>, ZfsError>;

	/// Replication-relevant state of every local filesystem, keyed by
	/// the rendered dataset path.
	async fn list_filesystem_state(
		&self,
	) -> Result<BTreeMap<String, FilesystemState>, ZfsError>;

	/// Snapshots and bookmarks of one filesystem in creation order,
	/// optionally narrowed by a version filter.
	async fn list_filesystem_versions(
		&self,
		fs: &DatasetPath,
		filter: Option<&dyn VersionFilter>,
	) -> Result<Vec<FilesystemVersion>, ZfsError>;

	/// Open a send stream. `from = None` produces the full stream of
	/// `to`; otherwise the delta between the two versions.
	async fn send(
		&self,
		fs: &DatasetPath,
		from: Option<&FilesystemVersion>,
		to: &FilesystemVersion,
	) -> Result<SendStream, ZfsError>;

	/// Start receiving a stream into `fs`.
	async fn recv(
		&self,
		fs: &DatasetPath,
		opts: RecvOptions,
	) -> Result<Box<dyn RecvSink>, ZfsError>;

	/// Set a dataset property.
	async fn set(&self, fs: &DatasetPath, property: &str, value: &str) -> Result<(), ZfsError>;

	/// Create an empty filesystem marked with the placeholder property,
	/// present solely to host children in the hierarchy.
	async fn create_placeholder(&self, fs: &DatasetPath) -> Result<(), ZfsError>;
}

// vim: ts=4
