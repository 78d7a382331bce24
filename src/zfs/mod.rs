//! ZFS domain model and local adapter.
//!
//! Pure data types (paths, versions, the traversal forest, the version
//! diff) plus the [`ops::ZfsOps`] trait the rest of the core programs
//! against and its `zfs` CLI implementation.

pub mod cli;
pub mod dataset_path;
pub mod diff;
pub mod error;
pub mod forest;
pub mod ops;
pub mod version;

pub use cli::ZfsCli;
pub use dataset_path::DatasetPath;
pub use diff::{make_filesystem_diff, Conflict, FilesystemDiff};
pub use error::{FilterError, ZfsError};
pub use forest::{DatasetPathForest, DatasetPathVisit};
pub use ops::{
	DatasetFilter, FilesystemState, RecvOptions, RecvSink, SendStream, VersionFilter, ZfsOps,
	PLACEHOLDER_PROPERTY,
};
pub use version::{FilesystemVersion, VersionKind};

// vim: ts=4
