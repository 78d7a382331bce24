//! Error types for pull orchestration.

use std::fmt;

use crate::rpc::RpcError;
use crate::zfs::ZfsError;

/// Error terminating a pull cycle.
///
/// Failures scoped to one filesystem or subtree are handled inside the
/// cycle and logged; only cycle-level failures surface here.
/// `InternalInconsistency` marks invariant breaches that indicate a
/// bug rather than an environmental failure.
#[derive(Debug)]
pub enum PullError {
	/// Remote call failed or the channel broke
	Rpc(RpcError),
	/// Local ZFS listing failed before any per-filesystem work began
	Zfs(ZfsError),
	/// The configured mapping errored for a remote path
	Mapping { remote: String, message: String },
	/// Two remote paths mapped to the same local path
	DuplicateMapping { local: String },
	/// Invariant breach, e.g. a placeholder with local versions
	InternalInconsistency(String),
	/// The cancellation token fired
	Cancelled,
}

impl fmt::Display for PullError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PullError::Rpc(e) => write!(f, "remote call failed: {}", e),
			PullError::Zfs(e) => write!(f, "local zfs operation failed: {}", e),
			PullError::Mapping { remote, message } => {
				write!(f, "error mapping {}: {}", remote, message)
			}
			PullError::DuplicateMapping { local } => {
				write!(f, "multiple remote filesystems map to local path {}", local)
			}
			PullError::InternalInconsistency(msg) => {
				write!(f, "internal inconsistency: {}", msg)
			}
			PullError::Cancelled => write!(f, "pull cycle cancelled"),
		}
	}
}

impl std::error::Error for PullError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			PullError::Rpc(e) => Some(e),
			PullError::Zfs(e) => Some(e),
			_ => None,
		}
	}
}

impl From<RpcError> for PullError {
	fn from(e: RpcError) -> Self {
		PullError::Rpc(e)
	}
}

impl From<ZfsError> for PullError {
	fn from(e: ZfsError) -> Self {
		PullError::Zfs(e)
	}
}

// vim: ts=4
