//! Error types for ZFS operations.

use std::fmt;
use std::io;

/// Error raised by a capability predicate (dataset or version filter).
#[derive(Debug)]
pub struct FilterError {
	pub message: String,
}

impl FilterError {
	pub fn new(message: impl Into<String>) -> Self {
		FilterError { message: message.into() }
	}
}

impl fmt::Display for FilterError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for FilterError {}

#[derive(Debug)]
pub enum ZfsError {
	/// I/O failure spawning or talking to the zfs binary
	Io(io::Error),
	/// The zfs command exited with a non-zero status
	CommandFailed { command: String, stderr: String },
	/// Unparseable zfs list output
	Parse { line: String, message: String },
	/// Malformed dataset path
	InvalidPath { path: String, message: String },
	/// A capability predicate failed to evaluate
	Filter(FilterError),
}

impl fmt::Display for ZfsError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ZfsError::Io(e) => write!(f, "I/O error: {}", e),
			ZfsError::CommandFailed { command, stderr } => {
				write!(f, "command '{}' failed: {}", command, stderr.trim_end())
			}
			ZfsError::Parse { line, message } => {
				write!(f, "cannot parse zfs output line '{}': {}", line, message)
			}
			ZfsError::InvalidPath { path, message } => {
				write!(f, "invalid dataset path '{}': {}", path, message)
			}
			ZfsError::Filter(e) => write!(f, "error evaluating filter: {}", e),
		}
	}
}

impl std::error::Error for ZfsError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			ZfsError::Io(e) => Some(e),
			ZfsError::Filter(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for ZfsError {
	fn from(e: io::Error) -> Self {
		ZfsError::Io(e)
	}
}

impl From<FilterError> for ZfsError {
	fn from(e: FilterError) -> Self {
		ZfsError::Filter(e)
	}
}

// vim: ts=4
