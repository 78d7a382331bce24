//! Error types for the replication RPC stack.

use std::fmt;
use std::io;

use super::message::Status;

/// Error type shared by the frame, message, client and server layers.
///
/// `Protocol` and `Io` variants are terminal for the connection: the
/// side observing them hangs up. `Response` is a client-side view of a
/// non-OK reply header and leaves the connection usable.
#[derive(Debug)]
pub enum RpcError {
	/// I/O error on the byte channel
	Io(io::Error),
	/// Framing violation, oversized frame, malformed header
	Protocol(String),
	/// JSON encoding or decoding of a payload failed
	Json(serde_json::Error),
	/// Peer sent an RST frame
	Reset,
	/// The reply header reported a non-OK status
	Response { status: Status, message: String },
	/// Endpoint registry misuse (duplicate registration)
	Setup(String),
	/// Channel used after hang-up or close
	Closed,
	/// Graceful close did not complete within the allowed time
	CloseTimeout,
}

impl fmt::Display for RpcError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RpcError::Io(e) => write!(f, "I/O error: {}", e),
			RpcError::Protocol(msg) => write!(f, "protocol error: {}", msg),
			RpcError::Json(e) => write!(f, "JSON error: {}", e),
			RpcError::Reset => write!(f, "connection reset by peer"),
			RpcError::Response { status, message } => write!(f, "{}: {}", status, message),
			RpcError::Setup(msg) => write!(f, "{}", msg),
			RpcError::Closed => write!(f, "connection is closed"),
			RpcError::CloseTimeout => write!(f, "timeout waiting for graceful close"),
		}
	}
}

impl std::error::Error for RpcError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			RpcError::Io(e) => Some(e),
			RpcError::Json(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for RpcError {
	fn from(e: io::Error) -> Self {
		RpcError::Io(e)
	}
}

impl From<serde_json::Error> for RpcError {
	fn from(e: serde_json::Error) -> Self {
		RpcError::Json(e)
	}
}

// vim: ts=4
