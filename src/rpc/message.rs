//! Message layer: typed headers and data streams on top of frames.
//!
//! A well-formed exchange in one direction is exactly one header
//! message followed, if the header announces a body, by one data
//! message. Headers are JSON-encoded and capped at 4 KiB; data messages
//! are unbounded.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::RpcError;
use super::frame::{FrameConn, FrameReader, FrameType, FrameWriter, MAX_HEADER_LENGTH};

/// Reply status carried in a response header.
///
/// The zero value is reserved for "not set" so that a reply that never
/// assigned a status is detectable as a protocol violation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Status {
	#[default]
	NotSet,
	Ok,
	RequestError,
	ServerError,
}

impl From<Status> for u8 {
	fn from(s: Status) -> u8 {
		match s {
			Status::NotSet => 0,
			Status::Ok => 1,
			Status::RequestError => 2,
			Status::ServerError => 3,
		}
	}
}

impl TryFrom<u8> for Status {
	type Error = String;

	fn try_from(b: u8) -> Result<Self, String> {
		match b {
			0 => Ok(Status::NotSet),
			1 => Ok(Status::Ok),
			2 => Ok(Status::RequestError),
			3 => Ok(Status::ServerError),
			_ => Err(format!("invalid status {}", b)),
		}
	}
}

impl std::fmt::Display for Status {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			Status::NotSet => "status not set",
			Status::Ok => "OK",
			Status::RequestError => "request error",
			Status::ServerError => "server error",
		};
		write!(f, "{}", name)
	}
}

/// Body type announced by a header, for both requests and replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DataType {
	#[default]
	None,
	MarshaledJson,
	Octets,
}

impl From<DataType> for u8 {
	fn from(t: DataType) -> u8 {
		match t {
			DataType::None => 0,
			DataType::MarshaledJson => 1,
			DataType::Octets => 2,
		}
	}
}

impl TryFrom<u8> for DataType {
	type Error = String;

	fn try_from(b: u8) -> Result<Self, String> {
		match b {
			0 => Ok(DataType::None),
			1 => Ok(DataType::MarshaledJson),
			2 => Ok(DataType::Octets),
			_ => Err(format!("invalid data type {}", b)),
		}
	}
}

impl std::fmt::Display for DataType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			DataType::None => "none",
			DataType::MarshaledJson => "marshaled JSON",
			DataType::Octets => "octets",
		};
		write!(f, "{}", name)
	}
}

/// Request and reply header. Request headers fill `endpoint`,
/// `data_type` and `accept`; reply headers fill `data_type`, `error`
/// and `error_message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Header {
	pub endpoint: String,
	pub data_type: DataType,
	pub accept: DataType,
	pub error: Status,
	pub error_message: String,
}

impl Header {
	pub fn error(status: Status, message: impl Into<String>) -> Self {
		Header { error: status, error_message: message.into(), ..Header::default() }
	}
}

/// Minimal byte-stream abstraction for message bodies.
///
/// Both the frame-backed data reader and test fixtures implement this;
/// everything that consumes a transfer stream depends on it instead of
/// a concrete channel type.
#[async_trait]
pub trait ByteStream: Send {
	/// Read up to `buf.len()` bytes; `Ok(0)` means end of stream.
	async fn read(&mut self, buf: &mut [u8]) -> Result<usize, RpcError>;
}

#[async_trait]
impl ByteStream for FrameReader<'_> {
	async fn read(&mut self, buf: &mut [u8]) -> Result<usize, RpcError> {
		FrameReader::read(self, buf).await
	}
}

/// Composes frames into messages over one byte channel.
pub struct MessageLayer {
	conn: FrameConn,
}

impl MessageLayer {
	pub fn new(
		r: Box<dyn AsyncRead + Send + Unpin>,
		w: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
	) -> Self {
		MessageLayer { conn: FrameConn::new(r, w) }
	}

	pub async fn read_header(&mut self) -> Result<Header, RpcError> {
		let mut r = FrameReader::new(&mut self.conn, FrameType::Header, Some(MAX_HEADER_LENGTH));
		let mut buf = Vec::new();
		r.read_to_end(&mut buf).await?;
		let h = serde_json::from_slice(&buf)
			.map_err(|e| RpcError::Protocol(format!("cannot decode header: {}", e)))?;
		Ok(h)
	}

	pub async fn write_header(&mut self, h: &Header) -> Result<(), RpcError> {
		let buf = serde_json::to_vec(h)?;
		let mut w = FrameWriter::new(&mut self.conn, FrameType::Header, Some(MAX_HEADER_LENGTH));
		w.write(&buf).await?;
		w.close().await
	}

	/// Byte-stream view over the incoming data message.
	pub fn data_reader(&mut self) -> FrameReader<'_> {
		FrameReader::new(&mut self.conn, FrameType::Data, None)
	}

	/// Stream `src` as the outgoing data message. Returns the number of
	/// bytes copied.
	pub async fn write_data(
		&mut self,
		src: &mut (dyn AsyncRead + Send + Unpin),
	) -> Result<u64, RpcError> {
		let mut w = FrameWriter::new(&mut self.conn, FrameType::Data, None);
		let mut chunk = vec![0u8; 64 * 1024];
		let mut total = 0u64;
		loop {
			let n = src.read(&mut chunk).await?;
			if n == 0 {
				break;
			}
			w.write(&chunk[..n]).await?;
			total += n as u64;
		}
		w.close().await?;
		Ok(total)
	}

	/// Write an in-memory buffer as the outgoing data message.
	pub async fn write_data_buf(&mut self, data: &[u8]) -> Result<(), RpcError> {
		let mut w = FrameWriter::new(&mut self.conn, FrameType::Data, None);
		w.write(data).await?;
		w.close().await
	}

	pub async fn hang_up(&mut self) -> Result<(), RpcError> {
		self.conn.hang_up().await
	}

	pub async fn shutdown(&mut self) -> Result<(), RpcError> {
		self.conn.shutdown().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pipe() -> (MessageLayer, MessageLayer) {
		let (a, b) = tokio::io::duplex(1024 * 1024);
		let (ar, aw) = tokio::io::split(a);
		let (br, bw) = tokio::io::split(b);
		(
			MessageLayer::new(Box::new(ar), Box::new(aw)),
			MessageLayer::new(Box::new(br), Box::new(bw)),
		)
	}

	#[tokio::test]
	async fn test_header_roundtrip() {
		let (mut tx, mut rx) = pipe();
		let h = Header {
			endpoint: "FilesystemRequest".to_string(),
			data_type: DataType::MarshaledJson,
			accept: DataType::MarshaledJson,
			..Header::default()
		};
		tx.write_header(&h).await.unwrap();
		let got = rx.read_header().await.unwrap();
		assert_eq!(got.endpoint, h.endpoint);
		assert_eq!(got.data_type, h.data_type);
		assert_eq!(got.accept, h.accept);
		assert_eq!(got.error, Status::NotSet);
	}

	#[tokio::test]
	async fn test_header_and_data_message_sequence() {
		let (mut tx, mut rx) = pipe();
		let h = Header::error(Status::Ok, "");
		tx.write_header(&h).await.unwrap();
		tx.write_data_buf(b"payload bytes").await.unwrap();

		let got = rx.read_header().await.unwrap();
		assert_eq!(got.error, Status::Ok);
		let mut out = Vec::new();
		rx.data_reader().read_to_end(&mut out).await.unwrap();
		assert_eq!(out, b"payload bytes");
	}

	#[tokio::test]
	async fn test_garbage_header_is_protocol_error() {
		let (mut tx, mut rx) = pipe();
		// A data message where a header message is expected.
		tx.write_data_buf(b"{}").await.unwrap();
		assert!(matches!(rx.read_header().await, Err(RpcError::Protocol(_))));
	}
}

// vim: ts=4
