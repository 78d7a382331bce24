//! Length-prefixed frame layer.
//!
//! Every unit on the wire is a frame: a 6-byte fixed header followed by
//! up to 4 MiB of payload. Multi-byte integers are little-endian.
//!
//! ```text
//! offset  size  field
//! 0       1     Type (u8)
//! 1       1     NoMoreFrames (0 or 1)
//! 2       4     PayloadLength (u32)
//! 6       N     payload bytes
//! ```
//!
//! A logical message is a run of consecutive same-type frames; the last
//! frame of the run carries `NoMoreFrames = 1`. [`FrameReader`] and
//! [`FrameWriter`] bridge between that representation and a plain byte
//! stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::RpcError;

/// Hard upper bound on a single frame's payload.
pub const MAX_PAYLOAD_LENGTH: u32 = 4 * 1024 * 1024;

/// Upper bound on the total length of a header-carrying frame run.
pub const MAX_HEADER_LENGTH: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
	Header,
	Data,
	Trailer,
	Rst,
}

impl FrameType {
	pub fn as_u8(self) -> u8 {
		match self {
			FrameType::Header => 0x01,
			FrameType::Data => 0x02,
			FrameType::Trailer => 0x03,
			FrameType::Rst => 0xff,
		}
	}

	pub fn from_u8(b: u8) -> Option<Self> {
		match b {
			0x01 => Some(FrameType::Header),
			0x02 => Some(FrameType::Data),
			0x03 => Some(FrameType::Trailer),
			0xff => Some(FrameType::Rst),
			_ => None,
		}
	}
}

impl std::fmt::Display for FrameType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			FrameType::Header => "Header",
			FrameType::Data => "Data",
			FrameType::Trailer => "Trailer",
			FrameType::Rst => "RST",
		};
		write!(f, "{}", name)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
	pub frame_type: FrameType,
	pub no_more_frames: bool,
	pub payload_length: u32,
}

/// The byte channel a replication session runs over, with frame-level
/// read and write primitives.
///
/// The transport hands in the two halves (a subprocess's stdio, the
/// process's own stdio, or an in-memory duplex in tests). The channel
/// is owned by exactly one session and is not reusable after
/// [`FrameConn::hang_up`].
pub struct FrameConn {
	r: Box<dyn AsyncRead + Send + Unpin>,
	w: Box<dyn AsyncWrite + Send + Unpin>,
	hung_up: bool,
}

impl FrameConn {
	pub fn new(r: Box<dyn AsyncRead + Send + Unpin>, w: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
		FrameConn { r, w, hung_up: false }
	}

	fn check_open(&self) -> Result<(), RpcError> {
		if self.hung_up {
			return Err(RpcError::Closed);
		}
		Ok(())
	}

	/// Read the next frame header. The payload stays on the channel and
	/// must be consumed through [`FrameConn::read_payload`].
	///
	/// An oversized declared payload fails without consuming payload
	/// bytes.
	pub async fn read_frame(&mut self) -> Result<Frame, RpcError> {
		self.check_open()?;
		let mut header = [0u8; 6];
		self.r.read_exact(&mut header).await?;
		let frame_type = FrameType::from_u8(header[0])
			.ok_or_else(|| RpcError::Protocol(format!("unknown frame type 0x{:02x}", header[0])))?;
		let no_more_frames = match header[1] {
			0 => false,
			1 => true,
			b => {
				return Err(RpcError::Protocol(format!("invalid NoMoreFrames octet 0x{:02x}", b)));
			}
		};
		let payload_length = u32::from_le_bytes([header[2], header[3], header[4], header[5]]);
		if payload_length > MAX_PAYLOAD_LENGTH {
			return Err(RpcError::Protocol(format!(
				"frame exceeds max payload length ({} > {})",
				payload_length, MAX_PAYLOAD_LENGTH
			)));
		}
		Ok(Frame { frame_type, no_more_frames, payload_length })
	}

	/// Write a frame header. The caller writes the payload afterwards
	/// through [`FrameConn::write_payload`].
	pub async fn write_frame(&mut self, f: Frame) -> Result<(), RpcError> {
		self.check_open()?;
		if f.payload_length > MAX_PAYLOAD_LENGTH {
			return Err(RpcError::Protocol(format!(
				"frame exceeds max payload length ({} > {})",
				f.payload_length, MAX_PAYLOAD_LENGTH
			)));
		}
		let mut header = [0u8; 6];
		header[0] = f.frame_type.as_u8();
		header[1] = f.no_more_frames as u8;
		header[2..6].copy_from_slice(&f.payload_length.to_le_bytes());
		self.w.write_all(&header).await?;
		Ok(())
	}

	async fn read_payload(&mut self, buf: &mut [u8]) -> Result<usize, RpcError> {
		self.check_open()?;
		let n = self.r.read(buf).await?;
		if n == 0 && !buf.is_empty() {
			return Err(RpcError::Protocol("unexpected end of channel inside frame".to_string()));
		}
		Ok(n)
	}

	async fn write_payload(&mut self, buf: &[u8]) -> Result<(), RpcError> {
		self.check_open()?;
		self.w.write_all(buf).await?;
		self.w.flush().await?;
		Ok(())
	}

	/// Write an RST frame (best effort) and close the channel.
	/// Subsequent reads and writes fail with a terminal error.
	pub async fn hang_up(&mut self) -> Result<(), RpcError> {
		if self.hung_up {
			return Ok(());
		}
		let rst = Frame { frame_type: FrameType::Rst, no_more_frames: true, payload_length: 0 };
		let rst_result = self.write_frame(rst).await;
		let shutdown_result = self.w.shutdown().await;
		self.hung_up = true;
		rst_result?;
		shutdown_result?;
		Ok(())
	}

	/// Close the channel without signalling an error to the peer.
	pub async fn shutdown(&mut self) -> Result<(), RpcError> {
		if self.hung_up {
			return Ok(());
		}
		let result = self.w.shutdown().await;
		self.hung_up = true;
		result?;
		Ok(())
	}
}

/// Byte-stream view over a run of frames of one type.
///
/// End of stream is reached when a frame with `NoMoreFrames` set has
/// been fully consumed, or when the optional total byte limit is hit.
pub struct FrameReader<'a> {
	conn: &'a mut FrameConn,
	frame_type: FrameType,
	/// None means no limit.
	bytes_left_to_limit: Option<usize>,
	payload_remaining: u32,
	no_more_frames: bool,
}

impl<'a> std::fmt::Debug for FrameReader<'a> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FrameReader")
			.field("frame_type", &self.frame_type)
			.field("bytes_left_to_limit", &self.bytes_left_to_limit)
			.field("payload_remaining", &self.payload_remaining)
			.field("no_more_frames", &self.no_more_frames)
			.finish()
	}
}

impl<'a> FrameReader<'a> {
	pub fn new(conn: &'a mut FrameConn, frame_type: FrameType, limit: Option<usize>) -> Self {
		FrameReader {
			conn,
			frame_type,
			bytes_left_to_limit: limit,
			payload_remaining: 0,
			no_more_frames: false,
		}
	}

	/// Read up to `buf.len()` bytes of the stream. Returns `Ok(0)` on
	/// end of stream.
	pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, RpcError> {
		if buf.is_empty() || self.bytes_left_to_limit == Some(0) {
			return Ok(0);
		}
		while self.payload_remaining == 0 {
			if self.no_more_frames {
				return Ok(0);
			}
			let f = self.conn.read_frame().await?;
			if f.frame_type == FrameType::Rst {
				return Err(RpcError::Reset);
			}
			if f.frame_type != self.frame_type {
				return Err(RpcError::Protocol(format!(
					"expected frame of type {}, got {}",
					self.frame_type, f.frame_type
				)));
			}
			self.payload_remaining = f.payload_length;
			self.no_more_frames = f.no_more_frames;
		}
		let mut max_read = buf.len().min(self.payload_remaining as usize);
		if let Some(left) = self.bytes_left_to_limit {
			max_read = max_read.min(left);
		}
		let n = self.conn.read_payload(&mut buf[..max_read]).await?;
		self.payload_remaining -= n as u32;
		if let Some(left) = self.bytes_left_to_limit.as_mut() {
			*left -= n;
		}
		Ok(n)
	}

	/// Collect the remainder of the stream into `out`.
	pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<(), RpcError> {
		let mut chunk = [0u8; 8 * 1024];
		loop {
			let n = self.read(&mut chunk).await?;
			if n == 0 {
				return Ok(());
			}
			out.extend_from_slice(&chunk[..n]);
		}
	}

	/// Discard the remainder of the stream so the channel is positioned
	/// at the next message.
	pub async fn drain(&mut self) -> Result<(), RpcError> {
		let mut chunk = [0u8; 8 * 1024];
		loop {
			let n = self.read(&mut chunk).await?;
			if n == 0 {
				return Ok(());
			}
		}
	}
}

/// Byte-stream writer that packs its input into frames of one type.
///
/// Bytes are buffered up to the frame payload capacity; a full buffer
/// is flushed as a frame with `NoMoreFrames` clear, and
/// [`FrameWriter::close`] flushes the remainder with `NoMoreFrames`
/// set. Hitting the optional total limit exactly also closes the
/// message; writing past it fails.
pub struct FrameWriter<'a> {
	conn: &'a mut FrameConn,
	frame_type: FrameType,
	/// None means no limit.
	bytes_left_to_limit: Option<usize>,
	buf: Vec<u8>,
	closed: bool,
}

impl<'a> FrameWriter<'a> {
	pub fn new(conn: &'a mut FrameConn, frame_type: FrameType, limit: Option<usize>) -> Self {
		FrameWriter { conn, frame_type, bytes_left_to_limit: limit, buf: Vec::new(), closed: false }
	}

	pub async fn write(&mut self, mut data: &[u8]) -> Result<(), RpcError> {
		if self.closed {
			return Err(RpcError::Protocol("write on closed message".to_string()));
		}
		while !data.is_empty() {
			if self.bytes_left_to_limit == Some(0) {
				return Err(RpcError::Protocol(
					"exceeded total byte limit for this message".to_string(),
				));
			}
			let mut take = data.len().min(MAX_PAYLOAD_LENGTH as usize - self.buf.len());
			if let Some(left) = self.bytes_left_to_limit {
				take = take.min(left);
			}
			self.buf.extend_from_slice(&data[..take]);
			data = &data[take..];
			if let Some(left) = self.bytes_left_to_limit.as_mut() {
				*left -= take;
			}
			if self.bytes_left_to_limit == Some(0) {
				// The message cannot grow any further; close it now so
				// the reader side terminates at the same byte count.
				self.flush(true).await?;
				self.closed = true;
				if !data.is_empty() {
					return Err(RpcError::Protocol(
						"exceeded total byte limit for this message".to_string(),
					));
				}
			} else if self.buf.len() == MAX_PAYLOAD_LENGTH as usize {
				self.flush(false).await?;
			}
		}
		Ok(())
	}

	/// Flush remaining buffered bytes as the final frame of the run.
	pub async fn close(mut self) -> Result<(), RpcError> {
		if self.closed {
			return Ok(());
		}
		self.flush(true).await?;
		self.closed = true;
		Ok(())
	}

	async fn flush(&mut self, no_more_frames: bool) -> Result<(), RpcError> {
		let f = Frame {
			frame_type: self.frame_type,
			no_more_frames,
			payload_length: self.buf.len() as u32,
		};
		self.conn.write_frame(f).await?;
		self.conn.write_payload(&self.buf).await?;
		self.buf.clear();
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pipe() -> (FrameConn, FrameConn) {
		let (a, b) = tokio::io::duplex(1024 * 1024);
		let (ar, aw) = tokio::io::split(a);
		let (br, bw) = tokio::io::split(b);
		(
			FrameConn::new(Box::new(ar), Box::new(aw)),
			FrameConn::new(Box::new(br), Box::new(bw)),
		)
	}

	#[tokio::test]
	async fn test_frame_roundtrip() {
		let (mut tx, mut rx) = pipe();
		let payload = b"hello frames";
		let f = Frame {
			frame_type: FrameType::Data,
			no_more_frames: true,
			payload_length: payload.len() as u32,
		};
		tx.write_frame(f).await.unwrap();
		tx.write_payload(payload).await.unwrap();

		let got = rx.read_frame().await.unwrap();
		assert_eq!(got, f);
		let mut buf = vec![0u8; payload.len()];
		let mut read = 0;
		while read < buf.len() {
			read += rx.read_payload(&mut buf[read..]).await.unwrap();
		}
		assert_eq!(&buf, payload);
	}

	#[tokio::test]
	async fn test_write_frame_rejects_oversized_payload() {
		let (mut tx, _rx) = pipe();
		let f = Frame {
			frame_type: FrameType::Data,
			no_more_frames: false,
			payload_length: MAX_PAYLOAD_LENGTH + 1,
		};
		assert!(matches!(tx.write_frame(f).await, Err(RpcError::Protocol(_))));
	}

	#[tokio::test]
	async fn test_read_frame_rejects_oversized_declared_payload() {
		let (mut tx, mut rx) = pipe();
		// Hand-craft a header declaring more than the allowed payload.
		let mut header = [0u8; 6];
		header[0] = FrameType::Data.as_u8();
		header[1] = 0;
		header[2..6].copy_from_slice(&(MAX_PAYLOAD_LENGTH + 1).to_le_bytes());
		tx.write_payload(&header).await.unwrap();
		assert!(matches!(rx.read_frame().await, Err(RpcError::Protocol(_))));
	}

	#[tokio::test]
	async fn test_bridged_stream_roundtrip() {
		let (mut tx, mut rx) = pipe();
		let data: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
		let expected = data.clone();

		let writer = async move {
			let mut w = FrameWriter::new(&mut tx, FrameType::Data, None);
			// Uneven chunk size so writes straddle internal boundaries.
			for chunk in data.chunks(6133) {
				w.write(chunk).await.unwrap();
			}
			w.close().await.unwrap();
		};
		let reader = async move {
			let mut r = FrameReader::new(&mut rx, FrameType::Data, None);
			let mut out = Vec::new();
			r.read_to_end(&mut out).await.unwrap();
			out
		};
		let (_, out) = tokio::join!(writer, reader);
		assert_eq!(out, expected);
	}

	#[tokio::test]
	async fn test_reader_rejects_frame_type_mismatch() {
		let (mut tx, mut rx) = pipe();
		tx.write_frame(Frame {
			frame_type: FrameType::Header,
			no_more_frames: true,
			payload_length: 0,
		})
		.await
		.unwrap();
		tx.write_payload(&[]).await.unwrap();

		let mut r = FrameReader::new(&mut rx, FrameType::Data, None);
		let mut buf = [0u8; 16];
		assert!(matches!(r.read(&mut buf).await, Err(RpcError::Protocol(_))));
	}

	#[tokio::test]
	async fn test_reader_surfaces_rst() {
		let (mut tx, mut rx) = pipe();
		tx.hang_up().await.unwrap();

		let mut r = FrameReader::new(&mut rx, FrameType::Data, None);
		let mut buf = [0u8; 16];
		assert!(matches!(r.read(&mut buf).await, Err(RpcError::Reset)));
	}

	#[tokio::test]
	async fn test_writer_enforces_total_limit() {
		let (mut tx, _rx) = pipe();
		let mut w = FrameWriter::new(&mut tx, FrameType::Header, Some(16));
		assert!(w.write(&[0u8; 17]).await.is_err());
	}

	#[tokio::test]
	async fn test_writer_closes_message_at_exact_limit() {
		let (mut tx, mut rx) = pipe();
		let payload = [7u8; 16];

		let writer = async move {
			let mut w = FrameWriter::new(&mut tx, FrameType::Header, Some(16));
			w.write(&payload).await.unwrap();
			// Already flushed with NoMoreFrames at the limit.
			w.close().await.unwrap();
		};
		let reader = async move {
			let mut r = FrameReader::new(&mut rx, FrameType::Header, Some(16));
			let mut out = Vec::new();
			r.read_to_end(&mut out).await.unwrap();
			out
		};
		let (_, out) = tokio::join!(writer, reader);
		assert_eq!(out, payload.to_vec());
	}

	#[tokio::test]
	async fn test_channel_unusable_after_hang_up() {
		let (mut tx, _rx) = pipe();
		tx.hang_up().await.unwrap();
		let f = Frame { frame_type: FrameType::Data, no_more_frames: true, payload_length: 0 };
		assert!(matches!(tx.write_frame(f).await, Err(RpcError::Closed)));
	}
}

// vim: ts=4
