//! RPC client: the calling side of the message channel.
//!
//! Calls are strictly sequential. A streamed reply borrows the client
//! until it is dropped, so the borrow checker enforces that the stream
//! is finished with before the next call goes out; the caller is still
//! responsible for consuming it fully so the channel stays aligned on
//! message boundaries.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncRead;

use crate::config::CLOSE_RPC_TIMEOUT;
use crate::logging::*;

use super::error::RpcError;
use super::frame::FrameReader;
use super::message::{DataType, Header, MessageLayer, Status};
use super::ENDPOINT_CLOSE;

pub struct RpcClient {
	ml: MessageLayer,
}

impl RpcClient {
	pub fn new(ml: MessageLayer) -> Self {
		RpcClient { ml }
	}

	/// Call an endpoint with a JSON request and a JSON reply.
	pub async fn call_json<Req, Res>(&mut self, endpoint: &str, req: &Req) -> Result<Res, RpcError>
	where
		Req: Serialize,
		Res: DeserializeOwned,
	{
		self.send_json_request(endpoint, req, DataType::MarshaledJson).await?;
		self.read_json_reply().await
	}

	/// Call an endpoint with a JSON request and an octet-stream reply.
	///
	/// The returned reader must be consumed to end of stream (or the
	/// connection abandoned) before the next call.
	pub async fn call_stream<Req>(
		&mut self,
		endpoint: &str,
		req: &Req,
	) -> Result<FrameReader<'_>, RpcError>
	where
		Req: Serialize,
	{
		self.send_json_request(endpoint, req, DataType::Octets).await?;
		self.read_stream_reply().await
	}

	/// Call an endpoint with an octet-stream request and a JSON reply.
	/// `body` is streamed to the server in full before the reply is
	/// read.
	pub async fn call_json_with_octets<Res>(
		&mut self,
		endpoint: &str,
		body: &mut (dyn AsyncRead + Send + Unpin),
	) -> Result<Res, RpcError>
	where
		Res: DeserializeOwned,
	{
		self.send_octets_request(endpoint, body, DataType::MarshaledJson).await?;
		self.read_json_reply().await
	}

	/// Call an endpoint with an octet-stream request and an
	/// octet-stream reply.
	pub async fn call_stream_with_octets(
		&mut self,
		endpoint: &str,
		body: &mut (dyn AsyncRead + Send + Unpin),
	) -> Result<FrameReader<'_>, RpcError> {
		self.send_octets_request(endpoint, body, DataType::Octets).await?;
		self.read_stream_reply().await
	}

	/// Gracefully end the session: send a close request and wait for
	/// the acknowledgement, bounded by [`CLOSE_RPC_TIMEOUT`]. Expiry or
	/// failure escalates to a forced close of the channel.
	pub async fn close(mut self) -> Result<(), RpcError> {
		match tokio::time::timeout(CLOSE_RPC_TIMEOUT, self.close_request()).await {
			Ok(Ok(())) => self.ml.shutdown().await,
			Ok(Err(e)) => {
				debug!("graceful close failed, force-closing: {}", e);
				let _ = self.ml.hang_up().await;
				Err(e)
			}
			Err(_) => {
				debug!("graceful close timed out, force-closing");
				let _ = self.ml.hang_up().await;
				Err(RpcError::CloseTimeout)
			}
		}
	}

	async fn close_request(&mut self) -> Result<(), RpcError> {
		let h = Header { endpoint: ENDPOINT_CLOSE.to_string(), ..Header::default() };
		self.ml.write_header(&h).await?;
		let reply = self.ml.read_header().await?;
		match reply.error {
			Status::Ok => Ok(()),
			status => Err(RpcError::Response { status, message: reply.error_message }),
		}
	}

	async fn send_json_request<Req>(
		&mut self,
		endpoint: &str,
		req: &Req,
		accept: DataType,
	) -> Result<(), RpcError>
	where
		Req: Serialize,
	{
		let h = Header {
			endpoint: endpoint.to_string(),
			data_type: DataType::MarshaledJson,
			accept,
			..Header::default()
		};
		let body = serde_json::to_vec(req)?;
		self.ml.write_header(&h).await?;
		self.ml.write_data_buf(&body).await?;
		Ok(())
	}

	async fn send_octets_request(
		&mut self,
		endpoint: &str,
		body: &mut (dyn AsyncRead + Send + Unpin),
		accept: DataType,
	) -> Result<(), RpcError> {
		let h = Header {
			endpoint: endpoint.to_string(),
			data_type: DataType::Octets,
			accept,
			..Header::default()
		};
		self.ml.write_header(&h).await?;
		self.ml.write_data(body).await?;
		Ok(())
	}

	async fn read_json_reply<Res>(&mut self) -> Result<Res, RpcError>
	where
		Res: DeserializeOwned,
	{
		let reply = self.read_reply_header().await?;
		if reply.data_type != DataType::MarshaledJson {
			return Err(RpcError::Protocol(format!(
				"expected marshaled JSON reply body, got {}",
				reply.data_type
			)));
		}
		let mut buf = Vec::new();
		self.ml.data_reader().read_to_end(&mut buf).await?;
		Ok(serde_json::from_slice(&buf)?)
	}

	async fn read_stream_reply(&mut self) -> Result<FrameReader<'_>, RpcError> {
		let reply = self.read_reply_header().await?;
		if reply.data_type != DataType::Octets {
			return Err(RpcError::Protocol(format!(
				"expected octet-stream reply body, got {}",
				reply.data_type
			)));
		}
		Ok(self.ml.data_reader())
	}

	async fn read_reply_header(&mut self) -> Result<Header, RpcError> {
		let reply = self.ml.read_header().await?;
		match reply.error {
			Status::Ok => Ok(reply),
			Status::NotSet => {
				Err(RpcError::Protocol("reply header carries no status".to_string()))
			}
			status => Err(RpcError::Response { status, message: reply.error_message }),
		}
	}
}

// vim: ts=4
