//! RPC dispatcher: named endpoints served over one message channel.
//!
//! The registry binds each endpoint name to one of four typed handler
//! shapes, distinguished by whether the request body and the reply body
//! are marshaled JSON or an octet stream. Requests are served strictly
//! one at a time; request-level failures (unknown endpoint, type
//! mismatch, handler error) are reported in the reply header and leave
//! the connection open, while protocol-level failures hang it up.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::io::AsyncRead;

use crate::logging::*;

use super::error::RpcError;
use super::frame::FrameReader;
use super::message::{DataType, Header, MessageLayer, Status};
use super::ENDPOINT_CLOSE;

/// An octet-stream reply body. The dispatcher streams it to the peer
/// without buffering.
pub type OctetStream = Box<dyn AsyncRead + Send + Unpin>;

/// Error returned by endpoint handlers.
///
/// `Request` covers faults of the caller (undecodable request, access
/// denial) and maps to [`Status::RequestError`]; `Server` covers
/// faults while executing a well-formed request and maps to
/// [`Status::ServerError`]. Neither closes the connection.
#[derive(Debug)]
pub enum HandlerError {
	Request(String),
	Server(String),
}

impl HandlerError {
	fn status(&self) -> Status {
		match self {
			HandlerError::Request(_) => Status::RequestError,
			HandlerError::Server(_) => Status::ServerError,
		}
	}

	fn message(&self) -> &str {
		match self {
			HandlerError::Request(msg) | HandlerError::Server(msg) => msg,
		}
	}
}

impl std::fmt::Display for HandlerError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}: {}", self.status(), self.message())
	}
}

impl std::error::Error for HandlerError {}

#[async_trait]
pub trait JsonEndpoint: Send + Sync {
	async fn handle(&self, req: serde_json::Value) -> Result<serde_json::Value, HandlerError>;
}

#[async_trait]
pub trait StreamSourceEndpoint: Send + Sync {
	async fn handle(&self, req: serde_json::Value) -> Result<OctetStream, HandlerError>;
}

#[async_trait]
pub trait StreamSinkEndpoint: Send + Sync {
	async fn handle(&self, body: &mut FrameReader<'_>)
		-> Result<serde_json::Value, HandlerError>;
}

#[async_trait]
pub trait StreamPipeEndpoint: Send + Sync {
	async fn handle(&self, body: &mut FrameReader<'_>) -> Result<OctetStream, HandlerError>;
}

/// The four supported endpoint shapes.
pub enum Endpoint {
	Json(Box<dyn JsonEndpoint>),
	StreamSource(Box<dyn StreamSourceEndpoint>),
	StreamSink(Box<dyn StreamSinkEndpoint>),
	StreamPipe(Box<dyn StreamPipeEndpoint>),
}

impl Endpoint {
	fn input_type(&self) -> DataType {
		match self {
			Endpoint::Json(_) | Endpoint::StreamSource(_) => DataType::MarshaledJson,
			Endpoint::StreamSink(_) | Endpoint::StreamPipe(_) => DataType::Octets,
		}
	}

	fn output_type(&self) -> DataType {
		match self {
			Endpoint::Json(_) | Endpoint::StreamSink(_) => DataType::MarshaledJson,
			Endpoint::StreamSource(_) | Endpoint::StreamPipe(_) => DataType::Octets,
		}
	}
}

enum ServeOutcome {
	Continue,
	Closed,
}

enum HandlerOutput {
	Json(serde_json::Value),
	Octets(OctetStream),
}

pub struct RpcServer {
	ml: MessageLayer,
	endpoints: BTreeMap<String, Endpoint>,
}

impl RpcServer {
	pub fn new(ml: MessageLayer) -> Self {
		RpcServer { ml, endpoints: BTreeMap::new() }
	}

	/// Register an endpoint under a fixed name. Names are single-use;
	/// `CloseRequest` is reserved for the built-in session close.
	pub fn register(&mut self, name: &str, endpoint: Endpoint) -> Result<(), RpcError> {
		if name == ENDPOINT_CLOSE {
			return Err(RpcError::Setup(format!("endpoint name '{}' is reserved", name)));
		}
		if self.endpoints.contains_key(name) {
			return Err(RpcError::Setup(format!("already set up an endpoint for '{}'", name)));
		}
		self.endpoints.insert(name.to_string(), endpoint);
		Ok(())
	}

	/// Serve requests until the client closes the session or a
	/// protocol-level error forces a hang-up.
	pub async fn serve(&mut self) -> Result<(), RpcError> {
		loop {
			match serve_request(&mut self.ml, &self.endpoints).await {
				Ok(ServeOutcome::Continue) => continue,
				Ok(ServeOutcome::Closed) => {
					debug!("client closed session");
					self.ml.shutdown().await?;
					return Ok(());
				}
				Err(e) => {
					debug!("hanging up after error serving request: {}", e);
					let _ = self.ml.hang_up().await;
					return Err(e);
				}
			}
		}
	}
}

/// Serve a single request: wait for the request header, route to the
/// handler, reply. The connection is left positioned at the next
/// request header.
///
/// An `Err` return means the error is bad enough to hang up on the
/// client (framing violations, channel failures). Handler errors are
/// not in that category.
async fn serve_request(
	ml: &mut MessageLayer,
	endpoints: &BTreeMap<String, Endpoint>,
) -> Result<ServeOutcome, RpcError> {
	let h = ml.read_header().await?;
	debug!("serving request for endpoint '{}'", h.endpoint);

	if h.endpoint == ENDPOINT_CLOSE {
		let reply = Header { error: Status::Ok, ..Header::default() };
		ml.write_header(&reply).await?;
		return Ok(ServeOutcome::Closed);
	}

	let Some(ep) = endpoints.get(&h.endpoint) else {
		let msg = format!("unregistered endpoint {}", h.endpoint);
		return reply_request_error(ml, &h, msg).await;
	};

	if ep.input_type() != h.data_type {
		let msg = format!(
			"wrong DataType for endpoint {} (has {}, you provided {})",
			h.endpoint,
			ep.input_type(),
			h.data_type
		);
		return reply_request_error(ml, &h, msg).await;
	}

	if ep.output_type() != h.accept {
		let msg = format!(
			"wrong Accept for endpoint {} (has {}, you provided {})",
			h.endpoint,
			ep.output_type(),
			h.accept
		);
		return reply_request_error(ml, &h, msg).await;
	}

	// Decode the request body and run the handler. The body is fully
	// consumed before the reply goes out so the channel stays aligned
	// on message boundaries.
	let result = match ep {
		Endpoint::Json(handler) => match read_json_request(ml).await? {
			Ok(req) => handler.handle(req).await.map(HandlerOutput::Json),
			Err(e) => Err(e),
		},
		Endpoint::StreamSource(handler) => match read_json_request(ml).await? {
			Ok(req) => handler.handle(req).await.map(HandlerOutput::Octets),
			Err(e) => Err(e),
		},
		Endpoint::StreamSink(handler) => {
			let mut body = ml.data_reader();
			let result = handler.handle(&mut body).await;
			body.drain().await?;
			result.map(HandlerOutput::Json)
		}
		Endpoint::StreamPipe(handler) => {
			let mut body = ml.data_reader();
			let result = handler.handle(&mut body).await;
			body.drain().await?;
			result.map(HandlerOutput::Octets)
		}
	};

	let output = match result {
		Ok(output) => output,
		Err(e) => {
			debug!("handler for endpoint '{}' returned error: {}", h.endpoint, e);
			let reply = Header::error(e.status(), e.message());
			ml.write_header(&reply).await?;
			return Ok(ServeOutcome::Continue);
		}
	};

	match output {
		HandlerOutput::Json(value) => {
			let buf = match serde_json::to_vec(&value) {
				Ok(buf) => buf,
				Err(e) => {
					let reply = Header::error(
						Status::ServerError,
						format!("cannot marshal response: {}", e),
					);
					ml.write_header(&reply).await?;
					return Ok(ServeOutcome::Continue);
				}
			};
			let reply =
				Header { error: Status::Ok, data_type: DataType::MarshaledJson, ..Header::default() };
			ml.write_header(&reply).await?;
			ml.write_data_buf(&buf).await?;
		}
		HandlerOutput::Octets(mut stream) => {
			let reply =
				Header { error: Status::Ok, data_type: DataType::Octets, ..Header::default() };
			ml.write_header(&reply).await?;
			// A failure while streaming cannot be signalled in-band
			// anymore; it propagates up and hangs up the channel.
			ml.write_data(stream.as_mut()).await?;
		}
	}

	Ok(ServeOutcome::Continue)
}

/// Read and decode a marshaled JSON request body. The outer error hangs
/// up the connection; the inner one becomes a RequestError reply.
async fn read_json_request(
	ml: &mut MessageLayer,
) -> Result<Result<serde_json::Value, HandlerError>, RpcError> {
	let mut buf = Vec::new();
	ml.data_reader().read_to_end(&mut buf).await?;
	match serde_json::from_slice(&buf) {
		Ok(value) => Ok(Ok(value)),
		Err(e) => Ok(Err(HandlerError::Request(format!("cannot decode marshaled JSON: {}", e)))),
	}
}

/// Reply with a request error, draining the request body first so the
/// connection remains usable for the next request.
async fn reply_request_error(
	ml: &mut MessageLayer,
	request: &Header,
	message: String,
) -> Result<ServeOutcome, RpcError> {
	if request.data_type != DataType::None {
		ml.data_reader().drain().await?;
	}
	let reply = Header::error(Status::RequestError, message);
	ml.write_header(&reply).await?;
	Ok(ServeOutcome::Continue)
}

// vim: ts=4
