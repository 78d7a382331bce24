//! Dispatcher contract tests over an in-memory duplex channel, plus
//! ACL behavior of the real source handler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use zrepd::filters::{PrefixDatasetFilter, PrefixSnapshotFilter};
use zrepd::handler::{
	register_endpoints, FilesystemVersionsRequest, Handler, InitialTransferRequest,
	ENDPOINT_FILESYSTEM_VERSIONS, ENDPOINT_INITIAL_TRANSFER,
};
use zrepd::rpc::server::{
	Endpoint, HandlerError, JsonEndpoint, OctetStream, StreamPipeEndpoint, StreamSinkEndpoint,
	StreamSourceEndpoint,
};
use zrepd::rpc::{FrameReader, MessageLayer, RpcClient, RpcError, RpcServer, Status};
use zrepd::zfs::{
	DatasetFilter, DatasetPath, FilesystemState, FilesystemVersion, RecvOptions, RecvSink,
	SendStream, VersionFilter, VersionKind, ZfsError, ZfsOps,
};

fn session() -> (RpcServer, RpcClient) {
	let (a, b) = tokio::io::duplex(256 * 1024);
	let (ar, aw) = tokio::io::split(a);
	let (br, bw) = tokio::io::split(b);
	let server = RpcServer::new(MessageLayer::new(Box::new(ar), Box::new(aw)));
	let client = RpcClient::new(MessageLayer::new(Box::new(br), Box::new(bw)));
	(server, client)
}

fn spawn_server(mut server: RpcServer) -> JoinHandle<Result<(), RpcError>> {
	tokio::spawn(async move { server.serve().await })
}

// ============================================================================
// Plain dispatcher contract
// ============================================================================

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct EchoRequest {
	text: String,
}

struct EchoEndpoint;

#[async_trait]
impl JsonEndpoint for EchoEndpoint {
	async fn handle(&self, req: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
		Ok(req)
	}
}

struct FailingEndpoint;

#[async_trait]
impl JsonEndpoint for FailingEndpoint {
	async fn handle(&self, _req: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
		Err(HandlerError::Server("handler exploded".to_string()))
	}
}

struct BytesEndpoint(Vec<u8>);

#[async_trait]
impl StreamSourceEndpoint for BytesEndpoint {
	async fn handle(&self, _req: serde_json::Value) -> Result<OctetStream, HandlerError> {
		Ok(Box::new(std::io::Cursor::new(self.0.clone())))
	}
}

#[tokio::test]
async fn test_registered_json_endpoint_roundtrip() {
	let (mut server, mut client) = session();
	server.register("Echo", Endpoint::Json(Box::new(EchoEndpoint))).unwrap();
	let server = spawn_server(server);

	let req = EchoRequest { text: "ping".to_string() };
	let res: EchoRequest = client.call_json("Echo", &req).await.unwrap();
	assert_eq!(res, req);

	client.close().await.unwrap();
	server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unregistered_endpoint_leaves_connection_usable() {
	let (mut server, mut client) = session();
	server.register("Echo", Endpoint::Json(Box::new(EchoEndpoint))).unwrap();
	let server = spawn_server(server);

	let req = EchoRequest { text: "x".to_string() };
	let err = client.call_json::<_, EchoRequest>("Nope", &req).await.unwrap_err();
	match err {
		RpcError::Response { status, message } => {
			assert_eq!(status, Status::RequestError);
			assert!(message.contains("unregistered endpoint Nope"), "message: {}", message);
		}
		other => panic!("expected response error, got {}", other),
	}

	// A subsequent request on a registered endpoint succeeds.
	let res: EchoRequest = client.call_json("Echo", &req).await.unwrap();
	assert_eq!(res, req);

	client.close().await.unwrap();
	server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handler_error_is_server_error_and_connection_survives() {
	let (mut server, mut client) = session();
	server.register("Echo", Endpoint::Json(Box::new(EchoEndpoint))).unwrap();
	server.register("Fail", Endpoint::Json(Box::new(FailingEndpoint))).unwrap();
	let server = spawn_server(server);

	let req = EchoRequest { text: "y".to_string() };
	let err = client.call_json::<_, EchoRequest>("Fail", &req).await.unwrap_err();
	match err {
		RpcError::Response { status, message } => {
			assert_eq!(status, Status::ServerError);
			assert!(message.contains("handler exploded"));
		}
		other => panic!("expected response error, got {}", other),
	}

	let res: EchoRequest = client.call_json("Echo", &req).await.unwrap();
	assert_eq!(res, req);

	client.close().await.unwrap();
	server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stream_endpoint_delivers_octets() {
	let payload: Vec<u8> = (0..50_000u32).map(|i| i as u8).collect();
	let (mut server, mut client) = session();
	server
		.register("Bytes", Endpoint::StreamSource(Box::new(BytesEndpoint(payload.clone()))))
		.unwrap();
	let server = spawn_server(server);

	let mut stream = client.call_stream("Bytes", &serde_json::json!({})).await.unwrap();
	let mut out = Vec::new();
	stream.read_to_end(&mut out).await.unwrap();
	assert_eq!(out, payload);
	drop(stream);

	client.close().await.unwrap();
	server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_accept_mismatch_is_request_error() {
	let (mut server, mut client) = session();
	server.register("Echo", Endpoint::Json(Box::new(EchoEndpoint))).unwrap();
	let server = spawn_server(server);

	// Asking a JSON endpoint for an octet stream must be rejected.
	let err = client
		.call_stream("Echo", &EchoRequest { text: "z".to_string() })
		.await
		.unwrap_err();
	match err {
		RpcError::Response { status, message } => {
			assert_eq!(status, Status::RequestError);
			assert!(message.contains("wrong Accept"), "message: {}", message);
		}
		other => panic!("expected response error, got {}", other),
	}

	client.close().await.unwrap();
	server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_duplicate_registration_fails() {
	let (mut server, _client) = session();
	server.register("Echo", Endpoint::Json(Box::new(EchoEndpoint))).unwrap();
	let err = server.register("Echo", Endpoint::Json(Box::new(EchoEndpoint))).unwrap_err();
	assert!(matches!(err, RpcError::Setup(_)));
}

#[tokio::test]
async fn test_close_request_ends_serve_loop() {
	let (server, client) = session();
	let server = spawn_server(server);
	client.close().await.unwrap();
	server.await.unwrap().unwrap();
}

// ===== Inbound-stream endpoint shapes =====

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct DigestReply {
	length: u64,
	sum: u32,
}

/// Octet stream in, JSON out: consumes the whole body.
struct DigestEndpoint;

#[async_trait]
impl StreamSinkEndpoint for DigestEndpoint {
	async fn handle(
		&self,
		body: &mut FrameReader<'_>,
	) -> Result<serde_json::Value, HandlerError> {
		let mut length = 0u64;
		let mut sum = 0u32;
		let mut chunk = [0u8; 4096];
		loop {
			let n = body
				.read(&mut chunk)
				.await
				.map_err(|e| HandlerError::Server(e.to_string()))?;
			if n == 0 {
				break;
			}
			length += n as u64;
			for b in &chunk[..n] {
				sum = sum.wrapping_add(*b as u32);
			}
		}
		serde_json::to_value(DigestReply { length, sum })
			.map_err(|e| HandlerError::Server(e.to_string()))
	}
}

/// Octet stream in, JSON out: reads only the first byte, leaving the
/// rest of the body for the dispatcher to drain.
struct HeadByteEndpoint;

#[async_trait]
impl StreamSinkEndpoint for HeadByteEndpoint {
	async fn handle(
		&self,
		body: &mut FrameReader<'_>,
	) -> Result<serde_json::Value, HandlerError> {
		let mut first = [0u8; 1];
		let n = body
			.read(&mut first)
			.await
			.map_err(|e| HandlerError::Server(e.to_string()))?;
		let first = if n == 0 { -1 } else { first[0] as i64 };
		Ok(serde_json::json!({ "first": first }))
	}
}

/// Octet stream in, octet stream out.
struct UppercaseEndpoint;

#[async_trait]
impl StreamPipeEndpoint for UppercaseEndpoint {
	async fn handle(&self, body: &mut FrameReader<'_>) -> Result<OctetStream, HandlerError> {
		let mut data = Vec::new();
		body.read_to_end(&mut data)
			.await
			.map_err(|e| HandlerError::Server(e.to_string()))?;
		data.make_ascii_uppercase();
		Ok(Box::new(std::io::Cursor::new(data)))
	}
}

#[tokio::test]
async fn test_stream_sink_endpoint_consumes_body_and_replies_json() {
	let (mut server, mut client) = session();
	server.register("Digest", Endpoint::StreamSink(Box::new(DigestEndpoint))).unwrap();
	server.register("Echo", Endpoint::Json(Box::new(EchoEndpoint))).unwrap();
	let server = spawn_server(server);

	let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 7) as u8).collect();
	let expected_sum: u32 = payload.iter().map(|b| *b as u32).sum();
	let mut body: &[u8] = &payload;
	let reply: DigestReply = client.call_json_with_octets("Digest", &mut body).await.unwrap();
	assert_eq!(reply, DigestReply { length: payload.len() as u64, sum: expected_sum });

	// The reply only goes out once the body is consumed, so the
	// channel must be aligned for the next request.
	let req = EchoRequest { text: "after digest".to_string() };
	let res: EchoRequest = client.call_json("Echo", &req).await.unwrap();
	assert_eq!(res, req);

	client.close().await.unwrap();
	server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stream_sink_partial_consumption_is_drained() {
	let (mut server, mut client) = session();
	server.register("HeadByte", Endpoint::StreamSink(Box::new(HeadByteEndpoint))).unwrap();
	server.register("Echo", Endpoint::Json(Box::new(EchoEndpoint))).unwrap();
	let server = spawn_server(server);

	// Large enough to span several frames of the request body.
	let mut payload = vec![42u8; 5 * 1024 * 1024];
	payload[0] = 7;
	let mut body: &[u8] = &payload;
	let reply: serde_json::Value =
		client.call_json_with_octets("HeadByte", &mut body).await.unwrap();
	assert_eq!(reply, serde_json::json!({ "first": 7 }));

	// The handler read one byte; the dispatcher drained the rest.
	let req = EchoRequest { text: "after head byte".to_string() };
	let res: EchoRequest = client.call_json("Echo", &req).await.unwrap();
	assert_eq!(res, req);

	client.close().await.unwrap();
	server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stream_pipe_endpoint_transforms_body() {
	let (mut server, mut client) = session();
	server.register("Upper", Endpoint::StreamPipe(Box::new(UppercaseEndpoint))).unwrap();
	server.register("Echo", Endpoint::Json(Box::new(EchoEndpoint))).unwrap();
	let server = spawn_server(server);

	let mut body: &[u8] = b"snapshot stream";
	let mut stream = client.call_stream_with_octets("Upper", &mut body).await.unwrap();
	let mut out = Vec::new();
	stream.read_to_end(&mut out).await.unwrap();
	assert_eq!(out, b"SNAPSHOT STREAM");
	drop(stream);

	let req = EchoRequest { text: "after pipe".to_string() };
	let res: EchoRequest = client.call_json("Echo", &req).await.unwrap();
	assert_eq!(res, req);

	client.close().await.unwrap();
	server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_endpoint_with_octet_body_is_drained() {
	let (mut server, mut client) = session();
	server.register("Echo", Endpoint::Json(Box::new(EchoEndpoint))).unwrap();
	let server = spawn_server(server);

	let payload = vec![9u8; 5000];
	let mut body: &[u8] = &payload;
	let err =
		client.call_json_with_octets::<DigestReply>("Nope", &mut body).await.unwrap_err();
	match err {
		RpcError::Response { status, .. } => assert_eq!(status, Status::RequestError),
		other => panic!("expected response error, got {}", other),
	}

	let req = EchoRequest { text: "after drained body".to_string() };
	let res: EchoRequest = client.call_json("Echo", &req).await.unwrap();
	assert_eq!(res, req);

	client.close().await.unwrap();
	server.await.unwrap().unwrap();
}

// ============================================================================
// Source handler ACL
// ============================================================================

#[derive(Default)]
struct RecordingZfs {
	versions: BTreeMap<String, Vec<FilesystemVersion>>,
	calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ZfsOps for RecordingZfs {
	async fn list_filesystems(
		&self,
		_filter: &dyn DatasetFilter,
	) -> Result<Vec<DatasetPath>, ZfsError> {
		self.calls.lock().unwrap().push("list_filesystems".to_string());
		Ok(Vec::new())
	}

	async fn list_filesystem_state(
		&self,
	) -> Result<BTreeMap<String, FilesystemState>, ZfsError> {
		Ok(BTreeMap::new())
	}

	async fn list_filesystem_versions(
		&self,
		fs: &DatasetPath,
		filter: Option<&dyn VersionFilter>,
	) -> Result<Vec<FilesystemVersion>, ZfsError> {
		self.calls.lock().unwrap().push(format!("list_versions {}", fs));
		let mut versions = self.versions.get(&fs.to_string()).cloned().unwrap_or_default();
		if let Some(filter) = filter {
			let mut admitted = Vec::new();
			for v in versions {
				if filter.filter(&v)? {
					admitted.push(v);
				}
			}
			versions = admitted;
		}
		Ok(versions)
	}

	async fn send(
		&self,
		fs: &DatasetPath,
		from: Option<&FilesystemVersion>,
		to: &FilesystemVersion,
	) -> Result<SendStream, ZfsError> {
		self.calls.lock().unwrap().push(format!(
			"send {} {:?} {}",
			fs,
			from.map(|v| v.name.clone()),
			to.name
		));
		Ok(Box::new(std::io::Cursor::new(vec![0u8; 8])))
	}

	async fn recv(
		&self,
		_fs: &DatasetPath,
		_opts: RecvOptions,
	) -> Result<Box<dyn RecvSink>, ZfsError> {
		Err(ZfsError::Io(std::io::Error::other("recv not supported")))
	}

	async fn set(&self, _fs: &DatasetPath, _p: &str, _v: &str) -> Result<(), ZfsError> {
		Ok(())
	}

	async fn create_placeholder(&self, _fs: &DatasetPath) -> Result<(), ZfsError> {
		Ok(())
	}
}

fn snap(name: &str, guid: u64) -> FilesystemVersion {
	FilesystemVersion {
		kind: VersionKind::Snapshot,
		name: name.to_string(),
		guid,
		create_txg: guid,
		creation: guid,
	}
}

/// Source session admitting only `tank/var` and snapshots prefixed
/// `backup_`.
fn source_session(zfs: Arc<RecordingZfs>) -> (JoinHandle<Result<(), RpcError>>, RpcClient) {
	let (mut server, client) = session();
	let handler = Handler::new(
		zfs,
		Arc::new(PrefixDatasetFilter::new(vec![DatasetPath::new("tank/var").unwrap()])),
		Arc::new(PrefixSnapshotFilter::new("backup_")),
	);
	register_endpoints(&mut server, Arc::new(handler)).unwrap();
	(spawn_server(server), client)
}

#[tokio::test]
async fn test_versions_request_denied_without_touching_zfs() {
	let zfs = Arc::new(RecordingZfs::default());
	let (server, mut client) = source_session(zfs.clone());

	let req =
		FilesystemVersionsRequest { filesystem: DatasetPath::new("tank/secret").unwrap() };
	let err = client
		.call_json::<_, Vec<FilesystemVersion>>(ENDPOINT_FILESYSTEM_VERSIONS, &req)
		.await
		.unwrap_err();
	match err {
		RpcError::Response { status, message } => {
			assert_eq!(status, Status::RequestError);
			assert!(message.contains("ACL prohibits access to tank/secret"));
		}
		other => panic!("expected response error, got {}", other),
	}
	assert!(zfs.calls.lock().unwrap().is_empty(), "no zfs command may run on denial");

	client.close().await.unwrap();
	server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_versions_request_applies_snapshot_filter() {
	let mut zfs = RecordingZfs::default();
	zfs.versions.insert(
		"tank/var/db".to_string(),
		vec![snap("backup_1", 1), snap("manual_1", 2)],
	);
	let zfs = Arc::new(zfs);
	let (server, mut client) = source_session(zfs.clone());

	let req = FilesystemVersionsRequest { filesystem: DatasetPath::new("tank/var/db").unwrap() };
	let versions: Vec<FilesystemVersion> =
		client.call_json(ENDPOINT_FILESYSTEM_VERSIONS, &req).await.unwrap();
	assert_eq!(versions.len(), 1);
	assert_eq!(versions[0].name, "backup_1");

	client.close().await.unwrap();
	server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_initial_transfer_denied_version_never_opens_stream() {
	let zfs = Arc::new(RecordingZfs::default());
	let (server, mut client) = source_session(zfs.clone());

	// The dataset is admitted but the snapshot name is not.
	let req = InitialTransferRequest {
		filesystem: DatasetPath::new("tank/var/db").unwrap(),
		filesystem_version: snap("manual_1", 7),
	};
	let err = client.call_stream(ENDPOINT_INITIAL_TRANSFER, &req).await.unwrap_err();
	match err {
		RpcError::Response { status, message } => {
			assert_eq!(status, Status::RequestError);
			assert!(message.contains("ACL prohibits access to tank/var/db@manual_1"));
		}
		other => panic!("expected response error, got {}", other),
	}
	assert!(zfs.calls.lock().unwrap().is_empty(), "no send may be started on denial");

	client.close().await.unwrap();
	server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_initial_transfer_streams_allowed_snapshot() {
	let zfs = Arc::new(RecordingZfs::default());
	let (server, mut client) = source_session(zfs.clone());

	let req = InitialTransferRequest {
		filesystem: DatasetPath::new("tank/var/db").unwrap(),
		filesystem_version: snap("backup_1", 7),
	};
	let mut stream = client.call_stream(ENDPOINT_INITIAL_TRANSFER, &req).await.unwrap();
	let mut out = Vec::new();
	stream.read_to_end(&mut out).await.unwrap();
	assert_eq!(out.len(), 8);
	drop(stream);

	assert_eq!(
		zfs.calls.lock().unwrap().clone(),
		vec!["send tank/var/db None backup_1".to_string()]
	);

	client.close().await.unwrap();
	server.await.unwrap().unwrap();
}

// vim: ts=4
