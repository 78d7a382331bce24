//! Server-side endpoint implementations for a replication source.
//!
//! A [`Handler`] is built per connection from the source job's ZFS
//! adapter, dataset filter (the pull ACL) and version filter, and its
//! endpoints are registered into a fresh dispatcher. Every request is
//! ACL-checked before any ZFS command runs; a denial is reported as a
//! request error and never opens a stream.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::logging::*;
use crate::rpc::server::{
	Endpoint, HandlerError, JsonEndpoint, OctetStream, RpcServer, StreamSourceEndpoint,
};
use crate::zfs::{DatasetFilter, DatasetPath, FilesystemVersion, VersionFilter, ZfsOps};

use async_trait::async_trait;

pub const ENDPOINT_FILESYSTEMS: &str = "FilesystemRequest";
pub const ENDPOINT_FILESYSTEM_VERSIONS: &str = "FilesystemVersionsRequest";
pub const ENDPOINT_INITIAL_TRANSFER: &str = "InitialTransferRequest";
pub const ENDPOINT_INCREMENTAL_TRANSFER: &str = "IncrementalTransferRequest";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FilesystemRequest {
	/// Reserved for narrowing the listing to subtrees; an empty list
	/// asks for everything the ACL admits.
	pub roots: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FilesystemVersionsRequest {
	pub filesystem: DatasetPath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitialTransferRequest {
	pub filesystem: DatasetPath,
	pub filesystem_version: FilesystemVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IncrementalTransferRequest {
	pub filesystem: DatasetPath,
	pub from: FilesystemVersion,
	pub to: FilesystemVersion,
}

pub struct Handler {
	zfs: Arc<dyn ZfsOps>,
	dataset_filter: Arc<dyn DatasetFilter>,
	version_filter: Arc<dyn VersionFilter>,
}

impl Handler {
	pub fn new(
		zfs: Arc<dyn ZfsOps>,
		dataset_filter: Arc<dyn DatasetFilter>,
		version_filter: Arc<dyn VersionFilter>,
	) -> Self {
		Handler { zfs, dataset_filter, version_filter }
	}

	/// Check whether the puller may access the given filesystem, and
	/// optionally one of its versions.
	fn pull_acl_check(
		&self,
		path: &DatasetPath,
		version: Option<&FilesystemVersion>,
	) -> Result<(), HandlerError> {
		let fs_allowed = self
			.dataset_filter
			.filter(path)
			.map_err(|e| HandlerError::Server(format!("error evaluating ACL: {}", e)))?;
		if !fs_allowed {
			info!("ACL prohibits access to {}", path);
			return Err(HandlerError::Request(format!("ACL prohibits access to {}", path)));
		}
		let Some(version) = version else {
			return Ok(());
		};
		let v_allowed = self
			.version_filter
			.filter(version)
			.map_err(|e| HandlerError::Server(format!("error evaluating version filter: {}", e)))?;
		if !v_allowed {
			info!("ACL prohibits access to {}", version.to_abs_path(path));
			return Err(HandlerError::Request(format!(
				"ACL prohibits access to {}",
				version.to_abs_path(path)
			)));
		}
		Ok(())
	}
}

fn decode<T: DeserializeOwned>(req: serde_json::Value) -> Result<T, HandlerError> {
	serde_json::from_value(req)
		.map_err(|e| HandlerError::Request(format!("cannot decode request: {}", e)))
}

fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value, HandlerError> {
	serde_json::to_value(value)
		.map_err(|e| HandlerError::Server(format!("cannot encode response: {}", e)))
}

struct FilesystemsEndpoint(Arc<Handler>);

#[async_trait]
impl JsonEndpoint for FilesystemsEndpoint {
	async fn handle(&self, req: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
		let _r: FilesystemRequest = decode(req)?;
		debug!("handling filesystem request");
		let allowed = self
			.0
			.zfs
			.list_filesystems(self.0.dataset_filter.as_ref())
			.await
			.map_err(|e| HandlerError::Server(e.to_string()))?;
		encode(&allowed)
	}
}

struct FilesystemVersionsEndpoint(Arc<Handler>);

#[async_trait]
impl JsonEndpoint for FilesystemVersionsEndpoint {
	async fn handle(&self, req: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
		let r: FilesystemVersionsRequest = decode(req)?;
		debug!("handling filesystem versions request for {}", r.filesystem);
		self.0.pull_acl_check(&r.filesystem, None)?;
		let versions = self
			.0
			.zfs
			.list_filesystem_versions(&r.filesystem, Some(self.0.version_filter.as_ref()))
			.await
			.map_err(|e| HandlerError::Server(e.to_string()))?;
		encode(&versions)
	}
}

struct InitialTransferEndpoint(Arc<Handler>);

#[async_trait]
impl StreamSourceEndpoint for InitialTransferEndpoint {
	async fn handle(&self, req: serde_json::Value) -> Result<OctetStream, HandlerError> {
		let r: InitialTransferRequest = decode(req)?;
		debug!(
			"handling initial transfer request for {}",
			r.filesystem_version.to_abs_path(&r.filesystem)
		);
		self.0.pull_acl_check(&r.filesystem, Some(&r.filesystem_version))?;
		let stream = self
			.0
			.zfs
			.send(&r.filesystem, None, &r.filesystem_version)
			.await
			.map_err(|e| HandlerError::Server(e.to_string()))?;
		Ok(stream)
	}
}

struct IncrementalTransferEndpoint(Arc<Handler>);

#[async_trait]
impl StreamSourceEndpoint for IncrementalTransferEndpoint {
	async fn handle(&self, req: serde_json::Value) -> Result<OctetStream, HandlerError> {
		let r: IncrementalTransferRequest = decode(req)?;
		debug!(
			"handling incremental transfer request for {} ({} -> {})",
			r.filesystem, r.from, r.to
		);
		self.0.pull_acl_check(&r.filesystem, Some(&r.from))?;
		self.0.pull_acl_check(&r.filesystem, Some(&r.to))?;
		let stream = self
			.0
			.zfs
			.send(&r.filesystem, Some(&r.from), &r.to)
			.await
			.map_err(|e| HandlerError::Server(e.to_string()))?;
		Ok(stream)
	}
}

/// Register all source endpoints into a fresh dispatcher.
pub fn register_endpoints(
	server: &mut RpcServer,
	handler: Arc<Handler>,
) -> Result<(), crate::rpc::RpcError> {
	server.register(
		ENDPOINT_FILESYSTEMS,
		Endpoint::Json(Box::new(FilesystemsEndpoint(handler.clone()))),
	)?;
	server.register(
		ENDPOINT_FILESYSTEM_VERSIONS,
		Endpoint::Json(Box::new(FilesystemVersionsEndpoint(handler.clone()))),
	)?;
	server.register(
		ENDPOINT_INITIAL_TRANSFER,
		Endpoint::StreamSource(Box::new(InitialTransferEndpoint(handler.clone()))),
	)?;
	server.register(
		ENDPOINT_INCREMENTAL_TRANSFER,
		Endpoint::StreamSource(Box::new(IncrementalTransferEndpoint(handler))),
	)?;
	Ok(())
}

// vim: ts=4
