//! Pull orchestrator: one replication cycle against a remote source.
//!
//! A cycle lists the remote's filesystems, maps them to local dataset
//! paths, walks the resulting forest parent-before-child, and brings
//! every mapped filesystem up to date: an initial transfer where the
//! local side has nothing, incremental transfers where a common
//! snapshot history exists, and a logged skip where the histories
//! cannot be reconciled automatically.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{PROGRESS_REPORT_INTERVAL, RECV_COPY_BUFFER_SIZE};
use crate::error::PullError;
use crate::handler::{
	FilesystemRequest, FilesystemVersionsRequest, IncrementalTransferRequest,
	InitialTransferRequest, ENDPOINT_FILESYSTEMS, ENDPOINT_FILESYSTEM_VERSIONS,
	ENDPOINT_INCREMENTAL_TRANSFER, ENDPOINT_INITIAL_TRANSFER,
};
use crate::filters::DatasetMapping;
use crate::logging::*;
use crate::rpc::{ByteStream, RpcClient, RpcError};
use crate::zfs::{
	make_filesystem_diff, Conflict, DatasetPath, DatasetPathForest, FilesystemDiff,
	FilesystemState, FilesystemVersion, RecvOptions, VersionKind, ZfsOps,
};

/// How the first transfer of a filesystem picks its snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialReplPolicy {
	/// Transfer only the most recent remote snapshot.
	#[default]
	MostRecent,
}

/// The calls the orchestrator makes against the remote side. The RPC
/// client implements this; tests substitute a scripted remote.
#[async_trait]
pub trait PullRemote: Send {
	async fn filesystems(&mut self) -> Result<Vec<DatasetPath>, RpcError>;

	async fn filesystem_versions(
		&mut self,
		fs: &DatasetPath,
	) -> Result<Vec<FilesystemVersion>, RpcError>;

	async fn initial_transfer<'a>(
		&'a mut self,
		fs: &DatasetPath,
		version: &FilesystemVersion,
	) -> Result<Box<dyn ByteStream + 'a>, RpcError>;

	async fn incremental_transfer<'a>(
		&'a mut self,
		fs: &DatasetPath,
		from: &FilesystemVersion,
		to: &FilesystemVersion,
	) -> Result<Box<dyn ByteStream + 'a>, RpcError>;
}

#[async_trait]
impl PullRemote for RpcClient {
	async fn filesystems(&mut self) -> Result<Vec<DatasetPath>, RpcError> {
		self.call_json(ENDPOINT_FILESYSTEMS, &FilesystemRequest::default()).await
	}

	async fn filesystem_versions(
		&mut self,
		fs: &DatasetPath,
	) -> Result<Vec<FilesystemVersion>, RpcError> {
		let r = FilesystemVersionsRequest { filesystem: fs.clone() };
		self.call_json(ENDPOINT_FILESYSTEM_VERSIONS, &r).await
	}

	async fn initial_transfer<'a>(
		&'a mut self,
		fs: &DatasetPath,
		version: &FilesystemVersion,
	) -> Result<Box<dyn ByteStream + 'a>, RpcError> {
		let r = InitialTransferRequest {
			filesystem: fs.clone(),
			filesystem_version: version.clone(),
		};
		let stream = self.call_stream(ENDPOINT_INITIAL_TRANSFER, &r).await?;
		Ok(Box::new(stream))
	}

	async fn incremental_transfer<'a>(
		&'a mut self,
		fs: &DatasetPath,
		from: &FilesystemVersion,
		to: &FilesystemVersion,
	) -> Result<Box<dyn ByteStream + 'a>, RpcError> {
		let r = IncrementalTransferRequest {
			filesystem: fs.clone(),
			from: from.clone(),
			to: to.clone(),
		};
		let stream = self.call_stream(ENDPOINT_INCREMENTAL_TRANSFER, &r).await?;
		Ok(Box::new(stream))
	}
}

pub struct PullContext<'a> {
	pub remote: &'a mut dyn PullRemote,
	pub zfs: &'a dyn ZfsOps,
	pub mapping: &'a dyn DatasetMapping,
	pub initial_repl_policy: InitialReplPolicy,
	pub cancel: CancellationToken,
}

#[derive(Clone)]
struct RemoteLocalMapping {
	remote: DatasetPath,
	local: DatasetPath,
}

impl RemoteLocalMapping {
	fn log_prefix(&self) -> String {
		format!("{} => {}", self.remote, self.local)
	}
}

/// Run one pull cycle. Failures scoped to a single filesystem or
/// subtree are logged and skipped; an `Err` return means the cycle as
/// a whole was aborted.
pub async fn do_pull(ctx: PullContext<'_>) -> Result<(), PullError> {
	let PullContext { remote, zfs, mapping, initial_repl_policy, cancel } = ctx;

	check_cancel(&cancel)?;
	info!("requesting remote filesystem list");
	let remote_filesystems = remote.filesystems().await?;

	debug!("mapping remote filesystems to local paths");
	let mut repl_mapping: BTreeMap<String, RemoteLocalMapping> = BTreeMap::new();
	let mut local_traversal = DatasetPathForest::new();
	for remote_fs in remote_filesystems {
		let local_fs = match mapping.map(&remote_fs) {
			Ok(Some(local_fs)) => local_fs,
			Ok(None) => {
				trace!("no mapping for remote filesystem {}", remote_fs);
				continue;
			}
			Err(e) => {
				return Err(PullError::Mapping {
					remote: remote_fs.to_string(),
					message: e.to_string(),
				});
			}
		};
		info!("{} => {}", remote_fs, local_fs);
		let m = RemoteLocalMapping { remote: remote_fs, local: local_fs };
		let key = m.local.to_string();
		if repl_mapping.insert(key.clone(), m.clone()).is_some() {
			return Err(PullError::DuplicateMapping { local: key });
		}
		local_traversal.add(&m.local);
	}

	debug!("building cache for already present local filesystem state");
	let local_state = zfs.list_filesystem_state().await?;

	info!("starting per-filesystem sync");
	let mut walker = local_traversal.walker();
	while let Some(visit) = walker.next() {
		if visit.filled_in {
			if local_state.contains_key(&visit.path.to_string()) {
				// Any existing dataset can host children; whether it is
				// a placeholder does not matter here.
				continue;
			}
			info!("creating placeholder filesystem {}", visit.path);
			if let Err(e) = zfs.create_placeholder(&visit.path).await {
				error!("aborting subtree, cannot create placeholder filesystem {}: {}", visit.path, e);
				walker.skip_subtree();
			}
			continue;
		}

		let m = repl_mapping.get(&visit.path.to_string()).ok_or_else(|| {
			PullError::InternalInconsistency(format!(
				"mapping index has no entry for explicitly added path {}",
				visit.path
			))
		})?;

		let keep_descending = pull_filesystem(
			remote,
			zfs,
			m,
			local_state.get(&visit.path.to_string()).copied(),
			initial_repl_policy,
			&cancel,
		)
		.await?;
		if !keep_descending {
			walker.skip_subtree();
		}
	}

	info!("pull cycle done");
	Ok(())
}

/// Explicit states of the per-filesystem procedure.
enum FsStep {
	Examine,
	FetchRemoteVersions { left: Vec<FilesystemVersion>, placeholder: bool },
	Diff { left: Vec<FilesystemVersion>, right: Vec<FilesystemVersion>, placeholder: bool },
	Transfer { diff: FilesystemDiff, placeholder: bool },
	Done { keep_descending: bool },
}

/// Bring one mapped filesystem up to date. `Ok(true)` lets the walk
/// descend into mapped children; `Ok(false)` abandons the subtree.
/// `Err` aborts the whole cycle.
async fn pull_filesystem(
	remote: &mut dyn PullRemote,
	zfs: &dyn ZfsOps,
	m: &RemoteLocalMapping,
	local_state: Option<FilesystemState>,
	initial_repl_policy: InitialReplPolicy,
	cancel: &CancellationToken,
) -> Result<bool, PullError> {
	let pair = m.log_prefix();
	let mut step = FsStep::Examine;
	loop {
		step = match step {
			FsStep::Examine => {
				info!("[{}]: examining local filesystem state", pair);
				match local_state {
					None => {
						info!("[{}]: local filesystem does not exist", pair);
						FsStep::FetchRemoteVersions { left: Vec::new(), placeholder: false }
					}
					Some(state) if state.placeholder => {
						info!("[{}]: local filesystem is marked as placeholder", pair);
						FsStep::FetchRemoteVersions { left: Vec::new(), placeholder: true }
					}
					Some(_) => {
						info!("[{}]: local filesystem exists, requesting local versions", pair);
						match zfs.list_filesystem_versions(&m.local, None).await {
							Ok(left) => FsStep::FetchRemoteVersions { left, placeholder: false },
							Err(e) => {
								error!("[{}]: cannot get local filesystem versions: {}", pair, e);
								FsStep::Done { keep_descending: false }
							}
						}
					}
				}
			}

			FsStep::FetchRemoteVersions { left, placeholder } => {
				check_cancel(cancel)?;
				info!("[{}]: requesting remote filesystem versions", pair);
				match remote.filesystem_versions(&m.remote).await {
					Ok(right) => FsStep::Diff { left, right, placeholder },
					Err(e) => {
						error!("[{}]: error requesting remote filesystem versions: {}", pair, e);
						error!(
							"[{}]: stopping replication for all filesystems mapped as children of {}",
							pair, m.local
						);
						FsStep::Done { keep_descending: false }
					}
				}
			}

			FsStep::Diff { left, right, placeholder } => {
				let diff = make_filesystem_diff(&left, &right);
				info!("[{}]: {}", pair, diff);
				if placeholder && diff.conflict != Conflict::AllRight {
					return Err(PullError::InternalInconsistency(format!(
						"local placeholder {} implies conflict AllRight, got {}",
						m.local, diff.conflict
					)));
				}
				FsStep::Transfer { diff, placeholder }
			}

			FsStep::Transfer { diff, placeholder } => match diff.conflict {
				Conflict::AllRight => {
					let keep_descending = initial_sync(
						remote,
						zfs,
						m,
						&diff,
						placeholder,
						initial_repl_policy,
						cancel,
					)
					.await?;
					FsStep::Done { keep_descending }
				}
				Conflict::Incremental => {
					let keep_descending =
						incremental_sync(remote, zfs, m, &diff, cancel).await?;
					FsStep::Done { keep_descending }
				}
				Conflict::NoCommonAncestor => {
					warn!(
						"[{}]: remote and local filesystem have snapshots, but no common one",
						pair
					);
					warn!(
						"[{}]: perform manual replication to establish a common snapshot history",
						pair
					);
					log_version_lists(&pair, &diff.mrca_path_left, &diff.mrca_path_right);
					FsStep::Done { keep_descending: false }
				}
				Conflict::Diverged => {
					warn!("[{}]: remote and local filesystem share a history but have diverged", pair);
					warn!(
						"[{}]: perform manual replication or delete versions on the receiving side to establish an incremental replication path",
						pair
					);
					log_version_lists(&pair, &diff.mrca_path_left, &diff.mrca_path_right);
					FsStep::Done { keep_descending: false }
				}
			},

			FsStep::Done { keep_descending } => return Ok(keep_descending),
		};
	}
}

fn log_version_lists(pair: &str, left: &[FilesystemVersion], right: &[FilesystemVersion]) {
	warn!("[{}]: local-only versions:", pair);
	for v in left {
		warn!("[{}]:  {} (GUID {})", pair, v, v.guid);
	}
	warn!("[{}]: remote-only versions:", pair);
	for v in right {
		warn!("[{}]:  {} (GUID {})", pair, v, v.guid);
	}
}

async fn initial_sync(
	remote: &mut dyn PullRemote,
	zfs: &dyn ZfsOps,
	m: &RemoteLocalMapping,
	diff: &FilesystemDiff,
	placeholder: bool,
	policy: InitialReplPolicy,
	cancel: &CancellationToken,
) -> Result<bool, PullError> {
	let pair = m.log_prefix();
	info!("[{}]: performing initial sync, following policy '{:?}'", pair, policy);

	// MostRecent is the only policy: pick the latest remote snapshot.
	// Bookmarks cannot be the target of a full send.
	let snapshot = diff
		.mrca_path_right
		.iter()
		.rev()
		.find(|v| v.kind == VersionKind::Snapshot);
	let Some(snapshot) = snapshot else {
		warn!("[{}]: cannot perform initial sync: no remote snapshots", pair);
		return Ok(false);
	};

	check_cancel(cancel)?;
	info!("[{}]: requesting snapshot stream for {}", pair, snapshot);
	let mut stream = match remote.initial_transfer(&m.remote, snapshot).await {
		Ok(stream) => stream,
		Err(e) => {
			error!("[{}]: error requesting initial transfer: {}", pair, e);
			return Ok(false);
		}
	};

	info!("[{}]: invoking zfs receive", pair);
	let opts = RecvOptions { force_rollback: placeholder };
	if placeholder {
		info!("[{}]: receive with forced rollback to replace placeholder filesystem", pair);
	}
	let total = match receive_stream(zfs, &m.local, opts, stream.as_mut(), cancel, &pair).await {
		Ok(total) => total,
		Err(ReceiveError::Fatal(e)) => return Err(e),
		Err(ReceiveError::Filesystem(e)) => {
			error!("[{}]: error receiving stream: {}", pair, e);
			return Ok(false);
		}
	};
	info!("[{}]: finished receiving stream, {} bytes total", pair, total);

	debug!("[{}]: configuring properties of received filesystem", pair);
	if let Err(e) = zfs.set(&m.local, "readonly", "on").await {
		error!("[{}]: cannot set readonly property: {}", pair, e);
	}

	info!("[{}]: finished initial transfer", pair);
	Ok(true)
}

async fn incremental_sync(
	remote: &mut dyn PullRemote,
	zfs: &dyn ZfsOps,
	m: &RemoteLocalMapping,
	diff: &FilesystemDiff,
	cancel: &CancellationToken,
) -> Result<bool, PullError> {
	let pair = m.log_prefix();
	if diff.incremental_path.len() < 2 {
		info!("[{}]: remote and local are in sync", pair);
		return Ok(true);
	}

	info!("[{}]: following incremental path from diff", pair);
	let steps = diff.incremental_path.len() - 1;
	let mut path_rx = 0u64;

	for (i, pair_window) in diff.incremental_path.windows(2).enumerate() {
		let (from, to) = (&pair_window[0], &pair_window[1]);
		let step = format!("[{}][{}/{}][{} => {}]", pair, i + 1, steps, from.name, to.name);

		check_cancel(cancel)?;
		info!("{}: requesting incremental snapshot stream", step);
		let mut stream = match remote.incremental_transfer(&m.remote, from, to).await {
			Ok(stream) => stream,
			Err(e) => {
				error!("{}: error requesting incremental snapshot stream: {}", step, e);
				return Ok(false);
			}
		};

		info!("{}: invoking zfs receive", step);
		let opts = RecvOptions::default();
		let total =
			match receive_stream(zfs, &m.local, opts, stream.as_mut(), cancel, &step).await {
				Ok(total) => total,
				Err(ReceiveError::Fatal(e)) => return Err(e),
				Err(ReceiveError::Filesystem(e)) => {
					error!("{}: error receiving stream: {}", step, e);
					return Ok(false);
				}
			};
		path_rx += total;
		info!("{}: finished incremental transfer, {} bytes", step, total);
	}

	info!("[{}]: finished following incremental path, {} bytes total", pair, path_rx);
	Ok(true)
}

enum ReceiveError {
	/// Aborts the whole cycle (broken channel, cancellation).
	Fatal(PullError),
	/// Aborts only this filesystem; the channel is still aligned.
	Filesystem(crate::zfs::ZfsError),
}

/// Pump a transfer stream into a local receive, reporting progress
/// periodically and honoring cancellation.
///
/// On a local receive failure the rest of the stream is drained so the
/// channel stays usable for the remaining filesystems.
async fn receive_stream(
	zfs: &dyn ZfsOps,
	local: &DatasetPath,
	opts: RecvOptions,
	stream: &mut (dyn ByteStream + '_),
	cancel: &CancellationToken,
	log_prefix: &str,
) -> Result<u64, ReceiveError> {
	let mut sink = match zfs.recv(local, opts).await {
		Ok(sink) => sink,
		Err(e) => {
			if let Err(drain_err) = drain_stream(stream).await {
				return Err(ReceiveError::Fatal(drain_err.into()));
			}
			return Err(ReceiveError::Filesystem(e));
		}
	};

	let mut buf = vec![0u8; RECV_COPY_BUFFER_SIZE];
	let mut total = 0u64;
	let mut last_report = Instant::now();
	loop {
		if cancel.is_cancelled() {
			sink.abort().await;
			return Err(ReceiveError::Fatal(PullError::Cancelled));
		}
		let n = match stream.read(&mut buf).await {
			Ok(n) => n,
			Err(e) => {
				sink.abort().await;
				return Err(ReceiveError::Fatal(e.into()));
			}
		};
		if n == 0 {
			break;
		}
		if let Err(e) = sink.write_all(&buf[..n]).await {
			sink.abort().await;
			if let Err(drain_err) = drain_stream(stream).await {
				return Err(ReceiveError::Fatal(drain_err.into()));
			}
			return Err(ReceiveError::Filesystem(e));
		}
		total += n as u64;
		if last_report.elapsed() >= PROGRESS_REPORT_INTERVAL {
			info!("{}: progress on receive operation: {} bytes received", log_prefix, total);
			last_report = Instant::now();
		}
	}
	sink.finish().await.map_err(ReceiveError::Filesystem)?;
	Ok(total)
}

async fn drain_stream(stream: &mut (dyn ByteStream + '_)) -> Result<(), RpcError> {
	let mut buf = vec![0u8; RECV_COPY_BUFFER_SIZE];
	loop {
		if stream.read(&mut buf).await? == 0 {
			return Ok(());
		}
	}
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), PullError> {
	if cancel.is_cancelled() {
		return Err(PullError::Cancelled);
	}
	Ok(())
}

// vim: ts=4
