//! Source-side serving: expose a configured source job over this
//! process's stdin and stdout.
//!
//! The transport (sshd invoking `zrepd source <job>`, or a local
//! subprocess) owns authentication; by the time this code runs, the
//! byte channel is trusted as far as the job's filters allow.

use std::sync::Arc;

use crate::config::SourceJobConfig;
use crate::filters::{PrefixDatasetFilter, PrefixSnapshotFilter};
use crate::handler::{register_endpoints, Handler};
use crate::logging::*;
use crate::rpc::{MessageLayer, RpcServer};
use crate::zfs::{DatasetPath, ZfsCli, ZfsOps};

/// Serve one session for the given source job, until the peer closes
/// it or a protocol error forces a hang-up.
pub async fn serve_stdio(
	job_name: &str,
	job: &SourceJobConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
	let zfs: Arc<dyn ZfsOps> = Arc::new(ZfsCli::new());
	serve_channel(job_name, job, zfs, Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout()))
		.await
}

pub async fn serve_channel(
	job_name: &str,
	job: &SourceJobConfig,
	zfs: Arc<dyn ZfsOps>,
	r: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
	w: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
	let mut prefixes = Vec::with_capacity(job.datasets.len());
	for ds in &job.datasets {
		prefixes.push(
			DatasetPath::new(ds)
				.map_err(|e| format!("invalid dataset prefix in source job {}: {}", job_name, e))?,
		);
	}
	let handler = Arc::new(Handler::new(
		zfs,
		Arc::new(PrefixDatasetFilter::new(prefixes)),
		Arc::new(PrefixSnapshotFilter::new(job.snapshot_prefix.clone())),
	));

	let mut server = RpcServer::new(MessageLayer::new(r, w));
	register_endpoints(&mut server, handler)?;

	info!("serving source job {}", job_name);
	server.serve().await?;
	info!("source job {} session ended", job_name);
	Ok(())
}

// vim: ts=4
