//! Client-side transport: reach a source job and hand its byte channel
//! to the RPC client.
//!
//! `host:job` spawns `ssh host zrepd source job` and uses the child's
//! stdio as the channel; a bare `job` spawns a local source process,
//! which is mainly useful for testing a configuration.

use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::logging::*;
use crate::rpc::{MessageLayer, RpcClient};

pub struct RemoteConnection {
	pub client: RpcClient,
	child: Child,
}

pub async fn connect(
	connect_str: &str,
) -> Result<RemoteConnection, Box<dyn std::error::Error + Send + Sync>> {
	let mut child = if let Some(colon) = connect_str.find(':') {
		let host = &connect_str[..colon];
		let job = &connect_str[colon + 1..];
		info!("connecting to source job {} on {}", job, host);
		Command::new("ssh")
			.arg(host)
			.arg("zrepd")
			.arg("source")
			.arg(job)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| format!("failed to spawn ssh subprocess for {}: {}", connect_str, e))?
	} else {
		info!("connecting to local source job {}", connect_str);
		Command::new("zrepd")
			.arg("source")
			.arg(connect_str)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| format!("failed to spawn local source job {}: {}", connect_str, e))?
	};

	let send = child.stdin.take().ok_or("failed to acquire stdin from subprocess")?;
	let recv = child.stdout.take().ok_or("failed to acquire stdout from subprocess")?;
	let ml = MessageLayer::new(Box::new(recv), Box::new(send));
	Ok(RemoteConnection { client: RpcClient::new(ml), child })
}

impl RemoteConnection {
	/// Close the session gracefully and reap the transport child.
	pub async fn close(self) {
		if let Err(e) = self.client.close().await {
			warn!("error closing rpc connection: {}", e);
		}
		let mut child = self.child;
		match tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await {
			Ok(Ok(status)) => debug!("transport subprocess exited with {}", status),
			Ok(Err(e)) => warn!("error waiting for transport subprocess: {}", e),
			Err(_) => {
				warn!("transport subprocess did not exit, killing it");
				let _ = child.start_kill();
				let _ = child.wait().await;
			}
		}
	}
}

// vim: ts=4
