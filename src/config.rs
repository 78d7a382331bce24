//! Job configuration and operational constants.
//!
//! The daemon loads a JSON config file naming pull jobs (what to fetch
//! from where, and where to put it) and source jobs (what a connecting
//! puller is allowed to see). Everything else in this module is a
//! tuning constant.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::pull::InitialReplPolicy;

/// Upper bound on a graceful RPC close before it is escalated to a
/// forced close.
pub const CLOSE_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// How often an in-progress receive reports cumulative bytes.
pub const PROGRESS_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Chunk size for pumping a transfer stream into `zfs receive`.
pub const RECV_COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
	pub pull: BTreeMap<String, PullJobConfig>,
	pub source: BTreeMap<String, SourceJobConfig>,
}

/// A pull job: periodically contact a source and replicate the mapped
/// filesystems into the local pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PullJobConfig {
	/// Where to pull from: `host:job` reaches the named source job on
	/// a remote host over ssh, a bare `job` spawns a local source
	/// process.
	pub connect: String,

	/// Remote prefix to local prefix mapping entries.
	pub mapping: BTreeMap<String, String>,

	#[serde(default)]
	pub initial_repl_policy: InitialReplPolicy,

	/// Seconds between cycles. Absent means run a single cycle and
	/// stop.
	#[serde(default)]
	pub interval_secs: Option<u64>,
}

/// A source job: what a puller connecting under this job name may see.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SourceJobConfig {
	/// Dataset prefixes the puller may access.
	pub datasets: Vec<String>,

	/// Only snapshots whose name starts with this prefix are exposed.
	#[serde(default)]
	pub snapshot_prefix: String,
}

impl Config {
	pub fn load(path: &Path) -> Result<Config, Box<dyn std::error::Error + Send + Sync>> {
		let raw = std::fs::read_to_string(path)
			.map_err(|e| format!("cannot read config file {}: {}", path.display(), e))?;
		let config: Config = serde_json::from_str(&raw)
			.map_err(|e| format!("cannot parse config file {}: {}", path.display(), e))?;
		Ok(config)
	}
}


// vim: ts=4
