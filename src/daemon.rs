//! Daemon loop: run every configured pull job in its own task until
//! all jobs finish or a termination signal cancels them.

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, PullJobConfig};
use crate::connect;
use crate::filters::DatasetMapFilter;
use crate::logging::*;
use crate::pull::{do_pull, PullContext};
use crate::zfs::ZfsCli;

pub struct Daemon {
	config: Config,
}

impl Daemon {
	pub fn new(config: Config) -> Self {
		Daemon { config }
	}

	pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
		if self.config.pull.is_empty() {
			warn!("no pull jobs configured, nothing to do");
			return Ok(());
		}

		let cancel = CancellationToken::new();
		let mut jobs = JoinSet::new();
		for (name, job) in self.config.pull {
			info!("starting job {}", name);
			jobs.spawn(run_pull_job(name, job, cancel.child_token()));
		}

		let mut sigint = signal(SignalKind::interrupt())?;
		let mut sigterm = signal(SignalKind::terminate())?;

		loop {
			tokio::select! {
				_ = sigint.recv() => {
					info!("received SIGINT, cancelling all jobs");
					cancel.cancel();
				}
				_ = sigterm.recv() => {
					info!("received SIGTERM, cancelling all jobs");
					cancel.cancel();
				}
				finished = jobs.join_next() => match finished {
					Some(Ok(name)) => info!("job finished: {}", name),
					Some(Err(e)) => error!("job task failed: {}", e),
					None => break,
				}
			}
		}

		info!("all jobs finished, exiting");
		Ok(())
	}
}

/// Run a pull job until its interval loop ends or the token cancels
/// it. Returns the job name for the daemon's bookkeeping.
async fn run_pull_job(name: String, job: PullJobConfig, cancel: CancellationToken) -> String {
	loop {
		if cancel.is_cancelled() {
			break;
		}
		match run_pull_cycle(&name, &job, &cancel).await {
			Ok(()) => info!("job {}: pull cycle finished", name),
			Err(e) => error!("job {}: pull cycle failed: {}", name, e),
		}
		let Some(secs) = job.interval_secs else {
			break;
		};
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = tokio::time::sleep(std::time::Duration::from_secs(secs)) => {}
		}
	}
	name
}

/// Connect to the job's source and run a single replication cycle.
pub async fn run_pull_cycle(
	name: &str,
	job: &PullJobConfig,
	cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
	let mapping = DatasetMapFilter::from_entries(
		job.mapping.iter().map(|(k, v)| (k.as_str(), v.as_str())),
	)
	.map_err(|e| format!("job {}: invalid mapping: {}", name, e))?;

	let mut conn = connect::connect(&job.connect).await?;
	let zfs = ZfsCli::new();
	let result = do_pull(PullContext {
		remote: &mut conn.client,
		zfs: &zfs,
		mapping: &mapping,
		initial_repl_policy: job.initial_repl_policy,
		cancel: cancel.clone(),
	})
	.await;
	conn.close().await;
	result?;
	Ok(())
}

// vim: ts=4
