use clap::{Parser, Subcommand};
use std::path::PathBuf;

use zrepd::config::Config;
use zrepd::daemon::{run_pull_cycle, Daemon};
use zrepd::logging::*;
use zrepd::source;

#[derive(Parser)]
#[command(name = "zrepd", version, about = "Pull-based ZFS dataset replication daemon")]
struct Cli {
	/// Path to the configuration file
	#[arg(short, long, default_value = "/etc/zrepd/zrepd.json")]
	config: PathBuf,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Run all configured jobs until signalled
	Daemon,
	/// Run one cycle of the named pull job
	Pull { job: String },
	/// Serve the named source job over stdin/stdout (used by the
	/// transport, e.g. via ssh forced commands)
	Source { job: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
	init_tracing();
	let cli = Cli::parse();
	let config = Config::load(&cli.config)?;

	match cli.command {
		Command::Daemon => Daemon::new(config).run().await,
		Command::Pull { job } => {
			let Some(job_config) = config.pull.get(&job) else {
				error!("could not find pull job {}", job);
				std::process::exit(1);
			};
			let cancel = tokio_util::sync::CancellationToken::new();
			run_pull_cycle(&job, job_config, &cancel).await
		}
		Command::Source { job } => {
			let Some(job_config) = config.source.get(&job) else {
				error!("could not find source job {}", job);
				std::process::exit(1);
			};
			source::serve_stdio(&job, job_config).await
		}
	}
}

// vim: ts=4
