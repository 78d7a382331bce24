//! Logging prelude module for convenient access to tracing macros.
//!
//! # Usage
//!
//! ```ignore
//! use crate::logging::*;
//!
//! info!("starting pull cycle");
//! warn!("remote version list is empty");
//! ```

pub use tracing::{debug, error, info, trace, warn};

/// Initialize the tracing subscriber.
///
/// Only this crate logs by default, at INFO and above; the `RUST_LOG`
/// environment variable overrides the filter entirely:
///
/// ```bash
/// RUST_LOG=zrepd=debug zrepd daemon
/// RUST_LOG=zrepd::pull=trace,tokio=info zrepd pull backup
/// ```
pub fn init_tracing() {
	use std::io::IsTerminal;

	// stdout is the replication byte channel in `source` mode, so log
	// output must stay on stderr. In daemon and source mode stderr is
	// an ssh channel or a service manager's journal, not a terminal:
	// no colors there, and no module targets on lines that already
	// carry a [remote => local] prefix.
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("zrepd=info")),
		)
		.with_ansi(std::io::stderr().is_terminal())
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

// vim: ts=4
