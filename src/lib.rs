//! # zrepd - pull-based ZFS dataset replication
//!
//! A source host exposes datasets and snapshots through a small RPC
//! protocol; a sink host pulls snapshot streams and reconstructs them
//! locally. The crate splits into the RPC stack ([`rpc`]), the ZFS
//! domain model and adapter ([`zfs`]), the server-side endpoints
//! ([`handler`]) and the pull orchestrator ([`pull`]); [`daemon`] ties
//! configured jobs to the runtime.
//!
//! ## Running a single pull cycle
//!
//! ```rust,ignore
//! use zrepd::pull::{do_pull, PullContext, InitialReplPolicy};
//!
//! let result = do_pull(PullContext {
//!     remote: &mut client,
//!     zfs: &zfs,
//!     mapping: &mapping,
//!     initial_repl_policy: InitialReplPolicy::MostRecent,
//!     cancel: cancel_token,
//! }).await;
//! ```

pub mod config;
pub mod connect;
pub mod daemon;
pub mod error;
pub mod filters;
pub mod handler;
pub mod logging;
pub mod pull;
pub mod rpc;
pub mod source;
pub mod zfs;

// Re-export commonly used types
pub use config::Config;
pub use error::PullError;
pub use filters::{DatasetMapFilter, DatasetMapping, PrefixDatasetFilter, PrefixSnapshotFilter};
pub use zfs::{DatasetPath, FilesystemVersion, VersionKind};

// vim: ts=4
