//! [`ZfsOps`] implementation shelling out to the `zfs` binary.
//!
//! List output is requested in machine-readable form (`-H -p`, tab
//! separated). Send and receive run as long-lived child processes whose
//! stdio carries the snapshot stream.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::logging::*;

use super::dataset_path::DatasetPath;
use super::error::ZfsError;
use super::ops::{
	DatasetFilter, FilesystemState, RecvOptions, RecvSink, SendStream, VersionFilter, ZfsOps,
	PLACEHOLDER_PROPERTY,
};
use super::version::{FilesystemVersion, VersionKind};

pub struct ZfsCli {
	binary: String,
}

impl ZfsCli {
	pub fn new() -> Self {
		ZfsCli { binary: "zfs".to_string() }
	}

	/// Use a different binary, e.g. a wrapper script granting
	/// delegated permissions.
	pub fn with_binary(binary: impl Into<String>) -> Self {
		ZfsCli { binary: binary.into() }
	}

	/// Run a zfs subcommand to completion and return its stdout.
	async fn run(&self, args: &[&str]) -> Result<String, ZfsError> {
		debug!("running {} {}", self.binary, args.join(" "));
		let output = Command::new(&self.binary)
			.args(args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.output()
			.await?;
		if !output.status.success() {
			return Err(ZfsError::CommandFailed {
				command: format!("{} {}", self.binary, args.join(" ")),
				stderr: String::from_utf8_lossy(&output.stderr).to_string(),
			});
		}
		String::from_utf8(output.stdout).map_err(|e| ZfsError::Parse {
			line: String::new(),
			message: format!("output is not UTF-8: {}", e),
		})
	}
}

impl Default for ZfsCli {
	fn default() -> Self {
		ZfsCli::new()
	}
}

fn parse_u64(field: &str, line: &str) -> Result<u64, ZfsError> {
	field.parse().map_err(|e| ZfsError::Parse {
		line: line.to_string(),
		message: format!("invalid number '{}': {}", field, e),
	})
}

/// Split a `filesystem@snap` or `filesystem#bookmark` reference.
fn parse_version_name(name: &str, line: &str) -> Result<(VersionKind, String), ZfsError> {
	if let Some((_, snap)) = name.split_once('@') {
		return Ok((VersionKind::Snapshot, snap.to_string()));
	}
	if let Some((_, mark)) = name.split_once('#') {
		return Ok((VersionKind::Bookmark, mark.to_string()));
	}
	Err(ZfsError::Parse {
		line: line.to_string(),
		message: "missing version delimiter".to_string(),
	})
}

#[async_trait]
impl ZfsOps for ZfsCli {
	async fn list_filesystems(
		&self,
		filter: &dyn DatasetFilter,
	) -> Result<Vec<DatasetPath>, ZfsError> {
		let out = self
			.run(&["list", "-H", "-p", "-o", "name", "-t", "filesystem,volume", "-s", "name"])
			.await?;
		let mut paths = Vec::new();
		for line in out.lines() {
			let path = DatasetPath::new(line.trim())?;
			if filter.filter(&path)? {
				paths.push(path);
			}
		}
		Ok(paths)
	}

	async fn list_filesystem_state(
		&self,
	) -> Result<BTreeMap<String, FilesystemState>, ZfsError> {
		let prop_list = format!("name,{}", PLACEHOLDER_PROPERTY);
		let out = self
			.run(&["list", "-H", "-p", "-o", prop_list.as_str(), "-t", "filesystem,volume", "-s", "name"])
			.await?;
		let mut state = BTreeMap::new();
		for line in out.lines() {
			let mut fields = line.split('\t');
			let (Some(name), Some(placeholder)) = (fields.next(), fields.next()) else {
				return Err(ZfsError::Parse {
					line: line.to_string(),
					message: "expected two tab-separated fields".to_string(),
				});
			};
			let path = DatasetPath::new(name)?;
			state.insert(
				path.to_string(),
				FilesystemState { placeholder: placeholder == "on" },
			);
		}
		Ok(state)
	}

	async fn list_filesystem_versions(
		&self,
		fs: &DatasetPath,
		filter: Option<&dyn VersionFilter>,
	) -> Result<Vec<FilesystemVersion>, ZfsError> {
		let fs_arg = fs.to_string();
		let out = self
			.run(&[
				"list",
				"-H",
				"-p",
				"-o",
				"name,guid,createtxg,creation",
				"-t",
				"snapshot,bookmark",
				"-s",
				"createtxg",
				"-r",
				"-d",
				"1",
				fs_arg.as_str(),
			])
			.await?;
		let mut versions = Vec::new();
		for line in out.lines() {
			let fields: Vec<&str> = line.split('\t').collect();
			if fields.len() != 4 {
				return Err(ZfsError::Parse {
					line: line.to_string(),
					message: "expected four tab-separated fields".to_string(),
				});
			}
			let (kind, name) = parse_version_name(fields[0], line)?;
			let version = FilesystemVersion {
				kind,
				name,
				guid: parse_u64(fields[1], line)?,
				create_txg: parse_u64(fields[2], line)?,
				creation: parse_u64(fields[3], line)?,
			};
			let admitted = match filter {
				Some(f) => f.filter(&version)?,
				None => true,
			};
			if admitted {
				versions.push(version);
			}
		}
		Ok(versions)
	}

	async fn send(
		&self,
		fs: &DatasetPath,
		from: Option<&FilesystemVersion>,
		to: &FilesystemVersion,
	) -> Result<SendStream, ZfsError> {
		let to_arg = to.to_abs_path(fs);
		let mut args: Vec<String> = vec!["send".to_string()];
		if let Some(from) = from {
			args.push("-i".to_string());
			args.push(from.relative_name());
		}
		args.push(to_arg);
		debug!("running {} {}", self.binary, args.join(" "));
		let mut child = Command::new(&self.binary)
			.args(&args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()?;
		let stdout = child.stdout.take().ok_or_else(|| {
			ZfsError::Io(std::io::Error::other("cannot acquire stdout of zfs send"))
		})?;
		Ok(Box::new(CliSendStream { _child: child, stdout }))
	}

	async fn recv(
		&self,
		fs: &DatasetPath,
		opts: RecvOptions,
	) -> Result<Box<dyn RecvSink>, ZfsError> {
		let fs_arg = fs.to_string();
		let mut args: Vec<&str> = vec!["recv", "-u"];
		if opts.force_rollback {
			args.push("-F");
		}
		args.push(&fs_arg);
		debug!("running {} {}", self.binary, args.join(" "));
		let mut child = Command::new(&self.binary)
			.args(&args)
			.stdin(Stdio::piped())
			.stdout(Stdio::null())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()?;
		let stdin = child.stdin.take().ok_or_else(|| {
			ZfsError::Io(std::io::Error::other("cannot acquire stdin of zfs recv"))
		})?;
		let command = format!("{} {}", self.binary, args.join(" "));
		Ok(Box::new(CliRecvSink { child, stdin: Some(stdin), command }))
	}

	async fn set(&self, fs: &DatasetPath, property: &str, value: &str) -> Result<(), ZfsError> {
		let assignment = format!("{}={}", property, value);
		let fs_arg = fs.to_string();
		self.run(&["set", assignment.as_str(), fs_arg.as_str()]).await?;
		Ok(())
	}

	async fn create_placeholder(&self, fs: &DatasetPath) -> Result<(), ZfsError> {
		let prop = format!("{}=on", PLACEHOLDER_PROPERTY);
		let fs_arg = fs.to_string();
		self.run(&["create", "-o", prop.as_str(), fs_arg.as_str()]).await?;
		Ok(())
	}
}

/// Send stream keeping the producing child alive for as long as the
/// stream is read.
struct CliSendStream {
	_child: Child,
	stdout: ChildStdout,
}

impl AsyncRead for CliSendStream {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.stdout).poll_read(cx, buf)
	}
}

struct CliRecvSink {
	child: Child,
	stdin: Option<ChildStdin>,
	command: String,
}

#[async_trait]
impl RecvSink for CliRecvSink {
	async fn write_all(&mut self, buf: &[u8]) -> Result<(), ZfsError> {
		let stdin = self
			.stdin
			.as_mut()
			.ok_or_else(|| ZfsError::Io(std::io::Error::other("receive already finished")))?;
		stdin.write_all(buf).await?;
		Ok(())
	}

	async fn finish(mut self: Box<Self>) -> Result<(), ZfsError> {
		// Closing stdin signals end of stream to the child.
		drop(self.stdin.take());
		let this = *self;
		let output = this.child.wait_with_output().await?;
		if !output.status.success() {
			return Err(ZfsError::CommandFailed {
				command: this.command,
				stderr: String::from_utf8_lossy(&output.stderr).to_string(),
			});
		}
		Ok(())
	}

	async fn abort(mut self: Box<Self>) {
		drop(self.stdin.take());
		if let Err(e) = self.child.start_kill() {
			warn!("cannot kill zfs recv: {}", e);
		}
		let _ = self.child.wait().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_version_name() {
		let (kind, name) = parse_version_name("tank/db@backup_1", "").unwrap();
		assert_eq!(kind, VersionKind::Snapshot);
		assert_eq!(name, "backup_1");

		let (kind, name) = parse_version_name("tank/db#keep", "").unwrap();
		assert_eq!(kind, VersionKind::Bookmark);
		assert_eq!(name, "keep");

		assert!(parse_version_name("tank/db", "").is_err());
	}
}

// vim: ts=4
