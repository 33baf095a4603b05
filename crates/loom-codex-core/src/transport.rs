// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Byte-stream transport to the agent process.
//!
//! A transport is three line-oriented streams (an outbound writer, the primary
//! protocol channel, and an optional diagnostic channel) plus an optional child
//! process that is killed on dispose.

use std::process::Stdio;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::AppServerCommand;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;

pub struct Transport {
	writer: BoxedWriter,
	primary: BoxedReader,
	diagnostic: Option<BoxedReader>,
	child: Option<Child>,
}

impl std::fmt::Debug for Transport {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Transport")
			.field("has_diagnostic", &self.diagnostic.is_some())
			.field("pid", &self.child.as_ref().and_then(Child::id))
			.finish()
	}
}

impl Transport {
	/// Build a transport from arbitrary async streams.
	pub fn from_streams<W, R>(writer: W, primary: R) -> Self
	where
		W: AsyncWrite + Send + Unpin + 'static,
		R: tokio::io::AsyncRead + Send + Unpin + 'static,
	{
		Self {
			writer: Box::new(writer),
			primary: Box::new(BufReader::new(primary)),
			diagnostic: None,
			child: None,
		}
	}

	pub fn with_diagnostic<D>(mut self, diagnostic: D) -> Self
	where
		D: tokio::io::AsyncRead + Send + Unpin + 'static,
	{
		self.diagnostic = Some(Box::new(BufReader::new(diagnostic)));
		self
	}

	/// Spawn the agent process with piped stdio. stdout is the primary channel,
	/// stderr the diagnostic channel.
	pub fn spawn(command: &AppServerCommand) -> std::io::Result<Self> {
		let mut cmd = Command::new(&command.program);
		cmd.args(&command.args)
			.envs(&command.env)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);
		if let Some(cwd) = &command.cwd {
			cmd.current_dir(cwd);
		}

		let mut child = cmd.spawn()?;
		let missing = |name: &str| std::io::Error::other(format!("child {name} was not piped"));
		let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
		let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
		let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

		info!(
			program = %command.program,
			args = ?command.args,
			pid = ?child.id(),
			"spawned app server"
		);

		Ok(Self {
			writer: Box::new(stdin),
			primary: Box::new(BufReader::new(stdout)),
			diagnostic: Some(Box::new(BufReader::new(stderr))),
			child: Some(child),
		})
	}

	pub(crate) fn into_parts(self) -> TransportParts {
		TransportParts {
			writer: LineWriter {
				inner: self.writer,
				partial: false,
			},
			primary: LineReader::new(self.primary),
			diagnostic: self.diagnostic.map(LineReader::new),
			process: ProcessHandle { child: self.child },
		}
	}
}

pub(crate) struct TransportParts {
	pub writer: LineWriter,
	pub primary: LineReader,
	pub diagnostic: Option<LineReader>,
	pub process: ProcessHandle,
}

/// Reads newline-terminated lines without requiring them to be UTF-8.
///
/// Invalid sequences are replaced rather than reported as errors, so one bad
/// line costs that line only. Bytes read so far are kept across calls, which
/// makes `next_line` safe to use as a `select!` branch.
pub(crate) struct LineReader {
	inner: BoxedReader,
	buf: Vec<u8>,
}

impl LineReader {
	pub fn new(inner: BoxedReader) -> Self {
		Self {
			inner,
			buf: Vec::new(),
		}
	}

	/// Next line without its terminator, or `None` at end of stream.
	pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
		let read = self.inner.read_until(b'\n', &mut self.buf).await?;
		if read == 0 && self.buf.is_empty() {
			return Ok(None);
		}
		if self.buf.last() == Some(&b'\n') {
			self.buf.pop();
			if self.buf.last() == Some(&b'\r') {
				self.buf.pop();
			}
		}
		let line = String::from_utf8_lossy(&self.buf).into_owned();
		self.buf.clear();
		Ok(Some(line))
	}
}

/// Writes whole lines; callers serialize access so frames never interleave.
pub(crate) struct LineWriter {
	inner: BoxedWriter,
	/// A previous write was dropped after sending part of its frame.
	partial: bool,
}

impl LineWriter {
	pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
		if self.partial {
			// Terminate the abandoned fragment so it cannot merge with this frame.
			self.inner.write_all(b"\n").await?;
		}
		self.partial = true;
		self.inner.write_all(line.as_bytes()).await?;
		self.inner.write_all(b"\n").await?;
		self.partial = false;
		self.inner.flush().await
	}

	pub async fn close(&mut self) {
		if let Err(e) = self.inner.shutdown().await {
			debug!(error = %e, "closing transport writer");
		}
	}
}

pub(crate) struct ProcessHandle {
	child: Option<Child>,
}

impl ProcessHandle {
	pub async fn terminate(&mut self) {
		let Some(mut child) = self.child.take() else {
			return;
		};
		let pid = child.id();
		if let Err(e) = child.start_kill() {
			// Already exited.
			debug!(pid = ?pid, error = %e, "app server kill");
		}
		match child.wait().await {
			Ok(status) => info!(pid = ?pid, status = %status, "app server exited"),
			Err(e) => warn!(pid = ?pid, error = %e, "failed to reap app server"),
		}
	}
}
