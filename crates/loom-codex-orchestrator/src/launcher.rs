// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use loom_codex_core::{AppServerCommand, Transport};

use crate::error::{OrchestratorError, Result};

/// Produces a fresh transport for each orchestrated session.
#[async_trait]
pub trait ClientLauncher: Send + Sync {
	async fn launch(&self) -> Result<Transport>;
}

/// Spawns the app server as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
	command: AppServerCommand,
}

impl ProcessLauncher {
	pub fn new(command: AppServerCommand) -> Self {
		Self { command }
	}
}

#[async_trait]
impl ClientLauncher for ProcessLauncher {
	async fn launch(&self) -> Result<Transport> {
		Transport::spawn(&self.command)
			.map_err(|e| OrchestratorError::Launch(format!("{}: {e}", self.command.program)))
	}
}
