// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_codex_core::{ClientError, SessionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
	#[error("unknown session: {0}")]
	UnknownSession(String),

	#[error("failed to launch app server: {0}")]
	Launch(String),

	#[error("orchestrator is shutting down")]
	ShuttingDown,

	#[error(transparent)]
	Session(#[from] SessionError),

	#[error(transparent)]
	Client(#[from] ClientError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
