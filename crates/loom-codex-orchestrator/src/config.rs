// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::time::Duration;

use loom_codex_core::config::duration_ms;
use loom_codex_core::ClientConfig;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
	/// Longest a queued turn waits for its session's gate before it is
	/// reported as `queueTimedOut`.
	#[serde(with = "duration_ms")]
	pub queue_timeout: Duration,
	#[serde(with = "duration_ms")]
	pub queue_poll_interval: Duration,
	/// Settings for every client the orchestrator launches.
	pub client: ClientConfig,
	pub client_name: String,
	pub client_version: String,
}

impl Default for OrchestratorConfig {
	fn default() -> Self {
		Self {
			queue_timeout: Duration::from_secs(120),
			queue_poll_interval: Duration::from_millis(250),
			client: ClientConfig::default(),
			client_name: "loom".to_string(),
			client_version: env!("CARGO_PKG_VERSION").to_string(),
		}
	}
}
