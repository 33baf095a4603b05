// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and capacity knobs for one app server client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
	/// Upper bound on a single request/response exchange. `None` waits forever.
	#[serde(with = "duration_ms::option")]
	pub request_timeout: Option<Duration>,
	/// How long a content-less successful completion waits for a late first
	/// delta before resolving with empty text.
	#[serde(with = "duration_ms")]
	pub completion_grace: Duration,
	#[serde(with = "duration_ms")]
	pub turn_timeout: Duration,
	/// Budget for finding a turn to interrupt when none is tracked yet.
	#[serde(with = "duration_ms")]
	pub interrupt_wait: Duration,
	#[serde(with = "duration_ms")]
	pub interrupt_poll_interval: Duration,
	#[serde(with = "duration_ms")]
	pub interrupt_request_timeout: Duration,
	/// Turn ids that may hold buffered signals before the oldest is evicted.
	pub max_buffered_turns: usize,
	/// Resolved turn ids remembered so late signals are dropped.
	pub retired_turn_memory: usize,
	pub event_capacity: usize,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			request_timeout: Some(Duration::from_secs(600)),
			completion_grace: Duration::from_millis(50),
			turn_timeout: Duration::from_secs(30 * 60),
			interrupt_wait: Duration::from_secs(2),
			interrupt_poll_interval: Duration::from_millis(50),
			interrupt_request_timeout: Duration::from_secs(5),
			max_buffered_turns: 256,
			retired_turn_memory: 256,
			event_capacity: 1024,
		}
	}
}

/// How to launch the external agent process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppServerCommand {
	pub program: String,
	pub args: Vec<String>,
	pub env: HashMap<String, String>,
	pub cwd: Option<PathBuf>,
}

impl Default for AppServerCommand {
	fn default() -> Self {
		Self {
			program: "codex".to_string(),
			args: vec!["app-server".to_string()],
			env: HashMap::new(),
			cwd: None,
		}
	}
}

/// Serialize durations as integer milliseconds.
pub mod duration_ms {
	use serde::{Deserialize, Deserializer, Serialize, Serializer};
	use std::time::Duration;

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		(duration.as_millis() as u64).serialize(serializer)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let ms = u64::deserialize(deserializer)?;
		Ok(Duration::from_millis(ms))
	}

	pub mod option {
		use super::*;

		pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
		where
			S: Serializer,
		{
			duration
				.map(|d| d.as_millis() as u64)
				.serialize(serializer)
		}

		pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
		where
			D: Deserializer<'de>,
		{
			let ms = Option::<u64>::deserialize(deserializer)?;
			Ok(ms.map(Duration::from_millis))
		}
	}
}
