// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Layered configuration for `loom-codex`.
//!
//! Precedence, lowest first: built-in defaults, the TOML file, command line
//! flags.

use std::path::{Path, PathBuf};

use loom_codex_core::{AppServerCommand, ThreadOptions};
use loom_codex_orchestrator::{CreateSessionRequest, OrchestratorConfig};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "codex.toml";

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("TOML parse error in {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("Validation error: {0}")]
	Validation(String),
}

/// Settings for the thread each session opens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadSettings {
	pub cwd: Option<PathBuf>,
	pub model: Option<String>,
	pub reasoning_effort: Option<String>,
	/// When the agent asks before running commands, e.g. `on-request`.
	pub ask_for_approval: Option<String>,
	pub sandbox: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodexCliConfig {
	pub app_server: AppServerCommand,
	pub orchestrator: OrchestratorConfig,
	pub thread: ThreadSettings,
}

/// Values supplied on the command line. `None` leaves the lower layer alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
	pub codex_bin: Option<String>,
	pub model: Option<String>,
	pub cwd: Option<PathBuf>,
	pub reasoning_effort: Option<String>,
}

impl CodexCliConfig {
	/// Load defaults, then `explicit` or the user config file, then `overrides`.
	///
	/// A missing file at the default location is not an error; a missing
	/// file that was asked for is.
	pub fn load(explicit: Option<&Path>, overrides: &CliOverrides) -> Result<Self, ConfigError> {
		let mut config = match explicit {
			Some(path) => Self::from_file(path)?,
			None => match default_config_path() {
				Some(path) if path.exists() => Self::from_file(&path)?,
				_ => Self::default(),
			},
		};
		config.apply(overrides);
		config.validate()?;
		Ok(config)
	}

	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path)?;
		let config = toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
			path: path.to_path_buf(),
			source,
		})?;
		tracing::debug!(path = %path.display(), "loaded config file");
		Ok(config)
	}

	pub fn apply(&mut self, overrides: &CliOverrides) {
		if let Some(bin) = &overrides.codex_bin {
			self.app_server.program = bin.clone();
		}
		if let Some(model) = &overrides.model {
			self.thread.model = Some(model.clone());
		}
		if let Some(cwd) = &overrides.cwd {
			self.thread.cwd = Some(cwd.clone());
		}
		if let Some(effort) = &overrides.reasoning_effort {
			self.thread.reasoning_effort = Some(effort.clone());
		}
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		let orchestrator = &self.orchestrator;
		let client = &orchestrator.client;
		if self.app_server.program.trim().is_empty() {
			return Err(ConfigError::Validation("app_server.program is empty".into()));
		}
		if client.completion_grace.is_zero() {
			return Err(ConfigError::Validation(
				"orchestrator.client.completion_grace must be positive".into(),
			));
		}
		if client.interrupt_poll_interval.is_zero() {
			return Err(ConfigError::Validation(
				"orchestrator.client.interrupt_poll_interval must be positive".into(),
			));
		}
		if orchestrator.queue_poll_interval.is_zero() {
			return Err(ConfigError::Validation(
				"orchestrator.queue_poll_interval must be positive".into(),
			));
		}
		if orchestrator.queue_poll_interval > orchestrator.queue_timeout {
			return Err(ConfigError::Validation(
				"orchestrator.queue_poll_interval exceeds queue_timeout".into(),
			));
		}
		Ok(())
	}

	pub fn session_request(&self) -> CreateSessionRequest {
		CreateSessionRequest {
			thread: ThreadOptions {
				cwd: self.thread.cwd.clone(),
				model: self.thread.model.clone(),
				approval_policy: self.thread.ask_for_approval.clone(),
				sandbox: self.thread.sandbox.clone(),
			},
			reasoning_effort: self.thread.reasoning_effort.clone(),
		}
	}
}

/// `$XDG_CONFIG_HOME/loom/codex.toml`, falling back to `~/.config`.
pub fn default_config_path() -> Option<PathBuf> {
	let config_home = std::env::var_os("XDG_CONFIG_HOME")
		.map(PathBuf::from)
		.or_else(|| dirs::home_dir().map(|home| home.join(".config")))?;
	Some(config_home.join("loom").join(CONFIG_FILE_NAME))
}
